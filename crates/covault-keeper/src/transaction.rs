//! Spend lifecycle: propose, approve, revoke, and signer-response intake
//!
//! The bond asset is the payment rail: a holder proposes a spend by
//! transferring exactly the spend amount in the account's bond asset, and
//! the keeper's possession of that bond is the economic authorization.

use crate::node::Node;
use crate::store::{Safe, SignatureRequest, VaultTransaction};
use crate::{BITCOIN_MAXIMUM_FEE_RATE, BITCOIN_MINIMUM_FEE_RATE, NETWORK_INFO_STALENESS_BLOCKS};
use bitcoin::Psbt;
use chrono::Duration;
use covault_core::chain::bitcoin::{
    self as bitcoin_chain, add_partial_signature, build_partially_signed_transaction,
    derive_public_child, estimate_virtual_size, psbt_hash, sig_hash, value_dust, Input,
    MAX_TRANSACTION_SEQUENCE,
};
use covault_core::chain::ethereum::{self as ethereum_chain, SafeTransaction};
use covault_core::crypto::{
    hash_message_for_signature, revoke_transaction_message, verify_ecdsa_der,
};
use covault_core::operation::OPERATION_TYPE_SIGN_INPUT;
use covault_core::{
    fingerprint, unique_id, Action, Operation, Payment, Request, RequestState, Result,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

#[derive(Serialize)]
struct OutputSummary<'a> {
    amount: String,
    receiver: &'a str,
}

impl Node {
    pub(crate) fn propose_transaction(&self, req: &Request) -> Result<Vec<Payment>> {
        // extra: flags, network-info request id, receiver address
        if req.extra.len() < 1 + 16 + 4 {
            return self.fail_request(req);
        }
        let flags = req.extra[0];
        if flags > 1 {
            return self.fail_request(req);
        }
        let info_rid = Uuid::from_slice(&req.extra[1..17])?;
        let Ok(receiver) = String::from_utf8(req.extra[17..].to_vec()) else {
            return self.fail_request(req);
        };

        let Some(safe) = self.store.read_safe(&req.holder)? else {
            return self.fail_request(req);
        };
        if safe.state != RequestState::Done {
            return self.fail_request(req);
        }
        if !req.curve.supports_chain(safe.chain) {
            return self.fail_request(req);
        }
        // the bond transfer is the authorization to spend
        if req.asset_id != Node::bond_asset_id(safe.chain, &safe.holder) {
            return self.fail_request(req);
        }

        let Some(params) = self.store.read_latest_operation_params(safe.chain)? else {
            return self.fail_request(req);
        };
        if flags == 0 && req.amount < params.transaction_minimum {
            return self.fail_request(req);
        }

        let Some(info) = self.store.read_latest_network_info(safe.chain)? else {
            return self.fail_request(req);
        };
        if info.request_id != info_rid {
            return self.fail_request(req);
        }
        let staleness =
            Duration::seconds((NETWORK_INFO_STALENESS_BLOCKS * safe.chain.block_time_secs()) as i64);
        if req.created_at - info.created_at > staleness {
            return self.fail_request(req);
        }

        if safe.chain.is_bitcoin_family() {
            if !(BITCOIN_MINIMUM_FEE_RATE..=BITCOIN_MAXIMUM_FEE_RATE).contains(&info.fee) {
                return self.fail_request(req);
            }
            self.propose_bitcoin_transaction(req, &safe, flags, &receiver, info.fee)
        } else {
            self.propose_ethereum_transaction(req, &safe, flags, &receiver)
        }
    }

    fn propose_bitcoin_transaction(
        &self,
        req: &Request,
        safe: &Safe,
        flags: u8,
        receiver: &str,
        fee_rate: u64,
    ) -> Result<Vec<Payment>> {
        if bitcoin_chain::verify_address(receiver, safe.chain).is_err() {
            return self.fail_request(req);
        }
        let Some(amount_sats) = (req.amount * Decimal::from(100_000_000u64)).to_u64() else {
            return self.fail_request(req);
        };
        if req.amount.scale() > 8 || amount_sats < value_dust(safe.chain) && flags == 0 {
            return self.fail_request(req);
        }

        let spendable = self.store.list_spendable_deposits(&safe.holder, 256)?;
        let mut inputs: Vec<Input> = Vec::new();
        let mut total = 0u64;
        let (outputs, assigned) = if flags == 1 {
            // recovery: drain every spendable output through the time-locked
            // branch, no change
            for deposit in &spendable {
                total += deposit.satoshi;
                inputs.push(Input {
                    transaction_hash: deposit.transaction_hash.clone(),
                    index: deposit.output_index,
                    satoshi: deposit.satoshi,
                    script: bitcoin::ScriptBuf::from_bytes(deposit.script.clone()),
                    sequence: deposit.sequence,
                });
            }
            if inputs.is_empty() {
                return self.fail_request(req);
            }
            // the bond transfer must cover the drained value exactly
            if amount_sats != total {
                return self.fail_request(req);
            }
            (vec![(receiver.to_string(), total)], inputs_keys(&inputs))
        } else {
            // greedy oldest-first until the sum covers amount + fee estimate
            let mut funded = false;
            for deposit in &spendable {
                total += deposit.satoshi;
                inputs.push(Input {
                    transaction_hash: deposit.transaction_hash.clone(),
                    index: deposit.output_index,
                    satoshi: deposit.satoshi,
                    script: bitcoin::ScriptBuf::from_bytes(deposit.script.clone()),
                    sequence: MAX_TRANSACTION_SEQUENCE,
                });
                let fee = estimate_virtual_size(inputs.len(), 3) * fee_rate;
                if total >= amount_sats + fee {
                    funded = true;
                    break;
                }
            }
            if !funded {
                return self.fail_request(req);
            }
            let mut outputs = vec![(receiver.to_string(), amount_sats)];
            let change = total - amount_sats;
            if change > value_dust(safe.chain) {
                outputs.push((safe.address.clone(), change));
            }
            (outputs, inputs_keys(&inputs))
        };

        let psbt = build_partially_signed_transaction(&inputs, &outputs, &req.id, safe.chain)?;
        let hash = psbt_hash(&psbt);
        let raw = psbt.serialize();
        let data = serde_json::to_string(&[OutputSummary {
            amount: req.amount.normalize().to_string(),
            receiver,
        }])?;

        let transaction = VaultTransaction {
            transaction_hash: hash.clone(),
            request_id: req.id,
            holder: safe.holder.clone(),
            chain: safe.chain,
            asset_id: req.asset_id.clone(),
            data,
            raw_transaction: raw.clone(),
            state: RequestState::Initial,
            created_at: req.created_at,
        };
        self.store
            .write_transaction_with_request(&transaction, &assigned)?;
        info!(request = %req.id, hash = %hash, inputs = inputs.len(), "spend proposed");

        let ref_id = self.store_response_payload(&req.id, &raw)?;
        Ok(vec![self.build_observer_response(
            req.id,
            Action::SafeProposeTransaction as u8,
            req.curve,
            ref_id.as_bytes().to_vec(),
        )])
    }

    fn propose_ethereum_transaction(
        &self,
        req: &Request,
        safe: &Safe,
        flags: u8,
        receiver: &str,
    ) -> Result<Vec<Payment>> {
        let Ok(to) = receiver.parse::<alloy_primitives::Address>() else {
            return self.fail_request(req);
        };
        // the bond tracks 8 decimals
        let Some(need) = (req.amount * Decimal::from(100_000_000u64)).to_u64() else {
            return self.fail_request(req);
        };
        if req.amount.scale() > 8 {
            return self.fail_request(req);
        }

        let spendable = self.store.list_spendable_deposits(&safe.holder, 256)?;
        let mut assigned = Vec::new();
        let mut total = 0u64;
        if flags == 1 {
            // recovery: drain every remaining output
            for deposit in &spendable {
                total += deposit.satoshi;
                assigned.push((deposit.transaction_hash.clone(), deposit.output_index));
            }
            if assigned.is_empty() || total != need {
                return self.fail_request(req);
            }
        } else {
            for deposit in &spendable {
                if total >= need {
                    break;
                }
                total += deposit.satoshi;
                assigned.push((deposit.transaction_hash.clone(), deposit.output_index));
            }
            if total < need {
                return self.fail_request(req);
            }
        }

        let value = alloy_primitives::U256::from(need as u128)
            * alloy_primitives::U256::from(10_000_000_000u64);
        let st = SafeTransaction::new(
            ethereum_chain::evm_chain_id(safe.chain)?,
            &safe.address,
            &to.to_checksum(None),
            value,
            Vec::new(),
            safe.nonce,
        );
        let hash = st.tx_hash()?;
        let raw = st.marshal();

        let data = serde_json::to_string(&[OutputSummary {
            amount: req.amount.normalize().to_string(),
            receiver,
        }])?;
        let transaction = VaultTransaction {
            transaction_hash: hash.clone(),
            request_id: req.id,
            holder: safe.holder.clone(),
            chain: safe.chain,
            asset_id: req.asset_id.clone(),
            data,
            raw_transaction: raw.clone(),
            state: RequestState::Initial,
            created_at: req.created_at,
        };
        self.store
            .write_transaction_with_request(&transaction, &assigned)?;
        self.store.increment_safe_nonce(&safe.holder)?;
        info!(request = %req.id, hash = %hash, "contract spend proposed");

        let ref_id = self.store_response_payload(&req.id, &raw)?;
        Ok(vec![self.build_observer_response(
            req.id,
            Action::SafeProposeTransaction as u8,
            req.curve,
            ref_id.as_bytes().to_vec(),
        )])
    }

    pub(crate) fn approve_transaction(&self, req: &Request) -> Result<Vec<Payment>> {
        // extra: transaction request id, then the 32-byte storage ref of
        // the holder-signed raw
        if req.extra.len() != 16 + 32 {
            return self.fail_request(req);
        }
        let rid = Uuid::from_slice(&req.extra[..16])?;
        let ref_key = hex::encode(&req.extra[16..48]);
        let Some(tx) = self.store.read_transaction_by_request(&rid)? else {
            return self.fail_request(req);
        };
        if tx.state != RequestState::Initial {
            return self.fail_request(req);
        }
        let safe = self
            .store
            .read_safe(&tx.holder)?
            .expect("transaction without account");
        let Some(raw_hex) = self.store.read_property(&ref_key)? else {
            return self.fail_request(req);
        };
        let raw = hex::decode(raw_hex)?;

        if safe.chain.is_bitcoin_family() {
            let Ok(psbt) = Psbt::deserialize(&raw) else {
                return self.fail_tx(req, &tx);
            };
            if psbt_hash(&psbt) != tx.transaction_hash {
                return self.fail_tx(req, &tx);
            }
            let holder_pub = hex::decode(&safe.holder)?;
            for index in 0..psbt.inputs.len() {
                let digest = sig_hash(&psbt, index)?;
                let input = &psbt.inputs[index];
                if input.partial_sigs.len() != 1 {
                    return self.fail_tx(req, &tx);
                }
                let (key, sig) = input.partial_sigs.iter().next().expect("one sig");
                if key.to_bytes() != holder_pub {
                    return self.fail_tx(req, &tx);
                }
                if verify_ecdsa_der(&holder_pub, &digest, &sig.signature.serialize_der()).is_err()
                {
                    return self.fail_tx(req, &tx);
                }
            }

            let requests = self.build_signature_requests(req, &psbt, &safe)?;
            let payments = self.dispatch_signature_requests(&req.id, &tx, &psbt.serialize(), &requests)?;
            info!(request = %req.id, hash = %tx.transaction_hash, "spend approved by holder");
            Ok(payments)
        } else {
            let Ok(st) = SafeTransaction::unmarshal(&raw) else {
                return self.fail_tx(req, &tx);
            };
            if st.tx_hash()? != tx.transaction_hash || !st.signed_by(&safe.holder) {
                return self.fail_tx(req, &tx);
            }
            let requests = self.build_ethereum_signature_request(req, &st, &safe)?;
            let payments = self.dispatch_signature_requests(&req.id, &tx, &st.marshal(), &requests)?;
            Ok(payments)
        }
    }

    pub(crate) fn revoke_transaction(&self, req: &Request) -> Result<Vec<Payment>> {
        // extra: transaction request id, then the revoking signature
        if req.extra.len() < 16 + 64 {
            return self.fail_request(req);
        }
        let rid = Uuid::from_slice(&req.extra[..16])?;
        let signature = &req.extra[16..];
        let Some(tx) = self.store.read_transaction_by_request(&rid)? else {
            return self.fail_request(req);
        };
        if !matches!(tx.state, RequestState::Initial | RequestState::Pending) {
            return self.fail_request(req);
        }
        let safe = self
            .store
            .read_safe(&tx.holder)?
            .expect("transaction without account");

        let message = revoke_transaction_message(&rid, &tx.transaction_hash);
        let digest = hash_message_for_signature(&message, safe.chain);

        let verified = if safe.chain.is_bitcoin_family() {
            let holder_pub = hex::decode(&safe.holder)?;
            let observer_key = self
                .store
                .read_key(&safe.observer)?
                .expect("observer key missing");
            let observer_pub = derive_public_child(
                &hex::decode(&safe.observer)?,
                &observer_key.chain_code,
                &safe.path,
            )?;
            verify_ecdsa_der(&holder_pub, &digest, signature).is_ok()
                || verify_ecdsa_der(&observer_pub, &digest, signature).is_ok()
        } else {
            ethereum_chain::verify_hash_signature(&safe.holder, &digest, signature).is_ok()
                || ethereum_chain::verify_hash_signature(&safe.observer, &digest, signature)
                    .is_ok()
        };
        if !verified {
            return self.fail_request(req);
        }

        self.store
            .fail_transaction_with_request(&tx.transaction_hash, &req.id)?;
        info!(request = %req.id, hash = %tx.transaction_hash, "spend revoked");
        Ok(Vec::new())
    }

    /// A signer federation response for one signature request
    pub(crate) fn sign_output(&self, req: &Request) -> Result<Vec<Payment>> {
        let Some(sig_req) = self.store.read_signature_request(&req.id)? else {
            return self.fail_request(req);
        };
        if sig_req.state == RequestState::Done {
            // redelivered session result
            self.store.finish_request(&req.id, RequestState::Done)?;
            return Ok(Vec::new());
        }
        if sig_req.state == RequestState::Failed {
            // the transaction was revoked while the session was running
            return self.fail_request(req);
        }
        let tx = self
            .store
            .read_transaction(&sig_req.transaction_hash)?
            .expect("signature request without transaction");
        let safe = self
            .store
            .read_safe(&tx.holder)?
            .expect("transaction without account");
        let signer_key = self
            .store
            .read_key(&safe.signer)?
            .expect("signer key missing");
        let signer_pub = derive_public_child(
            &hex::decode(&safe.signer)?,
            &signer_key.chain_code,
            &safe.path,
        )?;

        let (signature, updated_raw) = if safe.chain.is_bitcoin_family() {
            let message: [u8; 32] = sig_req
                .message
                .clone()
                .try_into()
                .expect("sighash must be 32 bytes");
            verify_ecdsa_der(&signer_pub, &message, &req.extra)
                .expect("signer pool returned an invalid signature");
            let mut psbt = Psbt::deserialize(&tx.raw_transaction)
                .expect("stored raw must parse");
            add_partial_signature(
                &mut psbt,
                sig_req.input_index as usize,
                &signer_pub,
                &req.extra,
            )?;
            (req.extra.clone(), psbt.serialize())
        } else {
            let mut st =
                SafeTransaction::unmarshal(&tx.raw_transaction).expect("stored raw must parse");
            st.add_signature(req.extra.clone())
                .expect("signer pool returned an invalid signature");
            assert!(
                st.signed_by(&hex::encode(&signer_pub)),
                "signer pool signature does not recover to the derived key"
            );
            (req.extra.clone(), st.marshal())
        };

        let all_done = self.store.finish_signature_request(
            &req.id,
            &sig_req.transaction_hash,
            &signature,
            &updated_raw,
        )?;
        self.store.finish_request(&req.id, RequestState::Done)?;
        if !all_done {
            return Ok(Vec::new());
        }

        // fully signed: notify the observer with the combined raw
        info!(hash = %sig_req.transaction_hash, "all inputs signed");
        let response_id = unique_id(&sig_req.transaction_hash, "APPROVE");
        let ref_id = self.store_response_payload(&response_id, &updated_raw)?;
        let payment = self.build_observer_response(
            response_id,
            Action::SafeApproveTransaction as u8,
            req.curve,
            ref_id.as_bytes().to_vec(),
        );

        // the spend is final: consume the deposits, and a completed
        // recovery also closes the account
        let recovery = if safe.chain.is_bitcoin_family() {
            let psbt = Psbt::deserialize(&updated_raw).expect("updated raw must parse");
            psbt.unsigned_tx
                .input
                .iter()
                .any(|i| i.sequence.0 != MAX_TRANSACTION_SEQUENCE)
        } else {
            // contract recoveries carry the drain flag in their proposal
            self.store
                .read_request(&tx.request_id)?
                .map(|r| r.extra.first() == Some(&1))
                .unwrap_or(false)
        };
        if recovery {
            self.store
                .close_safe_with_transaction(&safe.holder, &sig_req.transaction_hash)?;
            info!(holder = %safe.holder, "account closed by signer+observer recovery");
        } else {
            self.store
                .spend_assigned_deposits(&sig_req.transaction_hash)?;
        }
        Ok(vec![payment])
    }

    /// Shared helper: fail the transaction, release its deposits, fail the
    /// carrying request
    fn fail_tx(&self, req: &Request, tx: &VaultTransaction) -> Result<Vec<Payment>> {
        self.store
            .fail_transaction_with_request(&tx.transaction_hash, &req.id)?;
        self.store.finish_request(&req.id, RequestState::Failed)?;
        Ok(Vec::new())
    }

    /// One signature request per PSBT input
    pub(crate) fn build_signature_requests(
        &self,
        req: &Request,
        psbt: &Psbt,
        safe: &Safe,
    ) -> Result<Vec<SignatureRequest>> {
        let mut requests = Vec::with_capacity(psbt.inputs.len());
        for index in 0..psbt.inputs.len() {
            let digest = sig_hash(psbt, index)?;
            requests.push(SignatureRequest {
                request_id: unique_id(&req.id.to_string(), &format!("{index:8}")),
                transaction_hash: psbt_hash(psbt),
                input_index: index as u32,
                signer: safe.signer.clone(),
                curve: req.curve,
                message: digest.to_vec(),
                signature: None,
                state: RequestState::Initial,
                created_at: req.created_at,
            });
        }
        Ok(requests)
    }

    pub(crate) fn build_ethereum_signature_request(
        &self,
        req: &Request,
        st: &SafeTransaction,
        safe: &Safe,
    ) -> Result<Vec<SignatureRequest>> {
        Ok(vec![SignatureRequest {
            request_id: unique_id(&req.id.to_string(), &format!("{:8}", 0)),
            transaction_hash: st.tx_hash()?,
            input_index: 0,
            signer: safe.signer.clone(),
            curve: req.curve,
            message: st.hash_digest()?.to_vec(),
            signature: None,
            state: RequestState::Pending,
            created_at: req.created_at,
        }])
    }

    /// Persist the signature requests and emit one signer session per input
    pub(crate) fn dispatch_signature_requests(
        &self,
        approving_request: &Uuid,
        tx: &VaultTransaction,
        raw: &[u8],
        requests: &[SignatureRequest],
    ) -> Result<Vec<Payment>> {
        self.store.request_transaction_signatures(
            &tx.transaction_hash,
            raw,
            requests,
            approving_request,
        )?;
        self.store
            .mark_signature_requests_pending(&tx.transaction_hash)?;

        let mut payments = Vec::with_capacity(requests.len());
        for request in requests {
            let mut public = fingerprint(&hex::decode(&request.signer)?).to_vec();
            public.extend_from_slice(&tx_safe_path(self, &tx.holder)?);
            let op = Operation {
                id: request.request_id,
                op_type: OPERATION_TYPE_SIGN_INPUT,
                curve: request.curve as u8,
                public,
                extra: request.message.clone(),
            };
            payments.push(self.build_signer_payment(&op));
        }
        Ok(payments)
    }
}

fn inputs_keys(inputs: &[Input]) -> Vec<(String, u32)> {
    inputs
        .iter()
        .map(|i| (i.transaction_hash.clone(), i.index))
        .collect()
}

fn tx_safe_path(node: &Node, holder: &str) -> Result<Vec<u8>> {
    Ok(node
        .store()
        .read_safe(holder)?
        .expect("transaction without account")
        .path)
}
