//! Account lifecycle: propose, approve, close
//!
//! A proposal binds one spare signer key and one spare observer key to the
//! holder and computes the on-chain account. It becomes an account only
//! after the holder's signature over `APPROVE:<proposal>:<address>`
//! verifies. Closing is the recovery path: observer-driven, time-locked,
//! and terminal for the account.

use crate::node::Node;
use crate::store::{Safe, SafeProposal, VaultTransaction};
use crate::KEY_BACKUP_MATURITY_SECS;
use chrono::Duration;
use covault_core::chain::bitcoin::{
    self as bitcoin_chain, derive_public_child, psbt_hash, sig_hash,
};
use covault_core::chain::ethereum::{self as ethereum_chain, GnosisSafe, SafeTransaction};
use covault_core::chain::verify_holder_key;
use covault_core::crypto::{
    approve_account_message, hash_message_for_signature, verify_ecdsa_der,
};
use covault_core::{
    unique_id, Action, Chain, Payment, Request, RequestState, Result, Role,
};
use bitcoin::Psbt;
use tracing::info;
use uuid::Uuid;

/// Compact derivation path of a freshly proposed account
pub const DEFAULT_DERIVATION_PATH: [u8; 4] = [0, 0, 0, 0];

impl Node {
    pub(crate) fn propose_account(&self, req: &Request) -> Result<Vec<Payment>> {
        // extra: chain, timelock hours u16, threshold, receiver count, uuids
        if req.extra.len() < 5 {
            return self.fail_request(req);
        }
        let chain = match self.request_chain(req, req.extra[0]) {
            Ok(chain) => chain,
            Err(_) => return self.fail_request(req),
        };
        let timelock_secs = u16::from_be_bytes([req.extra[1], req.extra[2]]) as u64 * 3_600;
        let threshold = req.extra[3];
        let count = req.extra[4] as usize;
        if threshold == 0 || count == 0 || threshold as usize > count {
            return self.fail_request(req);
        }
        if req.extra.len() != 5 + count * 16 {
            return self.fail_request(req);
        }
        let mut receivers = Vec::with_capacity(count);
        for i in 0..count {
            let offset = 5 + i * 16;
            match Uuid::from_slice(&req.extra[offset..offset + 16]) {
                Ok(id) => receivers.push(id.to_string()),
                Err(_) => return self.fail_request(req),
            }
        }

        let Some(params) = self.store.read_latest_operation_params(chain)? else {
            return self.fail_request(req);
        };
        if req.asset_id != params.price_asset || req.amount < params.price_amount {
            return self.fail_request(req);
        }
        if verify_holder_key(&req.holder, req.curve).is_err() {
            return self.fail_request(req);
        }
        if self.store.read_safe(&req.holder)?.is_some()
            || self.store.read_safe_proposal_by_holder(&req.holder)?.is_some()
        {
            return self.fail_request(req);
        }

        let matured = req.created_at - Duration::seconds(KEY_BACKUP_MATURITY_SECS);
        let curve = if chain.is_bitcoin_family() {
            covault_core::Curve::Secp256k1EcdsaBitcoin
        } else {
            covault_core::Curve::Secp256k1EcdsaEthereum
        };
        let signer = self.store.peek_spare_key(curve, Role::Signer, &matured)?;
        let observer = self.store.peek_spare_key(curve, Role::Observer, &matured)?;
        let (signer, observer) = match (signer, observer) {
            (Some(s), Some(o)) => (s, o),
            _ => return self.fail_request(req),
        };

        let signer_pub = hex::decode(&signer.public)?;
        let observer_pub = hex::decode(&observer.public)?;
        let derived_signer = hex::encode(derive_public_child(
            &signer_pub,
            &signer.chain_code,
            &DEFAULT_DERIVATION_PATH,
        )?);
        let derived_observer = hex::encode(derive_public_child(
            &observer_pub,
            &observer.chain_code,
            &DEFAULT_DERIVATION_PATH,
        )?);

        let (address, account_blob) = if chain.is_bitcoin_family() {
            let wsa = match bitcoin_chain::build_witness_account(
                &req.holder,
                &derived_signer,
                &derived_observer,
                timelock_secs,
                chain,
            ) {
                Ok(wsa) => wsa,
                Err(_) => return self.fail_request(req),
            };
            (wsa.address.clone(), wsa.marshal())
        } else {
            let (gs, _) = match ethereum_chain::build_gnosis_safe(
                &req.holder,
                &derived_signer,
                &derived_observer,
                &req.id,
                timelock_secs,
                chain,
            ) {
                Ok(built) => built,
                Err(_) => return self.fail_request(req),
            };
            (gs.address.clone(), gs.marshal())
        };

        let proposal = SafeProposal {
            request_id: req.id,
            chain,
            holder: req.holder.clone(),
            signer: signer.public.clone(),
            observer: observer.public.clone(),
            timelock_secs,
            address: address.clone(),
            extra: account_blob.clone(),
            receivers,
            threshold,
            created_at: req.created_at,
        };
        let bound = self
            .store
            .write_safe_proposal_with_request(&proposal, &matured)?;
        let Some((bound_signer, bound_observer)) = bound else {
            return self.fail_request(req);
        };
        assert_eq!(bound_signer.public, signer.public, "spare signer drifted");
        assert_eq!(bound_observer.public, observer.public, "spare observer drifted");

        info!(request = %req.id, address = %address, "account proposed");
        let ref_id = self.store_response_payload(&req.id, &account_blob)?;
        Ok(vec![self.build_observer_response(
            req.id,
            Action::SafeProposeAccount as u8,
            req.curve,
            ref_id.as_bytes().to_vec(),
        )])
    }

    pub(crate) fn approve_account(&self, req: &Request) -> Result<Vec<Payment>> {
        // extra: proposal request id, then the holder signature
        if req.extra.len() < 16 + 64 {
            return self.fail_request(req);
        }
        let rid = Uuid::from_slice(&req.extra[..16])?;
        let signature = &req.extra[16..];
        let Some(proposal) = self.store.read_safe_proposal(&rid)? else {
            return self.fail_request(req);
        };
        if self.store.read_safe(&proposal.holder)?.is_some() {
            return self.fail_request(req);
        }

        let message = approve_account_message(&rid, &proposal.address);
        let digest = hash_message_for_signature(&message, proposal.chain);
        let verified = if proposal.chain.is_bitcoin_family() {
            let holder_pub = hex::decode(&proposal.holder)?;
            verify_ecdsa_der(&holder_pub, &digest, signature).is_ok()
        } else {
            ethereum_chain::verify_hash_signature(&proposal.holder, &digest, signature).is_ok()
        };
        if !verified {
            return self.fail_request(req);
        }

        let safe = Safe {
            holder: proposal.holder.clone(),
            chain: proposal.chain,
            signer: proposal.signer.clone(),
            observer: proposal.observer.clone(),
            timelock_secs: proposal.timelock_secs,
            path: DEFAULT_DERIVATION_PATH.to_vec(),
            address: proposal.address.clone(),
            extra: proposal.extra.clone(),
            receivers: proposal.receivers.clone(),
            threshold: proposal.threshold,
            request_id: req.id,
            nonce: 0,
            state: RequestState::Done,
            created_at: req.created_at,
        };
        self.store.write_safe_with_request(&safe, &req.id)?;
        info!(request = %req.id, address = %safe.address, "account approved");

        let params = self
            .store
            .read_latest_operation_params(proposal.chain)?
            .expect("params existed at proposal");
        let ref_id = self.store_response_payload(&req.id, &proposal.extra)?;
        Ok(vec![self.build_observer_response_with_asset(
            req.id,
            Action::SafeApproveAccount as u8,
            req.curve,
            ref_id.as_bytes().to_vec(),
            params.price_asset,
            params.price_amount,
        )])
    }

    pub(crate) fn close_account(&self, req: &Request) -> Result<Vec<Payment>> {
        // extra: transaction request id (nil for the pre-signed variant),
        // then the 32-byte storage ref of the co-signed raw
        if req.extra.len() != 16 + 32 {
            return self.fail_request(req);
        }
        let rid = Uuid::from_slice(&req.extra[..16])?;
        let ref_key = hex::encode(&req.extra[16..48]);
        let Some(raw_hex) = self.store.read_property(&ref_key)? else {
            return self.fail_request(req);
        };
        let raw = hex::decode(raw_hex)?;

        if rid.is_nil() {
            self.close_account_with_holder_observer(req, &raw)
        } else {
            self.close_account_with_signer_observer(req, &rid, &raw)
        }
    }

    /// Variant (a): the observer co-signs a previously proposed recovery
    /// transaction, then the signer federation completes it
    fn close_account_with_signer_observer(
        &self,
        req: &Request,
        rid: &Uuid,
        raw: &[u8],
    ) -> Result<Vec<Payment>> {
        let Some(tx) = self.store.read_transaction_by_request(rid)? else {
            return self.fail_request(req);
        };
        if tx.state != RequestState::Initial {
            return self.fail_request(req);
        }
        let safe = self
            .store
            .read_safe(&tx.holder)?
            .expect("transaction without account");

        if safe.chain.is_bitcoin_family() {
            let Ok(psbt) = Psbt::deserialize(raw) else {
                return self.fail_request(req);
            };
            if psbt_hash(&psbt) != tx.transaction_hash {
                return self.fail_request(req);
            }
            let observer_key = self
                .store
                .read_key(&safe.observer)?
                .expect("observer key missing");
            let observer_pub = derive_public_child(
                &hex::decode(&safe.observer)?,
                &observer_key.chain_code,
                &safe.path,
            )?;

            for index in 0..psbt.inputs.len() {
                if !self.recovery_timelock_expired(&psbt, index, &safe)? {
                    return self.fail_request(req);
                }
                let digest = sig_hash(&psbt, index)?;
                let input = &psbt.inputs[index];
                if input.partial_sigs.len() != 1 {
                    return self.fail_request(req);
                }
                let (key, sig) = input.partial_sigs.iter().next().expect("one sig");
                if key.to_bytes() != observer_pub {
                    return self.fail_request(req);
                }
                if verify_ecdsa_der(&observer_pub, &digest, &sig.signature.serialize_der())
                    .is_err()
                {
                    return self.fail_request(req);
                }
            }

            // re-serialize with the observer signatures and queue the signer
            let requests = self.build_signature_requests(req, &psbt, &safe)?;
            let payments = self.dispatch_signature_requests(&req.id, &tx, &psbt.serialize(), &requests)?;
            info!(request = %req.id, hash = %tx.transaction_hash, "recovery co-signing started");
            Ok(payments)
        } else {
            let Ok(st) = SafeTransaction::unmarshal(raw) else {
                return self.fail_request(req);
            };
            if st.tx_hash()? != tx.transaction_hash {
                return self.fail_request(req);
            }
            if !self.ethereum_timelock_expired(&safe)? {
                return self.fail_request(req);
            }
            let observer_key = self
                .store
                .read_key(&safe.observer)?
                .expect("observer key missing");
            let observer_pub = hex::encode(derive_public_child(
                &hex::decode(&safe.observer)?,
                &observer_key.chain_code,
                &safe.path,
            )?);
            if !st.signed_by(&observer_pub) {
                return self.fail_request(req);
            }
            let requests = self.build_ethereum_signature_request(req, &st, &safe)?;
            let payments = self.dispatch_signature_requests(&req.id, &tx, &st.marshal(), &requests)?;
            Ok(payments)
        }
    }

    /// Variant (b): a holder+observer pre-signed recovery delivered whole;
    /// no signer participation needed. The payload shape selects the chain
    /// family: a PSBT for Bitcoin accounts, a marshaled contract
    /// transaction for Ethereum accounts.
    fn close_account_with_holder_observer(&self, req: &Request, raw: &[u8]) -> Result<Vec<Payment>> {
        if let Ok(psbt) = Psbt::deserialize(raw) {
            return self.close_bitcoin_with_holder_observer(req, psbt);
        }
        match SafeTransaction::unmarshal(raw) {
            Ok(st) => self.close_ethereum_with_holder_observer(req, st),
            Err(_) => self.fail_request(req),
        }
    }

    fn close_bitcoin_with_holder_observer(&self, req: &Request, psbt: Psbt) -> Result<Vec<Payment>> {
        let Some(close_rid) = bitcoin_chain::extract_request_id(&psbt.unsigned_tx) else {
            return self.fail_request(req);
        };

        // every input must spend the same account
        let mut safe: Option<Safe> = None;
        let mut assigned = Vec::with_capacity(psbt.unsigned_tx.input.len());
        for txin in &psbt.unsigned_tx.input {
            let outpoint = txin.previous_output;
            let Some(deposit) = self
                .store
                .read_deposit(&outpoint.txid.to_string(), outpoint.vout)?
            else {
                return self.fail_request(req);
            };
            let known = self
                .store
                .read_safe(&deposit.holder)?
                .expect("deposit without account");
            match &safe {
                None => safe = Some(known),
                Some(existing) => assert_eq!(
                    existing.holder, known.holder,
                    "recovery crosses accounts"
                ),
            }
            assigned.push((deposit.transaction_hash.clone(), deposit.output_index));
        }
        let Some(safe) = safe else {
            return self.fail_request(req);
        };
        if safe.state != RequestState::Done {
            return self.fail_request(req);
        }

        let observer_key = self
            .store
            .read_key(&safe.observer)?
            .expect("observer key missing");
        let observer_pub = derive_public_child(
            &hex::decode(&safe.observer)?,
            &observer_key.chain_code,
            &safe.path,
        )?;
        let holder_pub = hex::decode(&safe.holder)?;

        for index in 0..psbt.inputs.len() {
            if !self.recovery_timelock_expired(&psbt, index, &safe)? {
                return self.fail_request(req);
            }
            let digest = sig_hash(&psbt, index)?;
            let input = &psbt.inputs[index];
            let mut holder_signed = false;
            let mut observer_signed = false;
            for (key, sig) in &input.partial_sigs {
                let der = sig.signature.serialize_der();
                if key.to_bytes() == holder_pub {
                    holder_signed = verify_ecdsa_der(&holder_pub, &digest, &der).is_ok();
                } else if key.to_bytes() == observer_pub {
                    observer_signed = verify_ecdsa_der(&observer_pub, &digest, &der).is_ok();
                }
            }
            if !holder_signed || !observer_signed {
                return self.fail_request(req);
            }
        }

        let transaction = VaultTransaction {
            transaction_hash: psbt_hash(&psbt),
            request_id: close_rid,
            holder: safe.holder.clone(),
            chain: safe.chain,
            asset_id: Node::bond_asset_id(safe.chain, &safe.holder),
            data: "[]".to_string(),
            raw_transaction: psbt.serialize(),
            state: RequestState::Done,
            created_at: req.created_at,
        };
        self.store
            .write_closed_transaction_with_request(&transaction, &assigned, &req.id)?;
        info!(request = %req.id, hash = %transaction.transaction_hash, "account closed by holder+observer");

        let ref_id =
            self.store_response_payload(&req.id, &transaction.raw_transaction)?;
        Ok(vec![self.build_observer_response(
            unique_id(&transaction.transaction_hash, "APPROVE"),
            Action::SafeApproveTransaction as u8,
            req.curve,
            ref_id.as_bytes().to_vec(),
        )])
    }

    fn close_ethereum_with_holder_observer(
        &self,
        req: &Request,
        st: SafeTransaction,
    ) -> Result<Vec<Payment>> {
        let Some(safe) = self.store.read_safe_by_address(&st.safe_address)? else {
            return self.fail_request(req);
        };
        if safe.state != RequestState::Done || !safe.chain.is_ethereum_family() {
            return self.fail_request(req);
        }
        if st.chain_id != ethereum_chain::evm_chain_id(safe.chain)? {
            return self.fail_request(req);
        }
        if !self.ethereum_timelock_expired(&safe)? {
            return self.fail_request(req);
        }

        let observer_key = self
            .store
            .read_key(&safe.observer)?
            .expect("observer key missing");
        let observer_pub = hex::encode(derive_public_child(
            &hex::decode(&safe.observer)?,
            &observer_key.chain_code,
            &safe.path,
        )?);
        if !st.signed_by(&safe.holder) || !st.signed_by(&observer_pub) {
            return self.fail_request(req);
        }

        // consume every remaining output of the account
        let mut assigned = Vec::new();
        for deposit in self
            .store
            .list_spendable_deposits(&safe.holder, 256)?
            .into_iter()
            .chain(self.store.list_pending_deposits(&safe.holder)?)
        {
            assigned.push((deposit.transaction_hash, deposit.output_index));
        }

        let tx_hash = st.tx_hash()?;
        let transaction = VaultTransaction {
            transaction_hash: tx_hash.clone(),
            request_id: unique_id(&tx_hash, "CLOSE"),
            holder: safe.holder.clone(),
            chain: safe.chain,
            asset_id: Node::bond_asset_id(safe.chain, &safe.holder),
            data: "[]".to_string(),
            raw_transaction: st.marshal(),
            state: RequestState::Done,
            created_at: req.created_at,
        };
        self.store
            .write_closed_transaction_with_request(&transaction, &assigned, &req.id)?;
        info!(request = %req.id, hash = %tx_hash, "account closed by holder+observer");

        let ref_id =
            self.store_response_payload(&req.id, &transaction.raw_transaction)?;
        Ok(vec![self.build_observer_response(
            unique_id(&tx_hash, "APPROVE"),
            Action::SafeApproveTransaction as u8,
            req.curve,
            ref_id.as_bytes().to_vec(),
        )])
    }

    /// The recovery branch is only acceptable once the deposit has aged
    /// past the script time-lock at the keeper's latest view of the chain
    pub(crate) fn recovery_timelock_expired(
        &self,
        psbt: &Psbt,
        index: usize,
        safe: &Safe,
    ) -> Result<bool> {
        let outpoint = psbt.unsigned_tx.input[index].previous_output;
        let Some(deposit) = self
            .store
            .read_deposit(&outpoint.txid.to_string(), outpoint.vout)?
        else {
            return Ok(false);
        };
        let Some(info) = self.store.read_latest_network_info(safe.chain)? else {
            return Ok(false);
        };
        let lock = deposit.sequence as u64;
        Ok(info.height >= deposit.deposit_height + lock)
    }

    fn ethereum_timelock_expired(&self, safe: &Safe) -> Result<bool> {
        let Some(info) = self.store.read_latest_network_info(safe.chain)? else {
            return Ok(false);
        };
        let lock_blocks = safe.timelock_secs / safe.chain.block_time_secs();
        let mut deposits = self.store.list_spendable_deposits(&safe.holder, 256)?;
        deposits.extend(self.store.list_pending_deposits(&safe.holder)?);
        Ok(deposits
            .iter()
            .all(|d| info.height >= d.deposit_height + lock_blocks))
    }
}

/// Parse a marshaled account blob back into its proposal address, used by
/// observers resolving notifications
pub fn proposal_address(chain: Chain, blob: &[u8]) -> Result<String> {
    if chain.is_bitcoin_family() {
        Ok(bitcoin_chain::WitnessScriptAccount::unmarshal(blob)?.address)
    } else {
        Ok(GnosisSafe::unmarshal(blob)?.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proposal_address_parses_both_families() {
        let wsa = bitcoin_chain::build_witness_account(
            "039c2f5ebdd4eae6d69e7a98b737beeb78e0a8d42c7b957a0fbe0c41658d16ab40",
            "02339baf159c94cc116562d609097ff3c3bd340a34b9f7d50cc22b8d520301a7c9",
            "0333870af2985a674f28bb12290bb0eb403987c2211d9f26267cc4d45ae6797e7c",
            3_600,
            Chain::Bitcoin,
        )
        .unwrap();
        assert_eq!(
            proposal_address(Chain::Bitcoin, &wsa.marshal()).unwrap(),
            wsa.address
        );

        let gs = GnosisSafe {
            sequence: 24,
            address: "0x0000000000000000000000000000000000000001".into(),
            tx_hash: "0xabc".into(),
        };
        assert_eq!(
            proposal_address(Chain::Polygon, &gs.marshal()).unwrap(),
            gs.address
        );
    }
}
