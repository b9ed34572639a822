//! Confirmed-deposit intake and bond minting
//!
//! Observers report a deposit only after it reaches the chain's
//! confirmation depth. The keeper records the output and mints the exact
//! amount in the account's bond asset to the account receivers; a
//! redelivered or duplicate `(hash, index)` never mints twice.

use crate::node::Node;
use crate::store::Deposit;
use covault_core::chain::bitcoin::{value_dust, WitnessScriptAccount};
use covault_core::{unique_id, Payment, Request, RequestState, Result};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

impl Node {
    /// `ObserverHolderDeposit`
    pub(crate) fn holder_deposit(&self, req: &Request) -> Result<Vec<Payment>> {
        // extra: chain, asset uuid, 32-byte tx hash, output index u64,
        // big-endian amount
        if req.extra.len() < 1 + 16 + 32 + 8 + 1 {
            return self.fail_request(req);
        }
        let chain = match self.request_chain(req, req.extra[0]) {
            Ok(chain) => chain,
            Err(_) => return self.fail_request(req),
        };
        let Ok(asset) = Uuid::from_slice(&req.extra[1..17]) else {
            return self.fail_request(req);
        };
        if asset.to_string() != chain.asset_id() {
            return self.fail_request(req);
        }
        let hash = hex::encode(&req.extra[17..49]);
        let index = u64::from_be_bytes(req.extra[49..57].try_into().expect("8 bytes")) as u32;
        let amount_bytes = &req.extra[57..];
        if amount_bytes.len() > 8 {
            return self.fail_request(req);
        }
        let mut satoshi = 0u64;
        for b in amount_bytes {
            satoshi = satoshi << 8 | *b as u64;
        }
        if chain.is_bitcoin_family() && satoshi < value_dust(chain) {
            return self.fail_request(req);
        }

        let Some(safe) = self.store.read_safe(&req.holder)? else {
            return self.fail_request(req);
        };
        if safe.state != RequestState::Done || safe.chain != chain {
            return self.fail_request(req);
        }

        if self.store.read_deposit(&hash, index)?.is_some() {
            // redelivered notification: the bond was already minted
            self.store.finish_request(&req.id, RequestState::Done)?;
            return Ok(Vec::new());
        }

        // the recovery time-lock counts from the tip the keeper knew when
        // the deposit was recorded
        let Some(network) = self.store.read_latest_network_info(chain)? else {
            return self.fail_request(req);
        };

        let (script, sequence) = if chain.is_bitcoin_family() {
            let wsa = WitnessScriptAccount::unmarshal(&safe.extra)
                .expect("stored account blob must parse");
            (wsa.script.into_bytes(), wsa.sequence)
        } else {
            let blocks = (safe.timelock_secs / chain.block_time_secs()).max(1) as u32;
            (Vec::new(), blocks)
        };

        let deposit = Deposit {
            transaction_hash: hash.clone(),
            output_index: index,
            address: safe.address.clone(),
            satoshi,
            chain,
            holder: safe.holder.clone(),
            script,
            sequence,
            deposit_height: network.height,
            state: RequestState::Initial,
            spent_by: None,
            request_id: req.id.to_string(),
            created_at: req.created_at,
        };
        let fresh = self.store.write_deposit_with_request(&deposit, &req.id)?;
        assert!(fresh, "deposit {hash}:{index} raced its existence check");
        info!(request = %req.id, hash = %hash, index, satoshi, "deposit credited");

        // mint the bond mirroring the locked value
        Ok(vec![Payment::new(
            unique_id(&req.id.to_string(), "BOND-MINT"),
            Node::bond_asset_id(chain, &safe.holder),
            Decimal::new(satoshi as i64, 8).normalize(),
            Vec::new(),
            safe.receivers.clone(),
            safe.threshold,
        )])
    }
}
