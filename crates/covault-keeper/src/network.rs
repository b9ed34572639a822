//! Network-info and operation-params intake
//!
//! Observers push chain tips and fee estimates periodically. A record is
//! accepted only when the hash shape is right, the block exists at the
//! claimed height with non-negative confirmations, and the height is
//! monotone (or re-affirms the stored tip). Violations drop the record,
//! never the keeper.

use crate::node::Node;
use crate::store::{NetworkInfo, OperationParams};
use crate::{BITCOIN_MAXIMUM_FEE_RATE, BITCOIN_MINIMUM_FEE_RATE};
use covault_core::chain::verify_network_hash_shape;
use covault_core::{Payment, Request, Result};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

impl Node {
    /// `ObserverUpdateNetworkStatus`
    pub(crate) async fn update_network_status(&self, req: &Request) -> Result<Vec<Payment>> {
        // extra: chain, fee u64, height u64, 32-byte block hash
        if req.extra.len() != 49 {
            return self.fail_request(req);
        }
        let chain = match self.request_chain(req, req.extra[0]) {
            Ok(chain) => chain,
            Err(_) => return self.fail_request(req),
        };
        let fee = u64::from_be_bytes(req.extra[1..9].try_into().expect("8 bytes"));
        let height = u64::from_be_bytes(req.extra[9..17].try_into().expect("8 bytes"));
        let hash = if chain.is_bitcoin_family() {
            hex::encode(&req.extra[17..49])
        } else {
            format!("0x{}", hex::encode(&req.extra[17..49]))
        };
        if !verify_network_hash_shape(chain, &hash) {
            return self.fail_request(req);
        }
        if chain.is_bitcoin_family()
            && !(BITCOIN_MINIMUM_FEE_RATE..=BITCOIN_MAXIMUM_FEE_RATE).contains(&fee)
        {
            return self.fail_request(req);
        }

        let old = self.store.read_latest_network_info(chain)?;
        if let Some(old) = &old {
            if old.height > height {
                return self.fail_request(req);
            }
            if old.hash == hash {
                // re-affirmation must agree on the height
                assert_eq!(old.height, height, "conflicting block {hash}");
            }
        }

        let affirmed = old.as_ref().map(|o| o.hash == hash).unwrap_or(false);
        if !affirmed {
            let block = self
                .rpc
                .get_block(chain, &hash)
                .await
                .unwrap_or_else(|e| panic!("chain node unreachable for {hash}: {e}"));
            let Some(block) = block else {
                return self.fail_request(req);
            };
            if block.height != height || block.confirmations < 0 {
                return self.fail_request(req);
            }
        }

        self.store.write_network_info_with_request(&NetworkInfo {
            request_id: req.id,
            chain,
            fee,
            height,
            hash,
            created_at: req.created_at,
        })?;
        info!(request = %req.id, %chain, height, fee, "network info accepted");
        Ok(Vec::new())
    }

    /// `ObserverSetOperationParams`
    pub(crate) fn set_operation_params(&self, req: &Request) -> Result<Vec<Payment>> {
        // extra: chain, price asset uuid, price u64, minimum u64 (8 decimals)
        if req.extra.len() != 33 {
            return self.fail_request(req);
        }
        let chain = match self.request_chain(req, req.extra[0]) {
            Ok(chain) => chain,
            Err(_) => return self.fail_request(req),
        };
        let Ok(price_asset) = Uuid::from_slice(&req.extra[1..17]) else {
            return self.fail_request(req);
        };
        let price = u64::from_be_bytes(req.extra[17..25].try_into().expect("8 bytes"));
        let minimum = u64::from_be_bytes(req.extra[25..33].try_into().expect("8 bytes"));
        if price == 0 || minimum == 0 {
            return self.fail_request(req);
        }

        self.store
            .write_operation_params_with_request(&OperationParams {
                request_id: req.id,
                chain,
                price_asset: price_asset.to_string(),
                price_amount: Decimal::new(price as i64, 8).normalize(),
                transaction_minimum: Decimal::new(minimum as i64, 8).normalize(),
                created_at: req.created_at,
            })?;
        info!(request = %req.id, %chain, "operation params updated");
        Ok(Vec::new())
    }
}
