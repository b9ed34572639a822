//! The keeper node: a single-consumer loop over ordered transport outputs
//!
//! Routing is by the asset an output carries: the observer asset selects
//! observer actions, the keeper's own asset selects signer session results,
//! and anything else is a holder action paid in the price or bond asset.
//! Memos on the first two routes are encrypted under the respective
//! role-pair key; holder memos travel in the clear because the payment
//! itself is the authorization.

use crate::store::Store;
use covault_core::chain::ChainRpc;
use covault_core::crypto::{decrypt_operation, encrypt_operation, shared_key};
use covault_core::operation::{OPERATION_TYPE_KEYGEN_OUTPUT, OPERATION_TYPE_SIGN_OUTPUT};
use covault_core::{
    unique_id, Action, Chain, Curve, Error, MtgOutput, Operation, Payment, Request, RequestState,
    Result, Role, OPERATION_MEMO_LIMIT,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Static keeper configuration
#[derive(Clone)]
pub struct KeeperConf {
    /// Transport application id of this keeper group
    pub app_id: String,
    /// Asset routing signer session results (and funding signer requests)
    pub keeper_asset_id: String,
    /// Asset routing observer actions
    pub observer_asset_id: String,
    /// Transport identity observer responses are addressed to
    pub observer_user_id: String,
    /// Signer federation members and threshold
    pub signer_members: Vec<String>,
    pub signer_threshold: u8,
    /// This node's X25519 identity
    pub node_private_key: [u8; 32],
    /// Long-term X25519 identities of the other two roles
    pub observer_public_key: [u8; 32],
    pub signer_public_key: [u8; 32],
}

/// The keeper state machine
pub struct Node {
    pub(crate) store: Store,
    pub(crate) conf: KeeperConf,
    pub(crate) observer_aes_key: [u8; 32],
    pub(crate) signer_aes_key: [u8; 32],
    pub(crate) rpc: Arc<dyn ChainRpc>,
}

impl Node {
    pub fn new(store: Store, conf: KeeperConf, rpc: Arc<dyn ChainRpc>) -> Self {
        let observer_aes_key = shared_key(&conf.node_private_key, &conf.observer_public_key);
        let signer_aes_key = shared_key(&conf.node_private_key, &conf.signer_public_key);
        Self {
            store,
            conf,
            observer_aes_key,
            signer_aes_key,
            rpc,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Process one ordered output. Returns the payments to emit and, when
    /// the keeper cannot fund them, the shortage asset id; the transport's
    /// redelivery of the same output is the retry mechanism.
    ///
    /// Redelivering an already-handled output returns the identical
    /// payment list.
    pub async fn process_output(&self, output: &MtgOutput) -> (Vec<Payment>, Option<String>) {
        let req = match self.parse_request(output) {
            Some(req) => req,
            None => {
                // a bare deposit: only increases the keeper balance
                self.store
                    .credit_balance(&output.asset_id, output.amount)
                    .expect("store credit");
                return (Vec::new(), None);
            }
        };

        let rid = req.id.to_string();
        if let Some((payments, funded)) = self
            .store
            .read_action_result(&output.output_id, &rid)
            .expect("store action result")
        {
            if funded {
                return (payments, None);
            }
            return self.settle(&output.output_id, &rid, payments);
        }

        self.store
            .credit_balance(&output.asset_id, output.amount)
            .expect("store credit");

        let fresh = self
            .store
            .write_request_if_not_exists(&req)
            .expect("store request");
        let payments = if fresh {
            match self.dispatch(&req).await {
                Ok(payments) => payments,
                Err(err) => panic!("keeper dispatch {}: {err}", req.id),
            }
        } else {
            // the same request carried by a different output is a no-op
            Vec::new()
        };

        self.store
            .write_action_result(&output.output_id, &rid, &payments)
            .expect("store action result");
        self.settle(&output.output_id, &rid, payments)
    }

    fn settle(
        &self,
        output_id: &str,
        request_id: &str,
        payments: Vec<Payment>,
    ) -> (Vec<Payment>, Option<String>) {
        match self.store.debit_payments(&payments).expect("store debit") {
            Some(asset) => {
                warn!(request = request_id, asset = %asset, "asset shortage, awaiting redelivery");
                (Vec::new(), Some(asset))
            }
            None => {
                self.store
                    .mark_action_result_funded(output_id, request_id)
                    .expect("store funded");
                (payments, None)
            }
        }
    }

    fn parse_request(&self, output: &MtgOutput) -> Option<Request> {
        let (role, plain) = if output.asset_id == self.conf.observer_asset_id {
            if !output.senders.is_empty()
                && !output.senders.contains(&self.conf.observer_user_id)
            {
                warn!(output = %output.output_id, "observer action from unknown sender");
                return None;
            }
            (
                Role::Observer,
                decrypt_operation(&self.observer_aes_key, &output.memo).ok()?,
            )
        } else if output.asset_id == self.conf.keeper_asset_id {
            (
                Role::Signer,
                decrypt_operation(&self.signer_aes_key, &output.memo).ok()?,
            )
        } else {
            (Role::Holder, output.memo.clone())
        };

        let op = Operation::decode(&plain).ok()?;
        let curve = Curve::from_byte(op.curve).ok()?;
        Some(Request {
            id: op.id,
            output_id: output.output_id.clone(),
            sequence: output.sequence,
            asset_id: output.asset_id.clone(),
            amount: output.amount,
            role,
            action: op.op_type,
            curve,
            holder: op.public_hex(),
            extra: op.extra,
            state: RequestState::Initial,
            created_at: output.created_at,
        })
    }

    async fn dispatch(&self, req: &Request) -> Result<Vec<Payment>> {
        info!(
            request = %req.id,
            role = %req.role,
            action = req.action,
            "keeper action"
        );
        match (req.role, req.action) {
            (Role::Holder, a) if a == Action::SafeProposeAccount as u8 => {
                self.propose_account(req)
            }
            (Role::Observer, a) if a == Action::SafeApproveAccount as u8 => {
                self.approve_account(req)
            }
            (Role::Holder, a) if a == Action::SafeProposeTransaction as u8 => {
                self.propose_transaction(req)
            }
            (Role::Observer, a) if a == Action::SafeApproveTransaction as u8 => {
                self.approve_transaction(req)
            }
            (Role::Observer, a) if a == Action::SafeRevokeTransaction as u8 => {
                self.revoke_transaction(req)
            }
            (Role::Observer, a) if a == Action::SafeCloseAccount as u8 => {
                self.close_account(req)
            }
            (Role::Observer, a) if a == Action::ObserverHolderDeposit as u8 => {
                self.holder_deposit(req)
            }
            (Role::Observer, a) if a == Action::ObserverSetOperationParams as u8 => {
                self.set_operation_params(req)
            }
            (Role::Observer, a) if a == Action::ObserverUpdateNetworkStatus as u8 => {
                self.update_network_status(req).await
            }
            (Role::Observer, a) if a == Action::ObserverAddKey as u8 => self.add_observer_key(req),
            (Role::Observer, a) if a == Action::ObserverRequestSignerKeys as u8 => {
                self.request_signer_keys(req)
            }
            (Role::Signer, OPERATION_TYPE_KEYGEN_OUTPUT) => self.keygen_output(req),
            (Role::Signer, OPERATION_TYPE_SIGN_OUTPUT) => self.sign_output(req),
            _ => {
                warn!(request = %req.id, role = %req.role, action = req.action, "unauthorized action");
                self.fail_request(req)
            }
        }
    }

    /// Validation failure: the request ends Failed and is never retried
    pub(crate) fn fail_request(&self, req: &Request) -> Result<Vec<Payment>> {
        self.store.finish_request(&req.id, RequestState::Failed)?;
        Ok(Vec::new())
    }

    /// Stash a large response payload and return its 16-byte ref
    pub(crate) fn store_response_payload(&self, op_id: &Uuid, payload: &[u8]) -> Result<Uuid> {
        let ref_id = unique_id(&op_id.to_string(), "storage");
        self.store
            .write_property(&ref_id.to_string(), &hex::encode(payload))?;
        Ok(ref_id)
    }

    /// Notification payment to the observer; `extra` is usually a storage ref
    pub(crate) fn build_observer_response(
        &self,
        op_id: Uuid,
        action: u8,
        curve: Curve,
        extra: Vec<u8>,
    ) -> Payment {
        self.build_observer_response_with_asset(
            op_id,
            action,
            curve,
            extra,
            self.conf.observer_asset_id.clone(),
            Decimal::ONE,
        )
    }

    pub(crate) fn build_observer_response_with_asset(
        &self,
        op_id: Uuid,
        action: u8,
        curve: Curve,
        extra: Vec<u8>,
        asset_id: String,
        amount: Decimal,
    ) -> Payment {
        let op = Operation {
            id: op_id,
            op_type: action,
            curve: curve as u8,
            public: Vec::new(),
            extra,
        };
        let memo = encrypt_operation(&self.observer_aes_key, &op.encode(), &op.id);
        Payment::new(
            unique_id(&op_id.to_string(), "OBSERVER"),
            asset_id,
            amount,
            memo,
            vec![self.conf.observer_user_id.clone()],
            1,
        )
    }

    /// Session dispatch to the signer federation
    pub(crate) fn build_signer_payment(&self, op: &Operation) -> Payment {
        let memo = encrypt_operation(&self.signer_aes_key, &op.encode(), &op.id);
        assert!(
            memo.len() <= OPERATION_MEMO_LIMIT,
            "signer memo {} exceeds {OPERATION_MEMO_LIMIT}",
            memo.len()
        );
        Payment::new(
            op.id,
            self.conf.keeper_asset_id.clone(),
            Decimal::ONE,
            memo,
            self.conf.signer_members.clone(),
            self.conf.signer_threshold,
        )
    }

    /// Deterministic id of the accounting token mirroring the locked value
    pub fn bond_asset_id(chain: Chain, holder: &str) -> String {
        unique_id(&unique_id(chain.asset_id(), holder).to_string(), "BOND").to_string()
    }

    /// Chain selected by the request extra, validated against the curve
    pub(crate) fn request_chain(&self, req: &Request, chain_byte: u8) -> Result<Chain> {
        let chain = Chain::from_byte(chain_byte)?;
        if !req.curve.supports_chain(chain) {
            return Err(Error::InvalidCurve {
                curve: req.curve as u8,
                chain: chain as u8,
            });
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bond_asset_id_deterministic() {
        let holder = "039c2f5ebdd4eae6d69e7a98b737beeb78e0a8d42c7b957a0fbe0c41658d16ab40";
        let a = Node::bond_asset_id(Chain::Bitcoin, holder);
        let b = Node::bond_asset_id(Chain::Bitcoin, holder);
        assert_eq!(a, b);
        assert_ne!(a, Node::bond_asset_id(Chain::Litecoin, holder));
        assert_ne!(a, Node::bond_asset_id(Chain::Bitcoin, "other"));
    }
}
