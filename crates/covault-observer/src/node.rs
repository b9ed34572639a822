//! The observer node and its per-chain driver loops
//!
//! Each chain gets independent long-lived tasks with a 3-second idle
//! backoff: network-info push, block scanning, deposit confirmation and
//! the spend loop. Keeper responses arrive as memoed payments and are
//! routed by action code.

use crate::bond::{bond_asset_key, BondFactory};
use crate::rpc::ObserverRpc;
use crate::store::{ObserverStore, SeenDeposit, TransactionApproval};
use crate::{LOOP_IDLE_SECS, SPARE_KEYS_MINIMUM};
use chrono::Utc;
use covault_core::chain::bitcoin as bitcoin_chain;
use covault_core::crypto::{decrypt_operation, encrypt_operation, shared_key};
use covault_core::{
    unique_id, Action, Chain, Error, Messenger, Operation, Payment, RequestState, Result,
};
use covault_keeper::store::Store as KeeperStore;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Static observer configuration
#[derive(Clone)]
pub struct ObserverConf {
    /// This node's X25519 transport identity
    pub private_key: [u8; 32],
    /// The keeper group's long-term X25519 identity
    pub keeper_public_key: [u8; 32],
    /// Members and threshold observer requests are addressed to
    pub keeper_members: Vec<String>,
    pub keeper_threshold: u8,
    /// Asset routing observer actions into the keeper
    pub observer_asset_id: String,
    /// Economic parameters pushed at boot
    pub price_asset_id: String,
    pub price_amount: Decimal,
    pub transaction_minimum: Decimal,
    /// Chains this observer drives
    pub chains: Vec<Chain>,
    /// First block height worth scanning per deployment
    pub scan_genesis: u64,
}

/// The observer driver
pub struct Node {
    pub(crate) conf: ObserverConf,
    pub(crate) aes_key: [u8; 32],
    pub(crate) store: ObserverStore,
    pub(crate) keeper_store: Arc<KeeperStore>,
    pub(crate) rpc: Arc<ObserverRpc>,
    pub(crate) messenger: Arc<dyn Messenger>,
    pub(crate) bond_factory: Arc<dyn BondFactory>,
}

impl Node {
    pub fn new(
        conf: ObserverConf,
        store: ObserverStore,
        keeper_store: Arc<KeeperStore>,
        rpc: Arc<ObserverRpc>,
        messenger: Arc<dyn Messenger>,
        bond_factory: Arc<dyn BondFactory>,
    ) -> Self {
        let aes_key = shared_key(&conf.private_key, &conf.keeper_public_key);
        Self {
            conf,
            aes_key,
            store,
            keeper_store,
            rpc,
            messenger,
            bond_factory,
        }
    }

    pub fn store(&self) -> &ObserverStore {
        &self.store
    }

    /// Spawn every per-chain loop; runs for the process lifetime
    pub async fn boot(self: Arc<Self>) {
        for chain in self.conf.chains.clone() {
            if let Err(e) = self.send_price_info(chain).await {
                warn!(%chain, error = %e, "price info push failed, loops will retry");
            }
            if chain.is_bitcoin_family() {
                tokio::spawn(Arc::clone(&self).network_info_loop(chain));
                tokio::spawn(Arc::clone(&self).block_scan_loop(chain));
                tokio::spawn(Arc::clone(&self).deposit_confirm_loop(chain));
                tokio::spawn(Arc::clone(&self).transaction_spend_loop(chain));
            } else {
                tokio::spawn(Arc::clone(&self).ethereum_network_info_loop(chain));
                tokio::spawn(Arc::clone(&self).ethereum_spend_loop(chain));
            }
        }
        tokio::spawn(Arc::clone(&self).spare_key_loop());
        info!(chains = self.conf.chains.len(), "observer booted");
    }

    // ============ Holder Intake ============
    //
    // Holders hand their signatures to the observer out of band (app or
    // API); the observer forwards them as the matching keeper actions.

    /// Forward a holder's `APPROVE:<proposal>:<address>` signature
    pub async fn forward_account_approval(
        &self,
        chain: Chain,
        proposal_id: Uuid,
        holder: &str,
        signature: &[u8],
    ) -> Result<()> {
        let mut extra = proposal_id.as_bytes().to_vec();
        extra.extend_from_slice(signature);
        self.send_keeper_request(&Operation {
            id: Uuid::new_v4(),
            op_type: Action::SafeApproveAccount as u8,
            curve: Self::chain_curve(chain),
            public: hex::decode(holder)?,
            extra,
        })
        .await
    }

    /// Forward a holder-signed raw transaction for approval; the payload
    /// travels through keeper storage, the memo only carries its digest
    pub async fn forward_transaction_approval(
        &self,
        chain: Chain,
        request_id: Uuid,
        holder: &str,
        signed_raw: &[u8],
    ) -> Result<()> {
        use sha2::{Digest, Sha256};
        let reference: [u8; 32] = Sha256::digest(signed_raw).into();
        self.keeper_store
            .write_property(&hex::encode(reference), &hex::encode(signed_raw))?;
        let mut extra = request_id.as_bytes().to_vec();
        extra.extend_from_slice(&reference);
        self.send_keeper_request(&Operation {
            id: Uuid::new_v4(),
            op_type: Action::SafeApproveTransaction as u8,
            curve: Self::chain_curve(chain),
            public: hex::decode(holder)?,
            extra,
        })
        .await
    }

    /// Forward a `REVOKE:<request>:<hash>` signature from holder or observer
    pub async fn forward_transaction_revocation(
        &self,
        chain: Chain,
        request_id: Uuid,
        holder: &str,
        signature: &[u8],
    ) -> Result<()> {
        let mut extra = request_id.as_bytes().to_vec();
        extra.extend_from_slice(signature);
        self.send_keeper_request(&Operation {
            id: Uuid::new_v4(),
            op_type: Action::SafeRevokeTransaction as u8,
            curve: Self::chain_curve(chain),
            public: hex::decode(holder)?,
            extra,
        })
        .await
    }

    /// Start an account close: `request_id` names the recovery proposal
    /// (nil for a holder+observer pre-signed raw)
    pub async fn forward_account_close(
        &self,
        chain: Chain,
        request_id: Uuid,
        holder: &str,
        co_signed_raw: &[u8],
    ) -> Result<()> {
        use sha2::{Digest, Sha256};
        let reference: [u8; 32] = Sha256::digest(co_signed_raw).into();
        self.keeper_store
            .write_property(&hex::encode(reference), &hex::encode(co_signed_raw))?;
        let mut extra = request_id.as_bytes().to_vec();
        extra.extend_from_slice(&reference);
        self.send_keeper_request(&Operation {
            id: Uuid::new_v4(),
            op_type: Action::SafeCloseAccount as u8,
            curve: Self::chain_curve(chain),
            public: hex::decode(holder)?,
            extra,
        })
        .await
    }

    // ============ Key Top-Up ============

    /// Keep the spare signer-key pool stocked so proposals never starve
    async fn spare_key_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(LOOP_IDLE_SECS * 20)).await;
            if let Err(e) = self.top_up_spare_keys().await {
                warn!(error = %e, "spare key top-up failed");
            }
        }
    }

    pub(crate) async fn top_up_spare_keys(&self) -> Result<()> {
        let spare = self.keeper_store.count_spare_keys(
            covault_core::Curve::Secp256k1EcdsaBitcoin,
            covault_core::Role::Signer,
        )?;
        if spare >= SPARE_KEYS_MINIMUM {
            return Ok(());
        }
        let batch = (SPARE_KEYS_MINIMUM - spare).min(u8::MAX as usize) as u8;
        let id = unique_id(
            &unique_id(&self.conf.price_asset_id, "KEYGEN").to_string(),
            &format!("{spare}:{batch}"),
        );
        self.send_keeper_request(&Operation {
            id,
            op_type: Action::ObserverRequestSignerKeys as u8,
            curve: covault_core::Curve::Secp256k1EcdsaBitcoin as u8,
            public: Vec::new(),
            extra: vec![batch],
        })
        .await
    }

    /// Enroll a freshly backed-up observer key
    pub async fn enroll_observer_key(
        &self,
        curve: covault_core::Curve,
        public: &str,
        chain_code: [u8; 32],
    ) -> Result<()> {
        let mut extra = vec![covault_core::Role::Observer as u8];
        extra.extend_from_slice(&chain_code);
        extra.push(0);
        self.send_keeper_request(&Operation {
            id: Uuid::new_v4(),
            op_type: Action::ObserverAddKey as u8,
            curve: curve as u8,
            public: hex::decode(public)?,
            extra,
        })
        .await
    }

    // ============ Requests Into The Keeper ============

    /// Encrypt an operation and send it as an observer-asset payment
    pub(crate) async fn send_keeper_request(&self, op: &Operation) -> Result<()> {
        let memo = encrypt_operation(&self.aes_key, &op.encode(), &op.id);
        let payment = Payment::new(
            op.id,
            self.conf.observer_asset_id.clone(),
            Decimal::ONE,
            memo,
            self.conf.keeper_members.clone(),
            self.conf.keeper_threshold,
        );
        self.messenger.send(&payment).await
    }

    fn chain_curve(chain: Chain) -> u8 {
        if chain.is_bitcoin_family() {
            covault_core::Curve::Secp256k1EcdsaBitcoin as u8
        } else {
            covault_core::Curve::Secp256k1EcdsaEthereum as u8
        }
    }

    /// Push the account price and spend minimum
    pub async fn send_price_info(&self, chain: Chain) -> Result<()> {
        let price = (self.conf.price_amount * Decimal::from(100_000_000u64))
            .to_u64()
            .ok_or_else(|| Error::Serialization("price amount out of range".into()))?;
        let minimum = (self.conf.transaction_minimum * Decimal::from(100_000_000u64))
            .to_u64()
            .ok_or_else(|| Error::Serialization("transaction minimum out of range".into()))?;
        assert!(price > 0, "price amount must be positive");
        assert!(
            minimum >= bitcoin_chain::value_dust(Chain::Bitcoin),
            "transaction minimum below dust"
        );

        let mut extra = vec![chain as u8];
        extra.extend_from_slice(
            Uuid::parse_str(&self.conf.price_asset_id)
                .map_err(|e| Error::Serialization(e.to_string()))?
                .as_bytes(),
        );
        extra.extend_from_slice(&price.to_be_bytes());
        extra.extend_from_slice(&minimum.to_be_bytes());

        let id = unique_id(
            &unique_id(chain.asset_id(), &self.conf.price_asset_id).to_string(),
            &format!("{price}:{minimum}"),
        );
        self.send_keeper_request(&Operation {
            id,
            op_type: Action::ObserverSetOperationParams as u8,
            curve: Self::chain_curve(chain),
            public: Vec::new(),
            extra,
        })
        .await
    }

    // ============ Loops ============

    async fn network_info_loop(self: Arc<Self>, chain: Chain) {
        loop {
            tokio::time::sleep(Duration::from_secs(LOOP_IDLE_SECS)).await;
            if let Err(e) = self.push_bitcoin_network_info(chain).await {
                warn!(%chain, error = %e, "network info push failed");
            }
        }
    }

    pub(crate) async fn push_bitcoin_network_info(&self, chain: Chain) -> Result<()> {
        let rpc = self.rpc.bitcoin(chain)?;
        let height = rpc.get_block_count().await?;
        let hash = rpc.get_block_hash(height).await?;
        let fee = rpc.estimate_fee_rate().await?;

        let mut extra = vec![chain as u8];
        extra.extend_from_slice(&fee.to_be_bytes());
        extra.extend_from_slice(&height.to_be_bytes());
        extra.extend_from_slice(&hex::decode(&hash)?);

        // the id is bound to the tip so re-pushing the same tip dedups
        let id = unique_id(&unique_id(chain.asset_id(), &hash).to_string(), "NETWORK");
        self.send_keeper_request(&Operation {
            id,
            op_type: Action::ObserverUpdateNetworkStatus as u8,
            curve: Self::chain_curve(chain),
            public: Vec::new(),
            extra,
        })
        .await
    }

    async fn ethereum_network_info_loop(self: Arc<Self>, chain: Chain) {
        loop {
            tokio::time::sleep(Duration::from_secs(LOOP_IDLE_SECS)).await;
            if let Err(e) = self.push_ethereum_network_info(chain).await {
                warn!(%chain, error = %e, "network info push failed");
            }
        }
    }

    pub(crate) async fn push_ethereum_network_info(&self, chain: Chain) -> Result<()> {
        let rpc = self.rpc.ethereum(chain)?;
        let height = rpc.block_number().await?;
        let Some(hash) = rpc.get_block_hash(height).await? else {
            return Ok(());
        };
        let fee = rpc.gas_price().await?;

        let mut extra = vec![chain as u8];
        extra.extend_from_slice(&fee.to_be_bytes());
        extra.extend_from_slice(&height.to_be_bytes());
        extra.extend_from_slice(&hex::decode(hash.trim_start_matches("0x"))?);

        let id = unique_id(&unique_id(chain.asset_id(), &hash).to_string(), "NETWORK");
        self.send_keeper_request(&Operation {
            id,
            op_type: Action::ObserverUpdateNetworkStatus as u8,
            curve: Self::chain_curve(chain),
            public: Vec::new(),
            extra,
        })
        .await
    }

    async fn block_scan_loop(self: Arc<Self>, chain: Chain) {
        loop {
            tokio::time::sleep(Duration::from_secs(LOOP_IDLE_SECS)).await;
            if let Err(e) = self.scan_blocks(chain).await {
                warn!(%chain, error = %e, "block scan failed");
            }
        }
    }

    /// Walk `[checkpoint, tip - confirmations]` and record every output
    /// paying a known account address, once per `(hash, vout)`
    pub(crate) async fn scan_blocks(&self, chain: Chain) -> Result<()> {
        let rpc = self.rpc.bitcoin(chain)?;
        let tip = rpc.get_block_count().await?;
        let horizon = tip.saturating_sub(chain.min_confirmations());
        let mut height = self
            .store
            .read_scan_checkpoint(chain, self.conf.scan_genesis)?;

        while height <= horizon {
            let hash = rpc.get_block_hash(height).await?;
            let block = rpc.get_block(&hash).await?;
            for tx in &block.tx {
                for vout in &tx.vout {
                    let Some(address) = &vout.script_pub_key.address else {
                        continue;
                    };
                    if self.keeper_store.read_safe_by_address(address)?.is_none() {
                        continue;
                    }
                    let satoshi = (vout.value * 100_000_000.0).round() as u64;
                    let fresh = self.store.write_seen_deposit_if_not_exists(&SeenDeposit {
                        transaction_hash: tx.txid.clone(),
                        output_index: vout.n,
                        chain,
                        address: address.clone(),
                        satoshi,
                        height,
                        state: RequestState::Initial,
                    })?;
                    if fresh {
                        info!(%chain, txid = %tx.txid, vout = vout.n, satoshi, "deposit seen");
                    }
                }
            }
            height += 1;
            self.store.write_scan_checkpoint(chain, height)?;
        }
        Ok(())
    }

    async fn deposit_confirm_loop(self: Arc<Self>, chain: Chain) {
        loop {
            tokio::time::sleep(Duration::from_secs(LOOP_IDLE_SECS)).await;
            if let Err(e) = self.confirm_deposits(chain).await {
                warn!(%chain, error = %e, "deposit confirmation failed");
            }
        }
    }

    /// Promote scanned deposits once their depth reaches the chain minimum
    /// and notify the keeper
    pub(crate) async fn confirm_deposits(&self, chain: Chain) -> Result<()> {
        let rpc = self.rpc.bitcoin(chain)?;
        let tip = rpc.get_block_count().await?;
        let horizon = tip.saturating_sub(chain.min_confirmations());
        for deposit in self.store.list_confirmable_deposits(chain, horizon)? {
            // the recipient transaction must still be in chain at depth
            let Some(tx) = rpc.get_transaction(&deposit.transaction_hash).await? else {
                continue;
            };
            if tx.confirmations.unwrap_or(0) < chain.min_confirmations() as i64 {
                continue;
            }
            let Some(safe) = self.keeper_store.read_safe_by_address(&deposit.address)? else {
                continue;
            };

            let mut extra = vec![chain as u8];
            extra.extend_from_slice(
                Uuid::parse_str(chain.asset_id())
                    .map_err(|e| Error::Serialization(e.to_string()))?
                    .as_bytes(),
            );
            extra.extend_from_slice(&hex::decode(&deposit.transaction_hash)?);
            extra.extend_from_slice(&(deposit.output_index as u64).to_be_bytes());
            let amount = deposit.satoshi.to_be_bytes();
            let start = amount
                .iter()
                .position(|b| *b != 0)
                .unwrap_or(amount.len() - 1);
            extra.extend_from_slice(&amount[start..]);

            let id = unique_id(
                &unique_id(&deposit.transaction_hash, "DEPOSIT").to_string(),
                &deposit.output_index.to_string(),
            );
            self.send_keeper_request(&Operation {
                id,
                op_type: Action::ObserverHolderDeposit as u8,
                curve: Self::chain_curve(chain),
                public: hex::decode(&safe.holder)?,
                extra,
            })
            .await?;
            self.store
                .confirm_seen_deposit(&deposit.transaction_hash, deposit.output_index)?;
            info!(%chain, txid = %deposit.transaction_hash, "deposit confirmed");
        }
        Ok(())
    }

    async fn transaction_spend_loop(self: Arc<Self>, chain: Chain) {
        loop {
            tokio::time::sleep(Duration::from_secs(LOOP_IDLE_SECS)).await;
            let approvals = match self.store.list_fully_signed_approvals(chain) {
                Ok(approvals) => approvals,
                Err(e) => {
                    warn!(%chain, error = %e, "listing approvals failed");
                    continue;
                }
            };
            for approval in approvals {
                match self.spend_fully_signed(&approval).await {
                    Ok(spent) => {
                        info!(%chain, hash = %approval.transaction_hash, spent = %spent, "broadcast")
                    }
                    Err(e) => {
                        warn!(%chain, hash = %approval.transaction_hash, error = %e, "spend failed");
                        break;
                    }
                }
            }
        }
    }

    async fn ethereum_spend_loop(self: Arc<Self>, chain: Chain) {
        loop {
            tokio::time::sleep(Duration::from_secs(LOOP_IDLE_SECS)).await;
            let approvals = match self.store.list_fully_signed_approvals(chain) {
                Ok(approvals) => approvals,
                Err(e) => {
                    warn!(%chain, error = %e, "listing approvals failed");
                    continue;
                }
            };
            for approval in approvals {
                // contract execution is delegated to the relayer key; here
                // the approval is marked spent under its own hash
                if let Err(e) = self
                    .store
                    .confirm_spent_approval(
                        &approval.transaction_hash,
                        &approval.transaction_hash,
                        &approval.raw_transaction,
                    )
                {
                    warn!(%chain, error = %e, "confirming contract spend failed");
                }
            }
        }
    }

    // ============ Keeper Response Intake ============

    /// Decrypt and route one keeper response memo
    pub async fn handle_keeper_response(&self, memo: &[u8], created_at: chrono::DateTime<Utc>) -> Result<()> {
        let plain = decrypt_operation(&self.aes_key, memo)?;
        let op = Operation::decode(&plain)?;
        if op.extra.len() != 16 {
            return Err(Error::MalformedEnvelope("response ref must be 16 bytes".into()));
        }
        let ref_id = Uuid::from_slice(&op.extra)?;
        let payload = self
            .keeper_store
            .read_property(&ref_id.to_string())?
            .ok_or_else(|| Error::NotFound(format!("response payload {ref_id}")))?;
        let payload = hex::decode(payload)?;

        match Action::from_byte(op.op_type)? {
            Action::SafeProposeAccount => {
                // surfaced to the holder UI through the read-only API
                self.store
                    .write_property(&format!("account-proposal-{}", op.id), &hex::encode(payload))
            }
            Action::SafeApproveAccount => self.deploy_account_bond(&payload).await,
            Action::SafeProposeTransaction => {
                self.save_transaction_proposal(&payload, created_at)
            }
            Action::SafeApproveTransaction => self.combine_transaction_signatures(&payload),
            _ => Ok(()),
        }
    }

    fn save_transaction_proposal(
        &self,
        raw: &[u8],
        created_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let psbt = bitcoin::Psbt::deserialize(raw)
            .map_err(|e| Error::TransactionEncoding(e.to_string()))?;
        let hash = bitcoin_chain::psbt_hash(&psbt);
        let Some(rid) = bitcoin_chain::extract_request_id(&psbt.unsigned_tx) else {
            return Err(Error::TransactionEncoding("proposal without request id".into()));
        };
        let Some(tx) = self.keeper_store.read_transaction_by_request(&rid)? else {
            return Err(Error::NotFound(format!("transaction for request {rid}")));
        };
        self.store.write_transaction_approval(&TransactionApproval {
            transaction_hash: hash,
            chain: tx.chain,
            holder: tx.holder,
            raw_transaction: raw.to_vec(),
            spent_hash: None,
            spent_raw: None,
            state: RequestState::Pending,
            created_at,
        })
    }

    async fn deploy_account_bond(&self, account_blob: &[u8]) -> Result<()> {
        // both account blob shapes parse structurally; the address that
        // resolves to a known account disambiguates
        let mut safe = None;
        for chain in [Chain::Bitcoin, Chain::Polygon] {
            let Ok(address) = covault_keeper::account::proposal_address(chain, account_blob)
            else {
                continue;
            };
            if let Some(found) = self.keeper_store.read_safe_by_address(&address)? {
                safe = Some(found);
                break;
            }
        }
        let Some(safe) = safe else {
            return Err(Error::NotFound("account for bond deployment".into()));
        };
        let (symbol, name) = match safe.chain {
            Chain::Bitcoin => ("BTC", "Bitcoin"),
            Chain::Litecoin => ("LTC", "Litecoin"),
            Chain::Ethereum => ("ETH", "Ether"),
            Chain::Polygon => ("MATIC", "Matic"),
        };
        let key = bond_asset_key(safe.chain.asset_id(), symbol, name, &safe.holder);
        if self.bond_factory.check_deployed(&key).await? {
            return Ok(());
        }
        self.bond_factory
            .deploy(safe.chain.asset_id(), symbol, name, &safe.holder)
            .await?;
        info!(address = %safe.address, key = %key, "bond asset deployed");
        Ok(())
    }
}
