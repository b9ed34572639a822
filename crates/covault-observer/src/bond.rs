//! Bond asset deployment
//!
//! For every approved account a deterministic ERC-20-like bond asset is
//! deployed on the factory, keyed by `(asset, symbol, name, holder)`. The
//! factory itself is external; this module is the seam plus the
//! deterministic key derivation both sides agree on.

use async_trait::async_trait;
use covault_core::{unique_id, Result};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Mutex;

/// Deterministic factory key of a bond asset
pub fn bond_asset_key(asset_id: &str, symbol: &str, name: &str, holder: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(asset_id.as_bytes());
    hasher.update(symbol.as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(holder.as_bytes());
    let digest = hasher.finalize();
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Messenger asset id the deployed bond settles under
pub fn bond_asset_id(asset_key: &str) -> String {
    unique_id(asset_key, "BOND-ASSET").to_string()
}

/// Deploys bond assets on the contract factory
#[async_trait]
pub trait BondFactory: Send + Sync {
    /// Whether the asset behind this key is already live
    async fn check_deployed(&self, asset_key: &str) -> Result<bool>;

    /// Deploy (or no-op if raced) and return the asset key
    async fn deploy(
        &self,
        asset_id: &str,
        symbol: &str,
        name: &str,
        holder: &str,
    ) -> Result<String>;
}

/// In-memory factory for tests
#[derive(Default)]
pub struct MemoryBondFactory {
    deployed: Mutex<HashSet<String>>,
}

impl MemoryBondFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BondFactory for MemoryBondFactory {
    async fn check_deployed(&self, asset_key: &str) -> Result<bool> {
        Ok(self.deployed.lock().expect("factory lock").contains(asset_key))
    }

    async fn deploy(
        &self,
        asset_id: &str,
        symbol: &str,
        name: &str,
        holder: &str,
    ) -> Result<String> {
        let key = bond_asset_key(asset_id, symbol, name, holder);
        self.deployed.lock().expect("factory lock").insert(key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bond_key_deterministic_and_deploy_idempotent() {
        let holder = "039c2f5ebdd4eae6d69e7a98b737beeb78e0a8d42c7b957a0fbe0c41658d16ab40";
        let key = bond_asset_key("asset", "BTC", "Bitcoin", holder);
        assert_eq!(key, bond_asset_key("asset", "BTC", "Bitcoin", holder));
        assert_ne!(key, bond_asset_key("asset", "BTC", "Bitcoin", "other"));
        assert!(key.starts_with("0x"));
        assert_eq!(key.len(), 42);

        let factory = MemoryBondFactory::new();
        assert!(!factory.check_deployed(&key).await.unwrap());
        let deployed = factory.deploy("asset", "BTC", "Bitcoin", holder).await.unwrap();
        assert_eq!(deployed, key);
        assert!(factory.check_deployed(&key).await.unwrap());
        // a second deploy is a no-op
        factory.deploy("asset", "BTC", "Bitcoin", holder).await.unwrap();

        assert_eq!(bond_asset_id(&key), bond_asset_id(&key));
    }
}
