//! # Chain Adapters
//!
//! Chain-specific account construction, transaction assembly and signature
//! hashing. Bitcoin-family chains use a P2WSH witness script encoding the
//! 2-of-3 multisig and the observer time-lock; Ethereum-family chains use a
//! Gnosis-Safe-style 2/3 contract with a guard enforcing the delay.

pub mod bitcoin;
pub mod ethereum;

use crate::{Chain, Curve, Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// A confirmed block as reported by a chain node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u64,
    /// -1 means the block was reorged out
    pub confirmations: i64,
}

/// Minimal read access to a chain node, used to verify pushed network info
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_block(&self, chain: Chain, hash: &str) -> Result<Option<BlockInfo>>;
}

/// Preloaded block set for tests
#[derive(Debug, Default)]
pub struct MemoryChainRpc {
    blocks: Mutex<HashMap<String, BlockInfo>>,
}

impl MemoryChainRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_block(&self, hash: &str, height: u64, confirmations: i64) {
        self.blocks.lock().expect("rpc lock").insert(
            hash.to_string(),
            BlockInfo {
                height,
                confirmations,
            },
        );
    }
}

#[async_trait]
impl ChainRpc for MemoryChainRpc {
    async fn get_block(&self, _chain: Chain, hash: &str) -> Result<Option<BlockInfo>> {
        Ok(self.blocks.lock().expect("rpc lock").get(hash).cloned())
    }
}

/// Validate a holder public key for the given curve
pub fn verify_holder_key(public: &str, curve: Curve) -> Result<()> {
    let bytes = hex::decode(public)?;
    match curve {
        Curve::Secp256k1EcdsaBitcoin | Curve::Secp256k1EcdsaEthereum => {
            if bytes.len() != 33 {
                return Err(Error::InvalidKey(format!(
                    "compressed key must be 33 bytes, got {}",
                    bytes.len()
                )));
            }
            ::bitcoin::secp256k1::PublicKey::from_slice(&bytes)
                .map_err(|e| Error::InvalidKey(e.to_string()))?;
            Ok(())
        }
        Curve::Secp256k1SchnorrBitcoin => {
            if bytes.len() != 32 {
                return Err(Error::InvalidKey(format!(
                    "x-only key must be 32 bytes, got {}",
                    bytes.len()
                )));
            }
            ::bitcoin::secp256k1::XOnlyPublicKey::from_slice(&bytes)
                .map_err(|e| Error::InvalidKey(e.to_string()))?;
            Ok(())
        }
        Curve::Ed25519Default | Curve::Ed25519Mixin => {
            if bytes.len() != 32 {
                return Err(Error::InvalidKey(format!(
                    "ed25519 key must be 32 bytes, got {}",
                    bytes.len()
                )));
            }
            Ok(())
        }
    }
}

/// Expected hash shape of a pushed network-info record
pub fn verify_network_hash_shape(chain: Chain, hash: &str) -> bool {
    if chain.is_bitcoin_family() {
        hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit())
    } else {
        hash.len() == 66
            && hash.starts_with("0x")
            && hash[2..].chars().all(|c| c.is_ascii_hexdigit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_holder_key() {
        let valid = "039c2f5ebdd4eae6d69e7a98b737beeb78e0a8d42c7b957a0fbe0c41658d16ab40";
        verify_holder_key(valid, Curve::Secp256k1EcdsaBitcoin).unwrap();
        verify_holder_key(valid, Curve::Secp256k1EcdsaEthereum).unwrap();

        assert!(verify_holder_key("0011", Curve::Secp256k1EcdsaBitcoin).is_err());
        assert!(verify_holder_key(valid, Curve::Secp256k1SchnorrBitcoin).is_err());
        assert!(verify_holder_key("zz", Curve::Secp256k1EcdsaBitcoin).is_err());
    }

    #[test]
    fn test_network_hash_shape() {
        let btc = "00000000000000000002a4f5cd899ea457314c808897c5c5f1f1cd6ffe2b266a";
        assert!(verify_network_hash_shape(Chain::Bitcoin, btc));
        assert!(!verify_network_hash_shape(Chain::Ethereum, btc));
        let eth = format!("0x{btc}");
        assert!(verify_network_hash_shape(Chain::Ethereum, &eth));
        assert!(!verify_network_hash_shape(Chain::Bitcoin, &eth));
        assert!(!verify_network_hash_shape(Chain::Bitcoin, "abc"));
    }
}
