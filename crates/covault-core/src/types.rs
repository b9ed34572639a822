//! Fundamental types shared by the keeper and the observer
//!
//! Roles, curves, chains and request states are persisted and sent on the
//! wire as single bytes; their numeric values are stable.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Mixin network asset id of native Bitcoin
pub const SAFE_ASSET_BITCOIN: &str = "c6d0c728-2624-429b-8e0d-d9d19b6592fa";
/// Mixin network asset id of native Litecoin
pub const SAFE_ASSET_LITECOIN: &str = "76c802a2-7c88-447f-a93e-c29c9e5dd9c8";
/// Mixin network asset id of native Ether
pub const SAFE_ASSET_ETHEREUM: &str = "43d61dcd-e413-450d-80b8-101d5e903357";
/// Mixin network asset id of native Matic
pub const SAFE_ASSET_POLYGON: &str = "b7938396-3f94-4e0a-9179-d3440718156f";

/// The three signing authorities of a vault account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// User-controlled key, initiates accounts and spends
    Holder = 1,
    /// Threshold MPC identity held across the signer federation
    Signer = 2,
    /// Rescue identity, only effective after the time-lock
    Observer = 3,
}

impl Role {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Role::Holder),
            2 => Ok(Role::Signer),
            3 => Ok(Role::Observer),
            _ => Err(Error::Serialization(format!("invalid role {b}"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Holder => write!(f, "holder"),
            Role::Signer => write!(f, "signer"),
            Role::Observer => write!(f, "observer"),
        }
    }
}

/// Key families supported by the signer federation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Curve {
    /// secp256k1 ECDSA, Bitcoin-family sighashes
    Secp256k1EcdsaBitcoin = 1,
    /// secp256k1 ECDSA, Ethereum-family hashes
    Secp256k1EcdsaEthereum = 2,
    /// secp256k1 Schnorr (taproot), Bitcoin-family
    Secp256k1SchnorrBitcoin = 3,
    /// Ed25519 default
    Ed25519Default = 4,
    /// Ed25519 with Mixin kernel conventions
    Ed25519Mixin = 5,
}

impl Curve {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Curve::Secp256k1EcdsaBitcoin),
            2 => Ok(Curve::Secp256k1EcdsaEthereum),
            3 => Ok(Curve::Secp256k1SchnorrBitcoin),
            4 => Ok(Curve::Ed25519Default),
            5 => Ok(Curve::Ed25519Mixin),
            _ => Err(Error::Serialization(format!("invalid curve {b}"))),
        }
    }

    /// Whether this key family can govern accounts on the given chain
    pub fn supports_chain(&self, chain: Chain) -> bool {
        match chain {
            Chain::Bitcoin | Chain::Litecoin => matches!(
                self,
                Curve::Secp256k1EcdsaBitcoin | Curve::Secp256k1SchnorrBitcoin
            ),
            Chain::Ethereum | Chain::Polygon => matches!(self, Curve::Secp256k1EcdsaEthereum),
        }
    }
}

/// Chains a vault account can live on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Bitcoin = 1,
    Ethereum = 2,
    Litecoin = 5,
    Polygon = 6,
}

impl Chain {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(Chain::Bitcoin),
            2 => Ok(Chain::Ethereum),
            5 => Ok(Chain::Litecoin),
            6 => Ok(Chain::Polygon),
            _ => Err(Error::UnsupportedChain(b)),
        }
    }

    /// The messenger asset id of the chain's native asset
    pub fn asset_id(&self) -> &'static str {
        match self {
            Chain::Bitcoin => SAFE_ASSET_BITCOIN,
            Chain::Litecoin => SAFE_ASSET_LITECOIN,
            Chain::Ethereum => SAFE_ASSET_ETHEREUM,
            Chain::Polygon => SAFE_ASSET_POLYGON,
        }
    }

    /// Whether the chain uses UTXO accounting and P2WSH accounts
    pub fn is_bitcoin_family(&self) -> bool {
        matches!(self, Chain::Bitcoin | Chain::Litecoin)
    }

    /// Whether the chain uses contract accounts
    pub fn is_ethereum_family(&self) -> bool {
        matches!(self, Chain::Ethereum | Chain::Polygon)
    }

    /// Deposits are only credited at this depth
    pub fn min_confirmations(&self) -> u64 {
        match self {
            Chain::Bitcoin | Chain::Litecoin => 6,
            Chain::Ethereum => 32,
            Chain::Polygon => 128,
        }
    }

    /// Average block interval, used to convert time-locks to block counts
    pub fn block_time_secs(&self) -> u64 {
        match self {
            Chain::Bitcoin => 600,
            Chain::Litecoin => 150,
            Chain::Ethereum => 12,
            Chain::Polygon => 2,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Bitcoin => write!(f, "bitcoin"),
            Chain::Ethereum => write!(f, "ethereum"),
            Chain::Litecoin => write!(f, "litecoin"),
            Chain::Polygon => write!(f, "polygon"),
        }
    }
}

/// Lifecycle state shared by requests, transactions, signature requests,
/// account proposals and deposits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Initial = 1,
    Pending = 2,
    Done = 3,
    Failed = 4,
}

impl RequestState {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(RequestState::Initial),
            2 => Ok(RequestState::Pending),
            3 => Ok(RequestState::Done),
            4 => Ok(RequestState::Failed),
            _ => Err(Error::Serialization(format!("invalid state {b}"))),
        }
    }
}

/// An authorization as received by the keeper after transport ordering
///
/// Requests are processed at most once; the action handler is the only
/// mutator of the request state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Operation id, unique across the whole system
    pub id: Uuid,
    /// The ordered transport output that carried this request
    pub output_id: String,
    /// Global sequence assigned by the transport
    pub sequence: u64,
    /// Asset the request arrived with; selects holder vs observer routing
    pub asset_id: String,
    /// Amount attached to the request
    pub amount: Decimal,
    /// Originating authority
    pub role: Role,
    /// Action code, see [`crate::operation::Action`]
    pub action: u8,
    /// Key family of the holder public key
    pub curve: Curve,
    /// Holder public key, compressed hex
    pub holder: String,
    /// Action-specific payload
    pub extra: Vec<u8>,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
}

/// Compact key identifier: first 8 bytes of sha256 of the public key
pub fn fingerprint(public: &[u8]) -> [u8; 8] {
    let digest = Sha256::digest(public);
    let mut fp = [0u8; 8];
    fp.copy_from_slice(&digest[..8]);
    fp
}

/// Deterministic derived id: folds `b` into the UUID `a`
///
/// Used for session ids, trace ids and response refs so that redelivered
/// inputs derive the same downstream identifiers.
pub fn unique_id(a: &str, b: &str) -> Uuid {
    let ns = Uuid::parse_str(a)
        .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, a.as_bytes()));
    Uuid::new_v5(&ns, b.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for r in [Role::Holder, Role::Signer, Role::Observer] {
            assert_eq!(Role::from_byte(r as u8).unwrap(), r);
        }
        assert!(Role::from_byte(0).is_err());
    }

    #[test]
    fn test_curve_chain_compatibility() {
        assert!(Curve::Secp256k1EcdsaBitcoin.supports_chain(Chain::Bitcoin));
        assert!(Curve::Secp256k1EcdsaBitcoin.supports_chain(Chain::Litecoin));
        assert!(Curve::Secp256k1SchnorrBitcoin.supports_chain(Chain::Bitcoin));
        assert!(!Curve::Secp256k1EcdsaBitcoin.supports_chain(Chain::Ethereum));
        assert!(Curve::Secp256k1EcdsaEthereum.supports_chain(Chain::Polygon));
        assert!(!Curve::Secp256k1EcdsaEthereum.supports_chain(Chain::Bitcoin));
    }

    #[test]
    fn test_chain_bytes_are_stable() {
        assert_eq!(Chain::Bitcoin as u8, 1);
        assert_eq!(Chain::Ethereum as u8, 2);
        assert_eq!(Chain::Litecoin as u8, 5);
        assert_eq!(Chain::Polygon as u8, 6);
        assert_eq!(Chain::from_byte(5).unwrap(), Chain::Litecoin);
        assert!(Chain::from_byte(3).is_err());
    }

    #[test]
    fn test_fingerprint_length() {
        let fp = fingerprint(b"test-public-key");
        assert_eq!(fp.len(), 8);
        assert_eq!(fp, fingerprint(b"test-public-key"));
        assert_ne!(fp, fingerprint(b"other-public-key"));
    }

    #[test]
    fn test_unique_id_deterministic() {
        let a = "2e78d04a-e61a-442d-a014-dec19bd61cfe";
        let id1 = unique_id(a, "output");
        let id2 = unique_id(a, "output");
        assert_eq!(id1, id2);
        assert_ne!(id1, unique_id(a, "other"));

        // chains of unique_id stay deterministic
        let chained = unique_id(&id1.to_string(), "MTG:members:1");
        assert_eq!(chained, unique_id(&id1.to_string(), "MTG:members:1"));
    }
}
