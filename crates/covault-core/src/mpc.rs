//! Signer pool interface
//!
//! The MPC federation is consumed as a black-box keygen/sign oracle. A
//! session is identified by a UUID and is at-most-once: asking the pool for
//! the same session again returns the same result, which is what makes
//! keeper replay checks exact. The production pool is reached over the
//! messenger transport (`KeygenInput`/`SignInput` out,
//! `KeygenOutput`/`SignOutput` back); this trait is the seam, not a
//! reimplementation of the signing protocol.

use crate::chain::bitcoin::{derive_private_child, derive_public_child};
use crate::{fingerprint, Curve, Error, Result};
use async_trait::async_trait;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Output of a keygen session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenResult {
    /// Compressed public key
    pub public: Vec<u8>,
    /// BIP32 chain code for per-account child derivation
    pub chain_code: [u8; 32],
}

/// Request/response interface to the MPC signer federation
#[async_trait]
pub trait SignerPool: Send + Sync {
    /// Produce a new threshold key; deterministic per session id
    async fn keygen(&self, session_id: Uuid, curve: Curve) -> Result<KeygenResult>;

    /// Sign a 32-byte digest with the child key at `path` under the key
    /// identified by `fingerprint`; returns a DER signature
    async fn sign(
        &self,
        session_id: Uuid,
        key_fingerprint: [u8; 8],
        path: &[u8],
        message: [u8; 32],
    ) -> Result<Vec<u8>>;
}

/// Deterministic in-process pool for tests and local simulation
///
/// Secrets are derived from the session id alone, and signing is RFC6979
/// deterministic ECDSA, so a replayed session reproduces identical bytes.
#[derive(Default)]
pub struct MemorySignerPool {
    keys: Mutex<HashMap<[u8; 8], ([u8; 32], [u8; 32])>>,
}

impl MemorySignerPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn derive_secret(session_id: &Uuid, curve: Curve) -> [u8; 32] {
        let mut counter = 0u8;
        loop {
            let mut hasher = Sha256::new();
            hasher.update(b"covault-keygen");
            hasher.update(session_id.as_bytes());
            hasher.update([curve as u8, counter]);
            let candidate: [u8; 32] = hasher.finalize().into();
            if SecretKey::from_slice(&candidate).is_ok() {
                return candidate;
            }
            counter += 1;
        }
    }
}

#[async_trait]
impl SignerPool for MemorySignerPool {
    async fn keygen(&self, session_id: Uuid, curve: Curve) -> Result<KeygenResult> {
        match curve {
            Curve::Secp256k1EcdsaBitcoin | Curve::Secp256k1EcdsaEthereum => {}
            _ => {
                return Err(Error::SignerSession(format!(
                    "unsupported curve {curve:?}"
                )))
            }
        }
        let secret = Self::derive_secret(&session_id, curve);
        let chain_code: [u8; 32] = Sha256::digest(
            [b"covault-chain-code".as_slice(), session_id.as_bytes()].concat(),
        )
        .into();

        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&secret).expect("derived secret");
        let public = sk.public_key(&secp).serialize().to_vec();

        let mut keys = self.keys.lock().expect("pool lock");
        keys.insert(fingerprint(&public), (secret, chain_code));
        Ok(KeygenResult {
            public,
            chain_code,
        })
    }

    async fn sign(
        &self,
        _session_id: Uuid,
        key_fingerprint: [u8; 8],
        path: &[u8],
        message: [u8; 32],
    ) -> Result<Vec<u8>> {
        let (secret, chain_code) = {
            let keys = self.keys.lock().expect("pool lock");
            *keys
                .get(&key_fingerprint)
                .ok_or_else(|| Error::SignerSession(hex::encode(key_fingerprint)))?
        };

        let child = derive_private_child(&secret, &chain_code, path)?;
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&child).map_err(|e| Error::Crypto(e.to_string()))?;
        let digest = Message::from_digest(message);
        let sig = secp.sign_ecdsa(&digest, &sk);
        Ok(sig.serialize_der().to_vec())
    }
}

/// Derive the child public key for verification against pool signatures
pub fn derived_signer_public(
    public: &[u8],
    chain_code: &[u8; 32],
    path: &[u8],
) -> Result<Vec<u8>> {
    derive_public_child(public, chain_code, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keygen_deterministic_per_session() {
        let pool = MemorySignerPool::new();
        let session = Uuid::new_v4();
        let a = pool
            .keygen(session, Curve::Secp256k1EcdsaBitcoin)
            .await
            .unwrap();
        let b = pool
            .keygen(session, Curve::Secp256k1EcdsaBitcoin)
            .await
            .unwrap();
        assert_eq!(a.public, b.public);
        assert_eq!(a.chain_code, b.chain_code);

        let other = pool
            .keygen(Uuid::new_v4(), Curve::Secp256k1EcdsaBitcoin)
            .await
            .unwrap();
        assert_ne!(a.public, other.public);
    }

    #[tokio::test]
    async fn test_sign_verifies_against_derived_child() {
        let pool = MemorySignerPool::new();
        let session = Uuid::new_v4();
        let key = pool
            .keygen(session, Curve::Secp256k1EcdsaBitcoin)
            .await
            .unwrap();

        let path = [2u8, 0, 0, 0];
        let message: [u8; 32] = Sha256::digest(b"sighash").into();
        let sig = pool
            .sign(Uuid::new_v4(), fingerprint(&key.public), &path, message)
            .await
            .unwrap();

        let child = derived_signer_public(&key.public, &key.chain_code, &path).unwrap();
        crate::crypto::verify_ecdsa_der(&child, &message, &sig).unwrap();

        // deterministic signing: same session, same bytes
        let again = pool
            .sign(Uuid::new_v4(), fingerprint(&key.public), &path, message)
            .await
            .unwrap();
        assert_eq!(sig, again);
    }

    #[tokio::test]
    async fn test_sign_unknown_key_fails() {
        let pool = MemorySignerPool::new();
        let err = pool
            .sign(Uuid::new_v4(), [0u8; 8], &[0, 0, 0, 0], [1u8; 32])
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_keygen_rejects_unsupported_curves() {
        let pool = MemorySignerPool::new();
        assert!(pool
            .keygen(Uuid::new_v4(), Curve::Ed25519Default)
            .await
            .is_err());
    }
}
