//! Memo encryption and signed-message verification
//!
//! Each node derives two AES-256-GCM keys by X25519 ECDH against the
//! long-term public keys of the other two roles. Memos are sealed with a
//! nonce derived from the operation id, so the same operation always
//! produces the same ciphertext and redelivery stays byte-identical.

use crate::{Chain, Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use k256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Derive a shared AES key for a role pair via X25519
pub fn shared_key(node_private: &[u8; 32], peer_public: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*node_private);
    let peer = X25519Public::from(*peer_public);
    secret.diffie_hellman(&peer).to_bytes()
}

/// Public half of a node's X25519 identity
pub fn x25519_public(node_private: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*node_private);
    X25519Public::from(&secret).as_bytes().to_owned()
}

fn operation_nonce(id: &Uuid) -> [u8; 12] {
    let digest = Sha256::digest(id.as_bytes());
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    nonce
}

/// Seal an encoded operation under a role-pair key
///
/// Output layout: 12-byte nonce followed by the GCM ciphertext and tag.
pub fn encrypt_operation(key: &[u8; 32], plaintext: &[u8], id: &Uuid) -> Vec<u8> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce_bytes = operation_nonce(id);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let sealed = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .expect("aes-gcm seal");
    let mut out = Vec::with_capacity(12 + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    out
}

/// Open a sealed memo; any tampering fails as `Unauthorized`
pub fn decrypt_operation(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < 12 + 16 {
        return Err(Error::Unauthorized("sealed memo too short".into()));
    }
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&sealed[..12]);
    cipher
        .decrypt(nonce, &sealed[12..])
        .map_err(|_| Error::Unauthorized("memo authentication failed".into()))
}

fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn message_prefix(chain: Chain) -> &'static str {
    match chain {
        Chain::Bitcoin => "Bitcoin Signed Message:\n",
        Chain::Litecoin => "Litecoin Signed Message:\n",
        Chain::Ethereum | Chain::Polygon => "\x19Ethereum Signed Message:\n",
    }
}

/// Digest of an `APPROVE:`/`REVOKE:` message for the given chain
///
/// Bitcoin-family: double-SHA256 of the varstring-framed message. Ethereum
/// family: keccak256 of the EIP-191 personal-message frame.
pub fn hash_message_for_signature(msg: &str, chain: Chain) -> [u8; 32] {
    match chain {
        Chain::Bitcoin | Chain::Litecoin => {
            let prefix = message_prefix(chain);
            let mut frame = Vec::with_capacity(prefix.len() + msg.len() + 4);
            write_varint(&mut frame, prefix.len() as u64);
            frame.extend_from_slice(prefix.as_bytes());
            write_varint(&mut frame, msg.len() as u64);
            frame.extend_from_slice(msg.as_bytes());
            let once = Sha256::digest(&frame);
            let twice = Sha256::digest(once);
            twice.into()
        }
        Chain::Ethereum | Chain::Polygon => {
            use tiny_keccak::{Hasher, Keccak};
            let mut hasher = Keccak::v256();
            hasher.update(message_prefix(chain).as_bytes());
            hasher.update(msg.len().to_string().as_bytes());
            hasher.update(msg.as_bytes());
            let mut hash = [0u8; 32];
            hasher.finalize(&mut hash);
            hash
        }
    }
}

/// Verify a DER ECDSA signature over a 32-byte digest against a compressed
/// secp256k1 public key
pub fn verify_ecdsa_der(public: &[u8], digest: &[u8; 32], sig_der: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_sec1_bytes(public)
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    let sig = Signature::from_der(sig_der)
        .map_err(|e| Error::SignatureVerification(e.to_string()))?;
    // normalize high-s signatures the way chain nodes accept them
    let sig = sig.normalize_s().unwrap_or(sig);
    key.verify_prehash(digest, &sig)
        .map_err(|e| Error::SignatureVerification(e.to_string()))
}

/// Message payload for an account approval
pub fn approve_account_message(session_id: &Uuid, address: &str) -> String {
    format!("APPROVE:{session_id}:{address}")
}

/// Message payload for a transaction approval
pub fn approve_transaction_message(session_id: &Uuid, tx_hash: &str) -> String {
    format!("APPROVE:{session_id}:{tx_hash}")
}

/// Message payload for a revocation
pub fn revoke_transaction_message(request_id: &Uuid, tx_hash: &str) -> String {
    format!("REVOKE:{request_id}:{tx_hash}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Operation;
    use k256::ecdsa::{signature::hazmat::PrehashSigner, SigningKey};

    #[test]
    fn test_shared_key_symmetry() {
        let a: [u8; 32] = rand::random();
        let b: [u8; 32] = rand::random();
        let a_pub = x25519_public(&a);
        let b_pub = x25519_public(&b);
        assert_eq!(shared_key(&a, &b_pub), shared_key(&b, &a_pub));
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let key: [u8; 32] = rand::random();
        let op = Operation {
            id: Uuid::new_v4(),
            op_type: 110,
            curve: 1,
            public: vec![2u8; 33],
            extra: vec![1, 2, 3],
        };
        let sealed = encrypt_operation(&key, &op.encode(), &op.id);
        let opened = decrypt_operation(&key, &sealed).unwrap();
        assert_eq!(Operation::decode(&opened).unwrap(), op);

        // same operation seals to the same bytes
        assert_eq!(sealed, encrypt_operation(&key, &op.encode(), &op.id));
    }

    #[test]
    fn test_tampered_memo_is_unauthorized() {
        let key: [u8; 32] = rand::random();
        let mut sealed = encrypt_operation(&key, b"payload", &Uuid::new_v4());
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(matches!(
            decrypt_operation(&key, &sealed),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn test_wrong_key_is_unauthorized() {
        let key: [u8; 32] = rand::random();
        let other: [u8; 32] = rand::random();
        let sealed = encrypt_operation(&key, b"payload", &Uuid::new_v4());
        assert!(decrypt_operation(&other, &sealed).is_err());
    }

    #[test]
    fn test_message_hash_differs_per_chain() {
        let msg = "APPROVE:2e78d04a-e61a-442d-a014-dec19bd61cfe:bc1qtest";
        let btc = hash_message_for_signature(msg, Chain::Bitcoin);
        let ltc = hash_message_for_signature(msg, Chain::Litecoin);
        let eth = hash_message_for_signature(msg, Chain::Ethereum);
        assert_ne!(btc, ltc);
        assert_ne!(btc, eth);
        assert_eq!(btc, hash_message_for_signature(msg, Chain::Bitcoin));
    }

    #[test]
    fn test_verify_ecdsa_der() {
        let sk = SigningKey::random(&mut rand::thread_rng());
        let public = sk.verifying_key().to_encoded_point(true);
        let digest = hash_message_for_signature("REVOKE:a:b", Chain::Bitcoin);
        let sig: Signature = sk.sign_prehash(&digest).unwrap();

        verify_ecdsa_der(public.as_bytes(), &digest, sig.to_der().as_bytes()).unwrap();

        let wrong = hash_message_for_signature("REVOKE:a:c", Chain::Bitcoin);
        assert!(verify_ecdsa_der(public.as_bytes(), &wrong, sig.to_der().as_bytes()).is_err());
    }
}
