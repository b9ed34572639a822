//! Ethereum-family adapter: Gnosis-Safe-style 2/3 accounts with a guard
//! contract enforcing the observer time-lock
//!
//! The account address is deterministic: CREATE2 over the sorted owner set,
//! threshold 2 and a predetermined salt nonce, so every node computes the
//! same address without touching a chain node.

use crate::{Chain, Error, Result};
use alloy_primitives::{Address, U256};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tiny_keccak::{Hasher, Keccak};
use uuid::Uuid;

/// Proxy factory the account is counterfactually deployed through
pub const SAFE_PROXY_FACTORY_ADDRESS: &str = "0xa6B71E26C5e0845f74c812102Ca7114b6a896AB2";
/// Fallback handler wired into setup()
pub const SAFE_FALLBACK_HANDLER_ADDRESS: &str = "0xf48f2B2d2a534e402487b3ee7C18c33Aec0Fe5e4";
/// Predetermined salt nonce; every vault account uses the same one so the
/// address depends only on the owner set
pub const SAFE_SALT_NONCE: &str =
    "0xb1073742015cbcf5a3a4d9d1ae33ecf619439710b89475f92e2abd2117e90f90";
/// keccak256 of the proxy deployment init code, vendored from the deployed
/// factory artifacts
pub const SAFE_PROXY_INIT_CODE_HASH: &str =
    "0xe298282cefe913ab5d282047161268a8222e4bd4ed106300c547894bbefd31ee";

// setup(address[],uint256,address,bytes,address,address,uint256,address)
const SETUP_SELECTOR: [u8; 4] = [0xb6, 0x3e, 0x80, 0x0d];
// setGuard(address)
const SET_GUARD_SELECTOR: [u8; 4] = [0xe1, 0x9a, 0x9d, 0xd9];

/// Owner count of every vault account contract
pub const SAFE_OWNER_THRESHOLD: u64 = 2;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut hash = [0u8; 32];
    hasher.finalize(&mut hash);
    hash
}

/// EVM chain id of a vault chain
pub fn evm_chain_id(chain: Chain) -> Result<u64> {
    match chain {
        Chain::Ethereum => Ok(1),
        Chain::Polygon => Ok(137),
        _ => Err(Error::UnsupportedChain(chain as u8)),
    }
}

/// Address of a compressed secp256k1 public key
pub fn parse_compressed_public_key(public_hex: &str) -> Result<Address> {
    let bytes = hex::decode(public_hex)?;
    let key = VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    let uncompressed = key.to_encoded_point(false);
    let hash = keccak256(&uncompressed.as_bytes()[1..]);
    Ok(Address::from_slice(&hash[12..]))
}

/// Validate a holder public key for Ethereum-family accounts
pub fn verify_holder_key(public_hex: &str) -> Result<()> {
    parse_compressed_public_key(public_hex).map(|_| ())
}

/// Sort the three authorities by their addresses, the order the contract
/// stores owners in; returns (sorted addresses, matching public keys)
pub fn sorted_safe_owners(
    holder: &str,
    signer: &str,
    observer: &str,
) -> Result<(Vec<Address>, Vec<String>)> {
    let mut pairs = Vec::with_capacity(3);
    for public in [holder, signer, observer] {
        pairs.push((parse_compressed_public_key(public)?, public.to_string()));
    }
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let owners = pairs.iter().map(|(a, _)| *a).collect();
    let publics = pairs.into_iter().map(|(_, p)| p).collect();
    Ok((owners, publics))
}

fn word_address(addr: &Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(addr.as_slice());
    word
}

fn word_u256(value: U256) -> [u8; 32] {
    value.to_be_bytes()
}

/// ABI-encoded setup() calldata the proxy is initialized with
fn setup_initializer(owners: &[Address], threshold: u64) -> Vec<u8> {
    let blank = Address::ZERO;
    let handler = Address::from_str(SAFE_FALLBACK_HANDLER_ADDRESS).expect("handler address");

    let mut data = Vec::new();
    data.extend_from_slice(&SETUP_SELECTOR);
    // head: 8 static slots
    data.extend_from_slice(&word_u256(U256::from(8 * 32))); // owners offset
    data.extend_from_slice(&word_u256(U256::from(threshold)));
    data.extend_from_slice(&word_address(&blank)); // to
    let data_offset = 8 * 32 + 32 + owners.len() * 32;
    data.extend_from_slice(&word_u256(U256::from(data_offset)));
    data.extend_from_slice(&word_address(&handler));
    data.extend_from_slice(&word_address(&blank)); // payment token
    data.extend_from_slice(&word_u256(U256::ZERO)); // payment
    data.extend_from_slice(&word_address(&blank)); // payment receiver
    // tail: owners array then empty bytes
    data.extend_from_slice(&word_u256(U256::from(owners.len())));
    for owner in owners {
        data.extend_from_slice(&word_address(owner));
    }
    data.extend_from_slice(&word_u256(U256::ZERO));
    data
}

/// CREATE2 address of the account for a sorted owner set
pub fn safe_account_address(owners: &[Address], threshold: u64) -> Address {
    let factory = Address::from_str(SAFE_PROXY_FACTORY_ADDRESS).expect("factory address");
    let init_code_hash =
        hex::decode(&SAFE_PROXY_INIT_CODE_HASH[2..]).expect("init code hash");
    let nonce = hex::decode(&SAFE_SALT_NONCE[2..]).expect("salt nonce");

    let initializer_hash = keccak256(&setup_initializer(owners, threshold));
    let mut salt_preimage = Vec::with_capacity(64);
    salt_preimage.extend_from_slice(&initializer_hash);
    salt_preimage.extend_from_slice(&nonce);
    let salt = keccak256(&salt_preimage);

    let mut input = Vec::with_capacity(1 + 20 + 32 + 32);
    input.push(0xff);
    input.extend_from_slice(factory.as_slice());
    input.extend_from_slice(&salt);
    input.extend_from_slice(&init_code_hash);
    Address::from_slice(&keccak256(&input)[12..])
}

/// Deterministic guard contract address for a vault account
///
/// The guard is deployed by the factory keyed on the account, the observer
/// and the delay, so every node derives the same address offline.
pub fn guard_address(safe: &Address, observer: &Address, timelock_hours: u32) -> Address {
    let mut preimage = Vec::with_capacity(20 + 20 + 4 + 5);
    preimage.extend_from_slice(b"guard");
    preimage.extend_from_slice(safe.as_slice());
    preimage.extend_from_slice(observer.as_slice());
    preimage.extend_from_slice(&timelock_hours.to_be_bytes());
    Address::from_slice(&keccak256(&preimage)[12..])
}

/// A vault account on an Ethereum-family chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GnosisSafe {
    /// Guard delay in hours
    pub sequence: u32,
    pub address: String,
    /// Hash of the enable-guard transaction the account must execute first
    pub tx_hash: String,
}

impl GnosisSafe {
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        write_chunk(&mut buf, self.address.as_bytes());
        write_chunk(&mut buf, self.tx_hash.as_bytes());
        buf
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        if b.len() < 4 {
            return Err(Error::MalformedEnvelope("short gnosis account".into()));
        }
        let sequence = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let mut offset = 4;
        let address = read_chunk(b, &mut offset)?;
        let tx_hash = read_chunk(b, &mut offset)?;
        if offset != b.len() {
            return Err(Error::MalformedEnvelope("trailing gnosis bytes".into()));
        }
        Ok(GnosisSafe {
            sequence,
            address: String::from_utf8(address)
                .map_err(|e| Error::MalformedEnvelope(e.to_string()))?,
            tx_hash: String::from_utf8(tx_hash)
                .map_err(|e| Error::MalformedEnvelope(e.to_string()))?,
        })
    }
}

fn write_chunk(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u16).to_be_bytes());
    buf.extend_from_slice(b);
}

fn read_chunk(b: &[u8], offset: &mut usize) -> Result<Vec<u8>> {
    if b.len() < *offset + 2 {
        return Err(Error::MalformedEnvelope("truncated chunk length".into()));
    }
    let len = u16::from_be_bytes([b[*offset], b[*offset + 1]]) as usize;
    *offset += 2;
    if b.len() < *offset + len {
        return Err(Error::MalformedEnvelope("chunk exceeds buffer".into()));
    }
    let out = b[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

// EIP712Domain(uint256 chainId,address verifyingContract)
const DOMAIN_TYPEHASH_PREIMAGE: &[u8] =
    b"EIP712Domain(uint256 chainId,address verifyingContract)";
// SafeTx(...) per the deployed contract
const SAFE_TX_TYPEHASH_PREIMAGE: &[u8] = b"SafeTx(address to,uint256 value,bytes data,uint8 operation,uint256 safeTxGas,uint256 baseGas,uint256 gasPrice,address gasToken,address refundReceiver,uint256 nonce)";

/// A multisig transaction of a vault account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeTransaction {
    pub chain_id: u64,
    pub safe_address: String,
    pub destination: String,
    pub value: U256,
    pub data: Vec<u8>,
    pub nonce: u64,
    /// 65-byte r||s||v signatures collected so far
    pub signatures: Vec<Vec<u8>>,
}

impl SafeTransaction {
    pub fn new(
        chain_id: u64,
        safe_address: &str,
        destination: &str,
        value: U256,
        data: Vec<u8>,
        nonce: u64,
    ) -> Self {
        Self {
            chain_id,
            safe_address: safe_address.to_string(),
            destination: destination.to_string(),
            value,
            data,
            nonce,
            signatures: Vec::new(),
        }
    }

    /// EIP-712 digest every owner signs
    pub fn hash_digest(&self) -> Result<[u8; 32]> {
        let safe = Address::from_str(&self.safe_address)
            .map_err(|e| Error::InvalidAddress(e.to_string()))?;
        let to = Address::from_str(&self.destination)
            .map_err(|e| Error::InvalidAddress(e.to_string()))?;

        let mut domain = Vec::with_capacity(96);
        domain.extend_from_slice(&keccak256(DOMAIN_TYPEHASH_PREIMAGE));
        domain.extend_from_slice(&word_u256(U256::from(self.chain_id)));
        domain.extend_from_slice(&word_address(&safe));
        let domain_hash = keccak256(&domain);

        let mut encoded = Vec::with_capacity(11 * 32);
        encoded.extend_from_slice(&keccak256(SAFE_TX_TYPEHASH_PREIMAGE));
        encoded.extend_from_slice(&word_address(&to));
        encoded.extend_from_slice(&word_u256(self.value));
        encoded.extend_from_slice(&keccak256(&self.data));
        for _ in 0..5 {
            // operation, safeTxGas, baseGas, gasPrice, gasToken are all zero
            encoded.extend_from_slice(&word_u256(U256::ZERO));
        }
        encoded.extend_from_slice(&word_address(&Address::ZERO)); // refund receiver
        encoded.extend_from_slice(&word_u256(U256::from(self.nonce)));
        let struct_hash = keccak256(&encoded);

        let mut preimage = Vec::with_capacity(66);
        preimage.extend_from_slice(&[0x19, 0x01]);
        preimage.extend_from_slice(&domain_hash);
        preimage.extend_from_slice(&struct_hash);
        Ok(keccak256(&preimage))
    }

    /// Hex transaction hash used as the approval record key
    pub fn tx_hash(&self) -> Result<String> {
        Ok(format!("0x{}", hex::encode(self.hash_digest()?)))
    }

    /// Record one 65-byte signature; duplicates by signer are ignored
    pub fn add_signature(&mut self, signature: Vec<u8>) -> Result<()> {
        if signature.len() != 65 {
            return Err(Error::SignatureVerification(format!(
                "safe signature must be 65 bytes, got {}",
                signature.len()
            )));
        }
        if !self.signatures.contains(&signature) {
            self.signatures.push(signature);
        }
        Ok(())
    }

    fn recover_signer(&self, signature: &[u8]) -> Result<Address> {
        let digest = self.hash_digest()?;
        let sig = Signature::from_slice(&signature[..64])
            .map_err(|e| Error::SignatureVerification(e.to_string()))?;
        let v = match signature[64] {
            v @ 0..=1 => v,
            v @ 27..=28 => v - 27,
            v => {
                return Err(Error::SignatureVerification(format!(
                    "invalid recovery id {v}"
                )))
            }
        };
        let recovery = RecoveryId::try_from(v)
            .map_err(|e| Error::SignatureVerification(e.to_string()))?;
        let key = VerifyingKey::recover_from_prehash(&digest, &sig, recovery)
            .map_err(|e| Error::SignatureVerification(e.to_string()))?;
        let uncompressed = key.to_encoded_point(false);
        let hash = keccak256(&uncompressed.as_bytes()[1..]);
        Ok(Address::from_slice(&hash[12..]))
    }

    /// Whether the owner behind `public_hex` has signed this transaction
    pub fn signed_by(&self, public_hex: &str) -> bool {
        let owner = match parse_compressed_public_key(public_hex) {
            Ok(addr) => addr,
            Err(_) => return false,
        };
        self.signatures
            .iter()
            .any(|sig| self.recover_signer(sig).map_or(false, |a| a == owner))
    }

    /// Count the distinct authorities among {holder, signer, observer} that
    /// have signed
    pub fn count_authority_signatures(&self, holder: &str, signer: &str, observer: &str) -> usize {
        [holder, signer, observer]
            .iter()
            .filter(|public| self.signed_by(public))
            .count()
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.chain_id.to_be_bytes());
        write_chunk(&mut buf, self.safe_address.as_bytes());
        write_chunk(&mut buf, self.destination.as_bytes());
        buf.extend_from_slice(&word_u256(self.value));
        write_chunk(&mut buf, &self.data);
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&(self.signatures.len() as u16).to_be_bytes());
        for sig in &self.signatures {
            write_chunk(&mut buf, sig);
        }
        buf
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        if b.len() < 8 {
            return Err(Error::MalformedEnvelope("short safe transaction".into()));
        }
        let chain_id = u64::from_be_bytes(b[..8].try_into().expect("8 bytes"));
        let mut offset = 8;
        let safe_address = read_chunk(b, &mut offset)?;
        let destination = read_chunk(b, &mut offset)?;
        if b.len() < offset + 32 {
            return Err(Error::MalformedEnvelope("truncated value".into()));
        }
        let value = U256::from_be_slice(&b[offset..offset + 32]);
        offset += 32;
        let data = read_chunk(b, &mut offset)?;
        if b.len() < offset + 10 {
            return Err(Error::MalformedEnvelope("truncated nonce".into()));
        }
        let nonce = u64::from_be_bytes(b[offset..offset + 8].try_into().expect("8 bytes"));
        offset += 8;
        let count = u16::from_be_bytes([b[offset], b[offset + 1]]) as usize;
        offset += 2;
        let mut signatures = Vec::with_capacity(count);
        for _ in 0..count {
            signatures.push(read_chunk(b, &mut offset)?);
        }
        if offset != b.len() {
            return Err(Error::MalformedEnvelope("trailing safe tx bytes".into()));
        }
        Ok(SafeTransaction {
            chain_id,
            safe_address: String::from_utf8(safe_address)
                .map_err(|e| Error::MalformedEnvelope(e.to_string()))?,
            destination: String::from_utf8(destination)
                .map_err(|e| Error::MalformedEnvelope(e.to_string()))?,
            value,
            data,
            nonce,
            signatures,
        })
    }
}

/// Build the account and its enable-guard transaction
pub fn build_gnosis_safe(
    holder: &str,
    signer: &str,
    observer: &str,
    request_id: &Uuid,
    timelock_secs: u64,
    chain: Chain,
) -> Result<(GnosisSafe, SafeTransaction)> {
    use super::bitcoin::{TIMELOCK_MAXIMUM_SECS, TIMELOCK_MINIMUM_SECS};
    if !(TIMELOCK_MINIMUM_SECS..=TIMELOCK_MAXIMUM_SECS).contains(&timelock_secs) {
        return Err(Error::TimelockOutOfRange(timelock_secs));
    }
    let sequence = (timelock_secs / 3_600) as u32;

    let (owners, _) = sorted_safe_owners(holder, signer, observer)?;
    let safe = safe_account_address(&owners, SAFE_OWNER_THRESHOLD);
    let observer_address = parse_compressed_public_key(observer)?;
    let guard = guard_address(&safe, &observer_address, sequence);

    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&SET_GUARD_SELECTOR);
    data.extend_from_slice(&word_address(&guard));

    // the guard-enable nonce is bound to the proposing request
    let nonce = u64::from_be_bytes(request_id.as_bytes()[..8].try_into().expect("8 bytes"));
    let tx = SafeTransaction::new(
        evm_chain_id(chain)?,
        &safe.to_checksum(None),
        &safe.to_checksum(None),
        U256::ZERO,
        data,
        nonce,
    );

    Ok((
        GnosisSafe {
            sequence,
            address: safe.to_checksum(None),
            tx_hash: tx.tx_hash()?,
        },
        tx,
    ))
}

/// Verify a 64/65-byte r||s[, v] signature over a 32-byte digest
pub fn verify_hash_signature(public_hex: &str, digest: &[u8; 32], signature: &[u8]) -> Result<()> {
    use k256::ecdsa::signature::hazmat::PrehashVerifier;
    if signature.len() < 64 {
        return Err(Error::SignatureVerification("signature too short".into()));
    }
    let bytes = hex::decode(public_hex)?;
    let key = VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|e| Error::InvalidKey(e.to_string()))?;
    let sig = Signature::from_slice(&signature[..64])
        .map_err(|e| Error::SignatureVerification(e.to_string()))?;
    let sig = sig.normalize_s().unwrap_or(sig);
    key.verify_prehash(digest, &sig)
        .map_err(|e| Error::SignatureVerification(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::{signature::hazmat::PrehashSigner, SigningKey};

    const HOLDER: &str = "039c2f5ebdd4eae6d69e7a98b737beeb78e0a8d42c7b957a0fbe0c41658d16ab40";
    const SIGNER: &str = "02339baf159c94cc116562d609097ff3c3bd340a34b9f7d50cc22b8d520301a7c9";
    const OBSERVER: &str = "0333870af2985a674f28bb12290bb0eb403987c2211d9f26267cc4d45ae6797e7c";

    #[test]
    fn test_sorted_owners_are_order_independent() {
        let (a, _) = sorted_safe_owners(HOLDER, SIGNER, OBSERVER).unwrap();
        let (b, _) = sorted_safe_owners(OBSERVER, HOLDER, SIGNER).unwrap();
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_safe_address_deterministic() {
        let (owners, _) = sorted_safe_owners(HOLDER, SIGNER, OBSERVER).unwrap();
        let a = safe_account_address(&owners, SAFE_OWNER_THRESHOLD);
        let b = safe_account_address(&owners, SAFE_OWNER_THRESHOLD);
        assert_eq!(a, b);

        let (others, _) = sorted_safe_owners(HOLDER, SIGNER, HOLDER).unwrap();
        assert_ne!(a, safe_account_address(&others, SAFE_OWNER_THRESHOLD));
    }

    #[test]
    fn test_build_gnosis_safe() {
        let rid = Uuid::parse_str("2e78d04a-e61a-442d-a014-dec19bd61cfe").unwrap();
        let (gs, tx) =
            build_gnosis_safe(HOLDER, SIGNER, OBSERVER, &rid, 24 * 3_600, Chain::Polygon).unwrap();
        assert_eq!(gs.sequence, 24);
        assert!(gs.address.starts_with("0x"));
        assert_eq!(gs.tx_hash, tx.tx_hash().unwrap());
        assert_eq!(tx.chain_id, 137);

        // marshal round trips
        let restored = GnosisSafe::unmarshal(&gs.marshal()).unwrap();
        assert_eq!(gs, restored);
        let restored = SafeTransaction::unmarshal(&tx.marshal()).unwrap();
        assert_eq!(tx, restored);

        assert!(build_gnosis_safe(HOLDER, SIGNER, OBSERVER, &rid, 60, Chain::Polygon).is_err());
    }

    fn signing_pair() -> (SigningKey, String) {
        let sk = SigningKey::from_slice(&[11u8; 32]).unwrap();
        let public = hex::encode(sk.verifying_key().to_encoded_point(true).as_bytes());
        (sk, public)
    }

    #[test]
    fn test_safe_transaction_signatures() {
        let (sk, public) = signing_pair();
        let owner = parse_compressed_public_key(&public).unwrap();
        let mut tx = SafeTransaction::new(
            1,
            &owner.to_checksum(None),
            &Address::ZERO.to_checksum(None),
            U256::from(1_000_000u64),
            vec![],
            7,
        );
        let digest = tx.hash_digest().unwrap();
        let (sig, rid): (Signature, RecoveryId) = sk.sign_prehash(&digest).unwrap();
        let mut raw = sig.to_bytes().to_vec();
        raw.push(rid.to_byte());

        assert!(!tx.signed_by(&public));
        tx.add_signature(raw.clone()).unwrap();
        tx.add_signature(raw).unwrap();
        assert_eq!(tx.signatures.len(), 1);
        assert!(tx.signed_by(&public));
        assert!(!tx.signed_by(HOLDER));
        assert_eq!(tx.count_authority_signatures(&public, HOLDER, SIGNER), 1);

        assert!(tx.add_signature(vec![0u8; 10]).is_err());
    }

    #[test]
    fn test_verify_hash_signature() {
        let (sk, public) = signing_pair();
        let digest = keccak256(b"payload");
        let (sig, _): (Signature, RecoveryId) = sk.sign_prehash(&digest).unwrap();
        verify_hash_signature(&public, &digest, &sig.to_bytes()).unwrap();

        let wrong = keccak256(b"other");
        assert!(verify_hash_signature(&public, &wrong, &sig.to_bytes()).is_err());
    }

    #[test]
    fn test_guard_address_depends_on_delay() {
        let safe = Address::ZERO;
        let observer = parse_compressed_public_key(OBSERVER).unwrap();
        assert_ne!(
            guard_address(&safe, &observer, 24),
            guard_address(&safe, &observer, 48)
        );
    }
}
