//! Bitcoin-family adapter: witness scripts, PSBT assembly, sighashes,
//! BIP32 derivation and accountant fee inputs
//!
//! The vault account is a P2WSH script with two spending branches selected
//! by the input sequence field:
//!
//! ```text
//! OP_IF
//!   2 <holder> <signer> <observer> 3 OP_CHECKMULTISIG
//! OP_ELSE
//!   <csv blocks> OP_CHECKSEQUENCEVERIFY OP_DROP
//!   <observer> OP_CHECKSIGVERIFY
//!   1 <holder> <signer> 2 OP_CHECKMULTISIG
//! OP_ENDIF
//! ```
//!
//! The normal branch needs holder + signer. The recovery branch only becomes
//! valid once the relative time-lock expires, and the observer signature is
//! mandatory there alongside one of holder/signer.

use crate::{Chain, Error, Result};
use bitcoin::absolute::LockTime;
use bitcoin::bip32::{ChainCode, ChildNumber, Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIGVERIFY, OP_CSV, OP_DROP, OP_ELSE, OP_ENDIF, OP_IF,
    OP_PUSHBYTES_0, OP_PUSHNUM_1, OP_PUSHNUM_2, OP_PUSHNUM_3,
};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, CompressedPublicKey, NetworkKind, OutPoint, Psbt, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use std::str::FromStr;
use uuid::Uuid;

/// Input sequence selecting the normal multisig branch
pub const MAX_TRANSACTION_SEQUENCE: u32 = 0xffffffff;

/// Shortest accepted account time-lock
pub const TIMELOCK_MINIMUM_SECS: u64 = 3_600;
/// Longest accepted account time-lock
pub const TIMELOCK_MAXIMUM_SECS: u64 = 365 * 24 * 3_600;

/// Sighash flag applied to every vault signature
pub const SIGHASH_TYPE: EcdsaSighashType = EcdsaSighashType::All;

/// Outputs below this are not worth creating
pub fn value_dust(chain: Chain) -> u64 {
    match chain {
        Chain::Litecoin => 10_000,
        _ => 1_000,
    }
}

fn chain_hrp(chain: Chain) -> Result<bech32::Hrp> {
    match chain {
        Chain::Bitcoin => Ok(bech32::Hrp::parse_unchecked("bc")),
        Chain::Litecoin => Ok(bech32::Hrp::parse_unchecked("ltc")),
        _ => Err(Error::UnsupportedChain(chain as u8)),
    }
}

/// Convert a time-lock duration to CSV blocks at the chain's block interval
pub fn timelock_blocks(timelock_secs: u64, chain: Chain) -> Result<u32> {
    if !(TIMELOCK_MINIMUM_SECS..=TIMELOCK_MAXIMUM_SECS).contains(&timelock_secs) {
        return Err(Error::TimelockOutOfRange(timelock_secs));
    }
    let blocks = timelock_secs / chain.block_time_secs();
    Ok(blocks.max(1) as u32)
}

/// A vault account on a Bitcoin-family chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WitnessScriptAccount {
    /// CSV blocks of the recovery branch
    pub sequence: u32,
    /// The full witness script
    pub script: ScriptBuf,
    /// bech32 P2WSH address
    pub address: String,
}

impl WitnessScriptAccount {
    /// Length-prefixed binary form carried in observer notifications
    pub fn marshal(&self) -> Vec<u8> {
        let script = self.script.as_bytes();
        let address = self.address.as_bytes();
        let mut buf = Vec::with_capacity(8 + script.len() + address.len());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&(script.len() as u16).to_be_bytes());
        buf.extend_from_slice(script);
        buf.extend_from_slice(&(address.len() as u16).to_be_bytes());
        buf.extend_from_slice(address);
        buf
    }

    pub fn unmarshal(b: &[u8]) -> Result<Self> {
        if b.len() < 8 {
            return Err(Error::MalformedEnvelope("short witness account".into()));
        }
        let sequence = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let mut offset = 4;
        let script = read_chunk(b, &mut offset)?;
        let address = read_chunk(b, &mut offset)?;
        if offset != b.len() {
            return Err(Error::MalformedEnvelope("trailing witness bytes".into()));
        }
        Ok(WitnessScriptAccount {
            sequence,
            script: ScriptBuf::from_bytes(script),
            address: String::from_utf8(address)
                .map_err(|e| Error::MalformedEnvelope(e.to_string()))?,
        })
    }
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

fn parse_compressed(public_hex: &str) -> Result<[u8; 33]> {
    let bytes = hex::decode(public_hex)?;
    let key = PublicKey::from_slice(&bytes).map_err(|e| Error::InvalidKey(e.to_string()))?;
    Ok(key.serialize())
}

/// Build the 2-of-3 witness script account for the three authorities
pub fn build_witness_account(
    holder: &str,
    signer: &str,
    observer: &str,
    timelock_secs: u64,
    chain: Chain,
) -> Result<WitnessScriptAccount> {
    let holder = parse_compressed(holder)?;
    let signer = parse_compressed(signer)?;
    let observer = parse_compressed(observer)?;
    let sequence = timelock_blocks(timelock_secs, chain)?;

    let script = Builder::new()
        .push_opcode(OP_IF)
        .push_opcode(OP_PUSHNUM_2)
        .push_slice(holder)
        .push_slice(signer)
        .push_slice(observer)
        .push_opcode(OP_PUSHNUM_3)
        .push_opcode(OP_CHECKMULTISIG)
        .push_opcode(OP_ELSE)
        .push_int(sequence as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_slice(observer)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_opcode(OP_PUSHNUM_1)
        .push_slice(holder)
        .push_slice(signer)
        .push_opcode(OP_PUSHNUM_2)
        .push_opcode(OP_CHECKMULTISIG)
        .push_opcode(OP_ENDIF)
        .into_script();

    let address = p2wsh_address(&script, chain)?;
    Ok(WitnessScriptAccount {
        sequence,
        script,
        address,
    })
}

/// bech32 address of the P2WSH program committing to `script`
pub fn p2wsh_address(script: &ScriptBuf, chain: Chain) -> Result<String> {
    let hrp = chain_hrp(chain)?;
    let program = script.wscript_hash();
    bech32::segwit::encode(hrp, bech32::Fe32::Q, program.as_byte_array())
        .map_err(|e| Error::InvalidAddress(e.to_string()))
}

/// Decode a bech32 address into its scriptPubKey
pub fn address_script(address: &str, chain: Chain) -> Result<ScriptBuf> {
    let hrp = chain_hrp(chain)?;
    let (decoded_hrp, version, program) = bech32::segwit::decode(address)
        .map_err(|e| Error::InvalidAddress(format!("{address}: {e}")))?;
    if decoded_hrp != hrp {
        return Err(Error::InvalidAddress(format!(
            "{address}: wrong prefix for {chain}"
        )));
    }
    let builder = match version.to_u8() {
        0 => Builder::new().push_opcode(OP_PUSHBYTES_0),
        1 => Builder::new().push_opcode(OP_PUSHNUM_1),
        v => {
            return Err(Error::InvalidAddress(format!(
                "{address}: unsupported witness version {v}"
            )))
        }
    };
    let program = PushBytesBuf::try_from(program)
        .map_err(|e| Error::InvalidAddress(e.to_string()))?;
    Ok(builder.push_slice(program).into_script())
}

/// Validate an address for the chain
pub fn verify_address(address: &str, chain: Chain) -> Result<()> {
    address_script(address, chain).map(|_| ())
}

/// One spendable output of a vault or accountant wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub transaction_hash: String,
    pub index: u32,
    pub satoshi: u64,
    /// Witness script for vault inputs, empty for P2WPKH fee inputs
    pub script: ScriptBuf,
    /// Branch selector: `MAX_TRANSACTION_SEQUENCE` or the CSV block count
    pub sequence: u32,
}

/// Virtual-size estimate: witness-discounted weight of
/// `40 + 300·inputs + 128·outputs` bytes
pub fn estimate_virtual_size(inputs: usize, outputs: usize) -> u64 {
    (40 + inputs as u64 * 300 + outputs as u64 * 128) / 4
}

/// Assemble the unsigned PSBT for a vault spend
///
/// Outputs are `(address, satoshi)` pairs; a zero-value OP_RETURN embedding
/// the 16-byte request id is always appended so the settled transaction can
/// be reconciled with the authorizing request.
pub fn build_partially_signed_transaction(
    inputs: &[Input],
    outputs: &[(String, u64)],
    request_id: &Uuid,
    chain: Chain,
) -> Result<Psbt> {
    if inputs.is_empty() {
        return Err(Error::TransactionEncoding("no inputs".into()));
    }
    let mut tx_inputs = Vec::with_capacity(inputs.len());
    for input in inputs {
        let txid = Txid::from_str(&input.transaction_hash)
            .map_err(|e| Error::TransactionEncoding(e.to_string()))?;
        tx_inputs.push(TxIn {
            previous_output: OutPoint {
                txid,
                vout: input.index,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence(input.sequence),
            witness: Witness::new(),
        });
    }

    let mut tx_outputs = Vec::with_capacity(outputs.len() + 1);
    for (address, satoshi) in outputs {
        tx_outputs.push(TxOut {
            value: Amount::from_sat(*satoshi),
            script_pubkey: address_script(address, chain)?,
        });
    }
    let rid = PushBytesBuf::try_from(request_id.as_bytes().to_vec())
        .expect("16 byte push");
    tx_outputs.push(TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::new_op_return(rid),
    });

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: tx_inputs,
        output: tx_outputs,
    };

    let mut psbt =
        Psbt::from_unsigned_tx(tx).map_err(|e| Error::TransactionEncoding(e.to_string()))?;
    for (i, input) in inputs.iter().enumerate() {
        psbt.inputs[i].witness_utxo = Some(TxOut {
            value: Amount::from_sat(input.satoshi),
            script_pubkey: ScriptBuf::new_p2wsh(&input.script.wscript_hash()),
        });
        psbt.inputs[i].witness_script = Some(input.script.clone());
        psbt.inputs[i].sighash_type = Some(SIGHASH_TYPE.into());
    }
    Ok(psbt)
}

/// Transaction id of the PSBT's unsigned transaction
pub fn psbt_hash(psbt: &Psbt) -> String {
    psbt.unsigned_tx.compute_txid().to_string()
}

/// BIP143 digest to sign for one vault input
pub fn sig_hash(psbt: &Psbt, index: usize) -> Result<[u8; 32]> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or_else(|| Error::TransactionEncoding(format!("no input {index}")))?;
    let script = input
        .witness_script
        .as_ref()
        .ok_or_else(|| Error::TransactionEncoding("missing witness script".into()))?;
    let utxo = input
        .witness_utxo
        .as_ref()
        .ok_or_else(|| Error::TransactionEncoding("missing witness utxo".into()))?;
    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let digest = cache
        .p2wsh_signature_hash(index, script, utxo.value, SIGHASH_TYPE)
        .map_err(|e| Error::TransactionEncoding(e.to_string()))?;
    Ok(digest.to_byte_array())
}

/// Record one partial DER signature on a PSBT input
pub fn add_partial_signature(
    psbt: &mut Psbt,
    index: usize,
    public: &[u8],
    signature_der: &[u8],
) -> Result<()> {
    let key =
        bitcoin::PublicKey::from_slice(public).map_err(|e| Error::InvalidKey(e.to_string()))?;
    let signature = bitcoin::secp256k1::ecdsa::Signature::from_der(signature_der)
        .map_err(|e| Error::SignatureVerification(e.to_string()))?;
    let input = psbt
        .inputs
        .get_mut(index)
        .ok_or_else(|| Error::TransactionEncoding(format!("no input {index}")))?;
    input.partial_sigs.insert(
        key,
        bitcoin::ecdsa::Signature {
            signature,
            sighash_type: SIGHASH_TYPE,
        },
    );
    Ok(())
}

fn sig_push(der: &[u8]) -> Vec<u8> {
    let mut b = Vec::with_capacity(der.len() + 1);
    b.extend_from_slice(der);
    b.push(SIGHASH_TYPE as u8);
    b
}

/// Witness stack for the normal branch: holder + signer
pub fn multisig_witness(script: &ScriptBuf, holder_sig: &[u8], signer_sig: &[u8]) -> Witness {
    let mut witness = Witness::new();
    witness.push(Vec::new()); // CHECKMULTISIG dummy
    witness.push(sig_push(holder_sig));
    witness.push(sig_push(signer_sig));
    witness.push(vec![1u8]); // select the multisig branch
    witness.push(script.as_bytes());
    witness
}

/// Witness stack for the recovery branch: observer is mandatory, the other
/// signature is whichever of holder/signer co-signed
pub fn recovery_witness(script: &ScriptBuf, observer_sig: &[u8], other_sig: &[u8]) -> Witness {
    let mut witness = Witness::new();
    witness.push(Vec::new()); // CHECKMULTISIG dummy
    witness.push(sig_push(other_sig));
    witness.push(sig_push(observer_sig));
    witness.push(Vec::new()); // select the time-locked branch
    witness.push(script.as_bytes());
    witness
}

/// P2WPKH scriptPubKey of an accountant key
pub fn p2wpkh_script(public: &PublicKey) -> ScriptBuf {
    let compressed = CompressedPublicKey(*public);
    ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash())
}

/// Append accountant fee inputs to a fully signed vault transaction and sign
/// them; the fee-input values are consumed entirely as the miner fee
pub fn spend_signed_transaction(
    tx: &Transaction,
    fee_inputs: &[Input],
    accountant_secret_hex: &str,
    _chain: Chain,
) -> Result<Transaction> {
    let secret = hex::decode(accountant_secret_hex)?;
    let sk = SecretKey::from_slice(&secret).map_err(|e| Error::InvalidKey(e.to_string()))?;
    let secp = Secp256k1::new();
    let pk = sk.public_key(&secp);
    let script_pubkey = p2wpkh_script(&pk);

    let mut spent = tx.clone();
    let base = spent.input.len();
    for input in fee_inputs {
        let txid = Txid::from_str(&input.transaction_hash)
            .map_err(|e| Error::TransactionEncoding(e.to_string()))?;
        spent.input.push(TxIn {
            previous_output: OutPoint {
                txid,
                vout: input.index,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence(MAX_TRANSACTION_SEQUENCE),
            witness: Witness::new(),
        });
    }

    let mut digests = Vec::with_capacity(fee_inputs.len());
    {
        let mut cache = SighashCache::new(&spent);
        for (i, input) in fee_inputs.iter().enumerate() {
            let digest = cache
                .p2wpkh_signature_hash(
                    base + i,
                    &script_pubkey,
                    Amount::from_sat(input.satoshi),
                    SIGHASH_TYPE,
                )
                .map_err(|e| Error::TransactionEncoding(e.to_string()))?;
            digests.push(digest.to_byte_array());
        }
    }
    for (i, digest) in digests.into_iter().enumerate() {
        let message = bitcoin::secp256k1::Message::from_digest(digest);
        let signature = secp.sign_ecdsa(&message, &sk);
        let mut witness = Witness::new();
        witness.push(sig_push(&signature.serialize_der()));
        witness.push(pk.serialize());
        spent.input[base + i].witness = witness;
    }
    Ok(spent)
}

/// Request id embedded in the transaction's OP_RETURN output, if any
pub fn extract_request_id(tx: &Transaction) -> Option<Uuid> {
    for output in &tx.output {
        let script = output.script_pubkey.as_bytes();
        if script.len() == 18 && script[0] == 0x6a && script[1] == 16 {
            return Uuid::from_slice(&script[2..18]).ok();
        }
    }
    None
}

fn path_children(path: &[u8]) -> Result<Vec<u32>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let depth = path[0] as usize;
    if path.len() < 1 + depth {
        return Err(Error::Crypto(format!("short derivation path {path:?}")));
    }
    Ok(path[1..1 + depth].iter().map(|b| *b as u32).collect())
}

/// Non-hardened BIP32 public derivation along a compact `[depth, i...]` path
pub fn derive_public_child(public: &[u8], chain_code: &[u8; 32], path: &[u8]) -> Result<Vec<u8>> {
    let children = path_children(path)?;
    let mut xpub = Xpub {
        network: NetworkKind::Main,
        depth: 0,
        parent_fingerprint: Default::default(),
        child_number: ChildNumber::from_normal_idx(0).expect("zero index"),
        public_key: PublicKey::from_slice(public)
            .map_err(|e| Error::InvalidKey(e.to_string()))?,
        chain_code: ChainCode::from(*chain_code),
    };
    let secp = Secp256k1::verification_only();
    for index in children {
        let child = ChildNumber::from_normal_idx(index)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        xpub = xpub
            .ckd_pub(&secp, child)
            .map_err(|e| Error::Crypto(e.to_string()))?;
    }
    Ok(xpub.public_key.serialize().to_vec())
}

/// Non-hardened BIP32 private derivation, the signer pool's counterpart of
/// [`derive_public_child`]
pub fn derive_private_child(
    secret: &[u8; 32],
    chain_code: &[u8; 32],
    path: &[u8],
) -> Result<[u8; 32]> {
    let children = path_children(path)?;
    let mut xpriv = Xpriv {
        network: NetworkKind::Main,
        depth: 0,
        parent_fingerprint: Default::default(),
        child_number: ChildNumber::from_normal_idx(0).expect("zero index"),
        private_key: SecretKey::from_slice(secret)
            .map_err(|e| Error::InvalidKey(e.to_string()))?,
        chain_code: ChainCode::from(*chain_code),
    };
    let secp = Secp256k1::new();
    for index in children {
        let child = ChildNumber::from_normal_idx(index)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        xpriv = xpriv
            .derive_priv(&secp, &[child])
            .map_err(|e| Error::Crypto(e.to_string()))?;
    }
    Ok(xpriv.private_key.secret_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::consensus::encode::serialize as consensus_serialize;

    const HOLDER: &str = "039c2f5ebdd4eae6d69e7a98b737beeb78e0a8d42c7b957a0fbe0c41658d16ab40";
    const SIGNER: &str = "02339baf159c94cc116562d609097ff3c3bd340a34b9f7d50cc22b8d520301a7c9";
    const OBSERVER: &str = "0333870af2985a674f28bb12290bb0eb403987c2211d9f26267cc4d45ae6797e7c";

    fn account() -> WitnessScriptAccount {
        build_witness_account(HOLDER, SIGNER, OBSERVER, TIMELOCK_MINIMUM_SECS, Chain::Bitcoin)
            .unwrap()
    }

    #[test]
    fn test_build_witness_account() {
        let wsa = account();
        assert!(wsa.address.starts_with("bc1q"), "{}", wsa.address);
        assert_eq!(wsa.sequence, 6);

        // deterministic for the same authorities
        assert_eq!(wsa, account());

        // a different observer changes both script and address
        let other =
            build_witness_account(HOLDER, SIGNER, HOLDER, TIMELOCK_MINIMUM_SECS, Chain::Bitcoin)
                .unwrap();
        assert_ne!(wsa.address, other.address);
    }

    #[test]
    fn test_witness_account_marshal_round_trip() {
        let wsa = account();
        let restored = WitnessScriptAccount::unmarshal(&wsa.marshal()).unwrap();
        assert_eq!(wsa, restored);
        assert!(WitnessScriptAccount::unmarshal(&wsa.marshal()[..7]).is_err());
    }

    #[test]
    fn test_timelock_blocks() {
        assert_eq!(timelock_blocks(3_600, Chain::Bitcoin).unwrap(), 6);
        assert_eq!(timelock_blocks(7_200, Chain::Litecoin).unwrap(), 48);
        assert!(timelock_blocks(60, Chain::Bitcoin).is_err());
        assert!(timelock_blocks(366 * 24 * 3_600, Chain::Bitcoin).is_err());
    }

    #[test]
    fn test_address_round_trip() {
        let wsa = account();
        let script = address_script(&wsa.address, Chain::Bitcoin).unwrap();
        assert_eq!(
            script,
            ScriptBuf::new_p2wsh(&wsa.script.wscript_hash())
        );
        assert!(address_script(&wsa.address, Chain::Litecoin).is_err());
        assert!(address_script("bc1qqqqq", Chain::Bitcoin).is_err());
    }

    fn vault_inputs(wsa: &WitnessScriptAccount) -> Vec<Input> {
        vec![Input {
            transaction_hash: "40e228e5a3cba99fd3fc5350a00bfeef8bafb760e26919ec74bca67776c90427"
                .into(),
            index: 0,
            satoshi: 86_560,
            script: wsa.script.clone(),
            sequence: MAX_TRANSACTION_SEQUENCE,
        }]
    }

    #[test]
    fn test_build_psbt_outputs_and_op_return() {
        let wsa = account();
        let rid = Uuid::parse_str("3e37ea1c-1455-400d-9642-f6bbcd8c744e").unwrap();
        let receiver = account().address;
        let outputs = vec![(receiver.clone(), 12_300), (wsa.address.clone(), 74_260)];
        let psbt =
            build_partially_signed_transaction(&vault_inputs(&wsa), &outputs, &rid, Chain::Bitcoin)
                .unwrap();

        let tx = &psbt.unsigned_tx;
        assert_eq!(tx.output.len(), 3);
        assert_eq!(tx.output[0].value.to_sat(), 12_300);
        assert_eq!(tx.output[1].value.to_sat(), 74_260);
        assert_eq!(tx.output[2].value.to_sat(), 0);
        assert_eq!(extract_request_id(tx), Some(rid));

        // marshal round trip preserves everything the keeper inspects
        let restored = Psbt::deserialize(&psbt.serialize()).unwrap();
        assert_eq!(psbt_hash(&restored), psbt_hash(&psbt));
        assert_eq!(restored.inputs[0].witness_script, psbt.inputs[0].witness_script);
        assert_eq!(sig_hash(&restored, 0).unwrap(), sig_hash(&psbt, 0).unwrap());
    }

    #[test]
    fn test_partial_signature_and_witness_shapes() {
        let wsa = account();
        let rid = Uuid::new_v4();
        let outputs = vec![(wsa.address.clone(), 86_560)];
        let mut psbt =
            build_partially_signed_transaction(&vault_inputs(&wsa), &outputs, &rid, Chain::Bitcoin)
                .unwrap();

        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let pk = sk.public_key(&secp);
        let digest = sig_hash(&psbt, 0).unwrap();
        let sig = secp.sign_ecdsa(&bitcoin::secp256k1::Message::from_digest(digest), &sk);
        let der = sig.serialize_der().to_vec();

        add_partial_signature(&mut psbt, 0, &pk.serialize(), &der).unwrap();
        assert_eq!(psbt.inputs[0].partial_sigs.len(), 1);

        let witness = multisig_witness(&wsa.script, &der, &der);
        assert_eq!(witness.len(), 5);
        assert_eq!(witness.nth(0).unwrap().len(), 0);
        assert_eq!(witness.nth(3).unwrap(), [1u8].as_slice());
        assert_eq!(witness.nth(4).unwrap(), wsa.script.as_bytes());

        let witness = recovery_witness(&wsa.script, &der, &der);
        assert_eq!(witness.len(), 5);
        assert_eq!(witness.nth(3).unwrap().len(), 0);
    }

    #[test]
    fn test_spend_signed_transaction_appends_fee_input() {
        let wsa = account();
        let rid = Uuid::new_v4();
        let outputs = vec![(wsa.address.clone(), 86_560)];
        let psbt =
            build_partially_signed_transaction(&vault_inputs(&wsa), &outputs, &rid, Chain::Bitcoin)
                .unwrap();
        let fee_inputs = vec![Input {
            transaction_hash: "9b76c7a3f60063c59d11d9fdf11467fdf56d496c1dfa559c78d06da756d6e204"
                .into(),
            index: 0,
            satoshi: 50_000,
            script: ScriptBuf::new(),
            sequence: MAX_TRANSACTION_SEQUENCE,
        }];
        let accountant = "c663c88aab70d1539b22f475cb8febc714dc61b9a43b472dc1ef970786cf31f9";
        let spent =
            spend_signed_transaction(&psbt.unsigned_tx, &fee_inputs, accountant, Chain::Bitcoin)
                .unwrap();
        assert_eq!(spent.input.len(), 2);
        assert_eq!(spent.input[1].witness.len(), 2);

        // deterministic given a fixed input set
        let again =
            spend_signed_transaction(&psbt.unsigned_tx, &fee_inputs, accountant, Chain::Bitcoin)
                .unwrap();
        assert_eq!(
            consensus_serialize(&spent),
            consensus_serialize(&again)
        );
    }

    #[test]
    fn test_estimate_virtual_size() {
        assert_eq!(estimate_virtual_size(1, 3), (40 + 300 + 384) / 4);
        assert_eq!(estimate_virtual_size(2, 3), (40 + 600 + 384) / 4);
    }

    #[test]
    fn test_derivation_public_matches_private() {
        let secp = Secp256k1::new();
        let secret = [9u8; 32];
        let chain_code = [3u8; 32];
        let sk = SecretKey::from_slice(&secret).unwrap();
        let public = sk.public_key(&secp).serialize();

        for path in [[0u8, 0, 0, 0], [2u8, 0, 0, 0], [3u8, 1, 2, 3]] {
            let child_public = derive_public_child(&public, &chain_code, &path).unwrap();
            let child_secret = derive_private_child(&secret, &chain_code, &path).unwrap();
            let derived = SecretKey::from_slice(&child_secret)
                .unwrap()
                .public_key(&secp)
                .serialize();
            assert_eq!(child_public, derived.to_vec());
        }

        // zero depth is the identity
        let same = derive_public_child(&public, &chain_code, &[0, 0, 0, 0]).unwrap();
        assert_eq!(same, public.to_vec());
    }
}
