//! The binary operation envelope
//!
//! Every authorization travels as one envelope inside a transport memo. The
//! layout is fixed and positional, all integers big-endian:
//!
//! ```text
//! [0..16)  operation id (UUID)
//! [16]     type (action code)
//! [17]     curve
//! [18..]   u16-length-prefixed public, u16-length-prefixed extra
//! ```
//!
//! Action codes are persisted and sent on the wire; the numbers below are
//! stable and must never be reassigned.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// MPC session types, exchanged with the signer federation.
pub const OPERATION_TYPE_KEYGEN_INPUT: u8 = 1;
pub const OPERATION_TYPE_SIGN_INPUT: u8 = 2;
pub const OPERATION_TYPE_KEYGEN_OUTPUT: u8 = 3;
pub const OPERATION_TYPE_SIGN_OUTPUT: u8 = 4;

/// Wire-stable action codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SafeProposeAccount = 110,
    SafeApproveAccount = 111,
    SafeProposeTransaction = 112,
    SafeApproveTransaction = 113,
    SafeRevokeTransaction = 114,
    SafeCloseAccount = 115,
    ObserverHolderDeposit = 130,
    ObserverSetOperationParams = 131,
    ObserverUpdateNetworkStatus = 132,
    ObserverAddKey = 133,
    ObserverRequestSignerKeys = 134,
}

impl Action {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            110 => Ok(Action::SafeProposeAccount),
            111 => Ok(Action::SafeApproveAccount),
            112 => Ok(Action::SafeProposeTransaction),
            113 => Ok(Action::SafeApproveTransaction),
            114 => Ok(Action::SafeRevokeTransaction),
            115 => Ok(Action::SafeCloseAccount),
            130 => Ok(Action::ObserverHolderDeposit),
            131 => Ok(Action::ObserverSetOperationParams),
            132 => Ok(Action::ObserverUpdateNetworkStatus),
            133 => Ok(Action::ObserverAddKey),
            134 => Ok(Action::ObserverRequestSignerKeys),
            _ => Err(Error::UnknownAction(b)),
        }
    }

    /// Actions the holder originates (routed by the keeper asset)
    pub fn is_holder_action(&self) -> bool {
        matches!(
            self,
            Action::SafeProposeAccount | Action::SafeProposeTransaction
        )
    }
}

/// The fixed wire envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    /// Action code or MPC session type
    pub op_type: u8,
    pub curve: u8,
    /// Public key bytes, or fingerprint(+path) for signer sessions
    pub public: Vec<u8>,
    /// Action-specific payload
    pub extra: Vec<u8>,
}

impl Operation {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18 + 4 + self.public.len() + self.extra.len());
        buf.extend_from_slice(self.id.as_bytes());
        buf.push(self.op_type);
        buf.push(self.curve);
        write_bytes(&mut buf, &self.public);
        write_bytes(&mut buf, &self.extra);
        buf
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < 18 {
            return Err(Error::MalformedEnvelope(format!("short {}", b.len())));
        }
        let id = Uuid::from_slice(&b[..16])
            .map_err(|e| Error::MalformedEnvelope(e.to_string()))?;
        let op_type = b[16];
        let curve = b[17];
        let mut offset = 18;
        let public = read_bytes(b, &mut offset)?;
        let extra = read_bytes(b, &mut offset)?;
        if offset != b.len() {
            return Err(Error::MalformedEnvelope(format!(
                "trailing {} bytes",
                b.len() - offset
            )));
        }
        Ok(Operation {
            id,
            op_type,
            curve,
            public,
            extra,
        })
    }

    /// Holder public key as hex, the form it is stored and compared in
    pub fn public_hex(&self) -> String {
        hex::encode(&self.public)
    }
}

fn write_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u16).to_be_bytes());
    buf.extend_from_slice(b);
}

fn read_bytes(b: &[u8], offset: &mut usize) -> Result<Vec<u8>> {
    if b.len() < *offset + 2 {
        return Err(Error::MalformedEnvelope("truncated length".into()));
    }
    let len = u16::from_be_bytes([b[*offset], b[*offset + 1]]) as usize;
    *offset += 2;
    if b.len() < *offset + len {
        return Err(Error::MalformedEnvelope(format!(
            "length {len} exceeds buffer"
        )));
    }
    let out = b[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Operation {
        Operation {
            id: Uuid::parse_str("2e78d04a-e61a-442d-a014-dec19bd61cfe").unwrap(),
            op_type: Action::SafeProposeAccount as u8,
            curve: 1,
            public: hex::decode(
                "039c2f5ebdd4eae6d69e7a98b737beeb78e0a8d42c7b957a0fbe0c41658d16ab40",
            )
            .unwrap(),
            extra: vec![0, 1, 1, 1],
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let op = sample();
        let encoded = op.encode();
        assert_eq!(&encoded[..16], op.id.as_bytes());
        assert_eq!(encoded[16], 110);
        assert_eq!(encoded[17], 1);
        let decoded = Operation::decode(&encoded).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut encoded = sample().encode();
        encoded.push(0);
        assert!(matches!(
            Operation::decode(&encoded),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_decode_rejects_overrun_length() {
        let mut encoded = sample().encode();
        // corrupt the public length prefix to overrun the buffer
        encoded[18] = 0xff;
        encoded[19] = 0xff;
        assert!(matches!(
            Operation::decode(&encoded),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(Operation::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_action_codes_are_stable() {
        assert_eq!(Action::SafeProposeAccount as u8, 110);
        assert_eq!(Action::SafeApproveAccount as u8, 111);
        assert_eq!(Action::SafeProposeTransaction as u8, 112);
        assert_eq!(Action::SafeApproveTransaction as u8, 113);
        assert_eq!(Action::SafeRevokeTransaction as u8, 114);
        assert_eq!(Action::SafeCloseAccount as u8, 115);
        assert_eq!(Action::ObserverHolderDeposit as u8, 130);
        assert_eq!(Action::ObserverSetOperationParams as u8, 131);
        assert_eq!(Action::ObserverUpdateNetworkStatus as u8, 132);
        assert_eq!(Action::ObserverAddKey as u8, 133);
        assert_eq!(Action::ObserverRequestSignerKeys as u8, 134);
    }

    #[test]
    fn test_empty_public_and_extra() {
        let op = Operation {
            id: Uuid::nil(),
            op_type: OPERATION_TYPE_KEYGEN_INPUT,
            curve: 1,
            public: vec![],
            extra: vec![],
        };
        let decoded = Operation::decode(&op.encode()).unwrap();
        assert!(decoded.public.is_empty());
        assert!(decoded.extra.is_empty());
    }
}
