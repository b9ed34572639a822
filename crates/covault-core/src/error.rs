//! Error types shared across the vault components
//!
//! The taxonomy mirrors how failures are handled: malformed or unauthorized
//! messages fail the carrying request, policy violations fail the request
//! with an explicit reason, and transient I/O errors bubble up to the calling
//! loop which sleeps and retries. Invariant violations (corrupted state,
//! adversarial inconsistencies that could authorize an unintended spend) are
//! not represented here at all; those panic.

use thiserror::Error;

/// Result type alias for vault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the vault core, keeper and observer
#[derive(Debug, Error)]
pub enum Error {
    // ============ Envelope Errors ============
    /// Operation envelope could not be decoded
    #[error("malformed operation envelope: {0}")]
    MalformedEnvelope(String),

    /// Memo decryption or authentication failed
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Curve is not valid for the selected chain
    #[error("invalid curve {curve} for chain {chain}")]
    InvalidCurve { curve: u8, chain: u8 },

    /// Unknown or unsupported chain identifier
    #[error("unsupported chain: {0}")]
    UnsupportedChain(u8),

    /// Unknown action code
    #[error("unknown action code: {0}")]
    UnknownAction(u8),

    // ============ Policy Errors ============
    /// Signature does not verify against the expected key
    #[error("signature verification failed: {0}")]
    SignatureVerification(String),

    /// Fee rate outside the accepted bounds
    #[error("fee rate {0} outside bounds [{1}, {2}]")]
    FeeOutOfRange(u64, u64, u64),

    /// The script time-lock has not expired yet
    #[error("time-lock not expired: height {height} deposit {deposit} lock {lock}")]
    TimelockNotExpired {
        height: u64,
        deposit: u64,
        lock: u64,
    },

    /// Account balance cannot cover the requested outputs
    #[error("insufficient balance: have {have} need {need}")]
    InsufficientBalance { have: u64, need: u64 },

    /// Time-lock duration outside the accepted range
    #[error("time-lock out of range: {0}s")]
    TimelockOutOfRange(u64),

    /// Address failed validation for the target chain
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    // ============ Cryptographic Errors ============
    /// Key material could not be parsed
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Generic cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(String),

    // ============ Chain Errors ============
    /// PSBT or transaction encoding failure
    #[error("transaction encoding: {0}")]
    TransactionEncoding(String),

    /// Broadcast returned a transaction id other than the computed one
    #[error("malformed broadcast: sent {sent} got {got}")]
    MalformedBroadcast { sent: String, got: String },

    /// Chain RPC failure (transient)
    #[error("rpc error: {0}")]
    Rpc(String),

    // ============ Store Errors ============
    /// Durable store failure
    #[error("store error: {0}")]
    Store(String),

    /// Referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    // ============ Transport Errors ============
    /// Messenger/transport failure (transient)
    #[error("messenger error: {0}")]
    Messenger(String),

    /// MPC session failure
    #[error("signer session error: {0}")]
    SignerSession(String),

    // ============ Serialization Errors ============
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(e: uuid::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::FeeOutOfRange(2000, 1, 1000);
        assert!(err.to_string().contains("2000"));

        let err = Error::TimelockNotExpired {
            height: 100,
            deposit: 98,
            lock: 6,
        };
        assert!(err.to_string().contains("not expired"));
    }
}
