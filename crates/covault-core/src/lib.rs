//! # Covault Core
//!
//! Core library for the covault non-custodial 2-of-3 vault.
//!
//! Every vault account is governed by three signing authorities: a **Holder**
//! (user key), a **Signer** (threshold MPC identity held by a federation of
//! nodes) and an **Observer** (rescue identity gated by a script time-lock).
//! On Bitcoin-family chains the account is a P2WSH witness script encoding
//! the multisig and the time-lock; on Ethereum-family chains it is a
//! Gnosis-Safe-style 2/3 contract with a guard enforcing the delay.
//!
//! This crate provides:
//! - **Operation codec**: the fixed binary envelope every authorization
//!   travels in, plus AES-256-GCM memo encryption under ECDH role-pair keys
//! - **Transport types**: ordered group outputs and outbound payments for the
//!   trusted messenger layer
//! - **Chain adapters**: script building, PSBT assembly, signature hashing
//!   and address handling for Bitcoin/Litecoin and Ethereum/Polygon
//! - **Signer pool interface**: keygen/sign sessions against the MPC
//!   federation, consumed as a deterministic black-box oracle
//!
//! ## Security Model
//!
//! The 2-of-3 arrangement ensures:
//! - The signer federation cannot move funds alone (holder approval required)
//! - The holder keeps unilateral veto (revocation) over any pending spend
//! - Recovery after key loss is possible, but only with the observer and only
//!   after the script time-lock expires

pub mod chain;
pub mod crypto;
pub mod error;
pub mod mpc;
pub mod mtg;
pub mod operation;
pub mod types;

pub use error::{Error, Result};
pub use mtg::{Messenger, MtgOutput, Payment};
pub use operation::{Action, Operation};
pub use types::{
    fingerprint, unique_id, Chain, Curve, Request, RequestState, Role, SAFE_ASSET_BITCOIN,
    SAFE_ASSET_ETHEREUM, SAFE_ASSET_LITECOIN, SAFE_ASSET_POLYGON,
};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of signing authorities per vault account
pub const N_AUTHORITIES: usize = 3;

/// Signatures required to move funds
pub const THRESHOLD: usize = 2;

/// Maximum keygen sessions a single observer request may start
pub const SIGNER_KEYGEN_MAXIMUM: u8 = 128;

/// Encrypted signer memos beyond this size cannot fit a transfer memo
pub const OPERATION_MEMO_LIMIT: usize = 160;
