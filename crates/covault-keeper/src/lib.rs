//! # Covault Keeper
//!
//! The deterministic, replicated request processor of the vault. The keeper
//! consumes ordered transport outputs, dispatches them by `(role, action)`,
//! enforces the 2-of-3 / time-lock policy against its durable store, and
//! emits signed, broadcast-ready transactions as memoed payments.
//!
//! State evolves deterministically against the transport order: replaying
//! the same outputs from any checkpoint reproduces the same store contents
//! and the same emitted payments, which is asserted through the
//! `(output_id, request_id)` action-result cache.

pub mod account;
pub mod deposit;
pub mod keys;
pub mod network;
pub mod node;
pub mod store;
pub mod transaction;

pub use node::{KeeperConf, Node};
pub use store::Store;

/// A spare key must have been backed up for this long before it can be
/// bound to an account proposal
pub const KEY_BACKUP_MATURITY_SECS: i64 = 24 * 3_600;

/// A propose-transaction request is rejected when the latest network info
/// is older than this many block intervals
pub const NETWORK_INFO_STALENESS_BLOCKS: u64 = 2;

/// Fee-rate bounds for Bitcoin-family proposals, sat/vB
pub const BITCOIN_MINIMUM_FEE_RATE: u64 = 1;
pub const BITCOIN_MAXIMUM_FEE_RATE: u64 = 1_000;
