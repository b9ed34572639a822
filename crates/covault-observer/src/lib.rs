//! # Covault Observer
//!
//! The external-chain watcher and driver of the vault. Per chain, the
//! observer runs independent long-lived loops: it pushes network info to
//! the keeper, scans blocks for deposits to known accounts, promotes
//! deposits once they reach confirmation depth, combines holder and signer
//! signatures delivered by the keeper, pays the network fee from the
//! accountant wallet, and broadcasts the fully signed transaction.
//!
//! The observer holds the only mutable secrets of the system: the
//! accountant private keys. Everything else it knows arrives through the
//! keeper's memoed payments or the chain RPC.

pub mod accountant;
pub mod api;
pub mod bond;
pub mod node;
pub mod rpc;
pub mod store;

pub use node::{Node, ObserverConf};
pub use store::ObserverStore;

/// Idle pause between loop iterations
pub const LOOP_IDLE_SECS: u64 = 3;

/// The spare signer-key pool is topped up below this count
pub const SPARE_KEYS_MINIMUM: usize = 16;

/// Accountant fee inputs are matched within this band around the estimate
pub const FEE_RANGE_LOW: f64 = 0.9;
pub const FEE_RANGE_HIGH: f64 = 1.1;
