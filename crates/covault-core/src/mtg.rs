//! Trusted messenger group transport types
//!
//! The transport delivers asset-carrying outputs in a total order and lets
//! components answer with memoed payments. The keeper consumes
//! [`MtgOutput`]s and emits [`Payment`]s; everything else about the group
//! (membership, consensus, settlement) is external.

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One ordered output delivered by the messenger group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtgOutput {
    /// Unique output id; pairs with the request id in the action-result
    /// cache to recognize redelivery
    pub output_id: String,
    /// Settlement transaction hash on the messenger network
    pub transaction_hash: String,
    /// Application the output was addressed to
    pub app_id: String,
    /// Asset carried by the output; selects the action route
    pub asset_id: String,
    pub amount: Decimal,
    /// Raw memo bytes (an encrypted or plain encoded operation)
    pub memo: Vec<u8>,
    /// Global total order
    pub sequence: u64,
    pub senders: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// An outbound asset transfer with an attached memo
///
/// Payments are how the keeper responds: bond mints, signer session
/// dispatches and observer notifications are all payments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// Deterministic trace id; the transport dedups on it
    pub trace_id: Uuid,
    pub asset_id: String,
    pub amount: Decimal,
    pub memo: Vec<u8>,
    pub receivers: Vec<String>,
    pub threshold: u8,
}

impl Payment {
    pub fn new(
        trace_id: Uuid,
        asset_id: impl Into<String>,
        amount: Decimal,
        memo: Vec<u8>,
        receivers: Vec<String>,
        threshold: u8,
    ) -> Self {
        Self {
            trace_id,
            asset_id: asset_id.into(),
            amount,
            memo,
            receivers,
            threshold,
        }
    }
}

/// Sends payments into the messenger group
///
/// Implementations must be idempotent on `trace_id`: sending the same
/// payment twice settles at most once.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, payment: &Payment) -> Result<()>;
}

/// Delivers the group's outputs in total order
///
/// `poll` returns outputs with `sequence > cursor`, in sequence order.
/// Redelivery of already-polled outputs is allowed; consumers are
/// idempotent.
#[async_trait]
pub trait MtgSource: Send + Sync {
    async fn poll(&self, cursor: u64) -> Result<Vec<MtgOutput>>;
}

/// Queue-backed source for tests and local wiring
#[derive(Debug, Default)]
pub struct MemoryMtgSource {
    outputs: std::sync::Mutex<Vec<MtgOutput>>,
}

impl MemoryMtgSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, output: MtgOutput) {
        let mut outputs = self.outputs.lock().expect("source lock");
        outputs.push(output);
        outputs.sort_by_key(|o| o.sequence);
    }
}

#[async_trait]
impl MtgSource for MemoryMtgSource {
    async fn poll(&self, cursor: u64) -> Result<Vec<MtgOutput>> {
        let outputs = self.outputs.lock().expect("source lock");
        Ok(outputs
            .iter()
            .filter(|o| o.sequence > cursor)
            .cloned()
            .collect())
    }
}

/// In-memory messenger that records every payment, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryMessenger {
    sent: std::sync::Mutex<Vec<Payment>>,
}

impl MemoryMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Payment> {
        self.sent.lock().expect("messenger lock").clone()
    }
}

#[async_trait]
impl Messenger for MemoryMessenger {
    async fn send(&self, payment: &Payment) -> Result<()> {
        let mut sent = self.sent.lock().expect("messenger lock");
        if !sent.iter().any(|p| p.trace_id == payment.trace_id) {
            sent.push(payment.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_messenger_dedups_on_trace_id() {
        let messenger = MemoryMessenger::new();
        let payment = Payment::new(
            Uuid::new_v4(),
            "asset",
            Decimal::ONE,
            vec![1, 2, 3],
            vec!["receiver".into()],
            1,
        );
        messenger.send(&payment).await.unwrap();
        messenger.send(&payment).await.unwrap();
        assert_eq!(messenger.sent().len(), 1);
    }
}
