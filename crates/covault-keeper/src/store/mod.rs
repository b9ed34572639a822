//! Durable keeper store
//!
//! One SQLite database per node. Every mutation runs inside a single SQL
//! transaction behind one writer lock, and the mutating methods are
//! idempotent so a replayed request leaves the store unchanged. Entities
//! map one table each; all tables carry `created_at` and `updated_at`.

mod accounts;
mod network;
mod requests;
mod transactions;

pub use accounts::{Safe, SafeProposal, SpareKey};
pub use network::{NetworkInfo, OperationParams};
pub use transactions::{Deposit, SignatureRequest, VaultTransaction};

use covault_core::{Error, Payment, Result};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    request_id TEXT PRIMARY KEY,
    output_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    asset_id TEXT NOT NULL,
    amount TEXT NOT NULL,
    role INTEGER NOT NULL,
    action INTEGER NOT NULL,
    curve INTEGER NOT NULL,
    holder TEXT NOT NULL,
    extra BLOB NOT NULL,
    state INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS safe_proposals (
    request_id TEXT PRIMARY KEY,
    chain INTEGER NOT NULL,
    holder TEXT NOT NULL,
    signer TEXT NOT NULL,
    observer TEXT NOT NULL,
    timelock INTEGER NOT NULL,
    address TEXT NOT NULL UNIQUE,
    extra BLOB NOT NULL,
    receivers TEXT NOT NULL,
    threshold INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS safes (
    holder TEXT PRIMARY KEY,
    chain INTEGER NOT NULL,
    signer TEXT NOT NULL,
    observer TEXT NOT NULL,
    timelock INTEGER NOT NULL,
    path BLOB NOT NULL,
    address TEXT NOT NULL UNIQUE,
    extra BLOB NOT NULL,
    receivers TEXT NOT NULL,
    threshold INTEGER NOT NULL,
    request_id TEXT NOT NULL,
    nonce INTEGER NOT NULL,
    state INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS keys (
    public TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    curve INTEGER NOT NULL,
    chain_code BLOB NOT NULL,
    flags INTEGER NOT NULL,
    holder TEXT,
    request_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS deposits (
    transaction_hash TEXT NOT NULL,
    output_index INTEGER NOT NULL,
    address TEXT NOT NULL,
    satoshi INTEGER NOT NULL,
    chain INTEGER NOT NULL,
    holder TEXT NOT NULL,
    script BLOB NOT NULL,
    sequence INTEGER NOT NULL,
    deposit_height INTEGER NOT NULL,
    state INTEGER NOT NULL,
    spent_by TEXT,
    request_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (transaction_hash, output_index)
);

CREATE TABLE IF NOT EXISTS transactions (
    transaction_hash TEXT PRIMARY KEY,
    request_id TEXT NOT NULL UNIQUE,
    holder TEXT NOT NULL,
    chain INTEGER NOT NULL,
    asset_id TEXT NOT NULL,
    data TEXT NOT NULL,
    raw_transaction BLOB NOT NULL,
    state INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS signature_requests (
    request_id TEXT PRIMARY KEY,
    transaction_hash TEXT NOT NULL,
    input_index INTEGER NOT NULL,
    signer TEXT NOT NULL,
    curve INTEGER NOT NULL,
    message BLOB NOT NULL,
    signature BLOB,
    state INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS network_infos (
    request_id TEXT PRIMARY KEY,
    chain INTEGER NOT NULL,
    fee INTEGER NOT NULL,
    height INTEGER NOT NULL,
    hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS operation_params (
    request_id TEXT PRIMARY KEY,
    chain INTEGER NOT NULL,
    price_asset TEXT NOT NULL,
    price_amount TEXT NOT NULL,
    transaction_minimum TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS properties (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS action_results (
    output_id TEXT NOT NULL,
    request_id TEXT NOT NULL,
    payments TEXT NOT NULL,
    funded INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (output_id, request_id)
);

CREATE TABLE IF NOT EXISTS balances (
    asset_id TEXT PRIMARY KEY,
    amount TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deposits_holder_state ON deposits (holder, state, created_at);
CREATE INDEX IF NOT EXISTS idx_keys_spare ON keys (curve, flags, holder);
CREATE INDEX IF NOT EXISTS idx_signature_requests_tx ON signature_requests (transaction_hash, state);
CREATE INDEX IF NOT EXISTS idx_network_infos_chain ON network_infos (chain, created_at);
"#;

/// SQLite-backed keeper store with a single-writer lock
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (and migrate) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock")
    }

    // ============ Properties ============

    pub fn write_property(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO properties (key, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(key) DO UPDATE SET value=?2, updated_at=?3",
            params![key, value, now()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn read_property(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT value FROM properties WHERE key=?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql_err)
    }

    // ============ Action-Result Cache ============

    /// Payments emitted when this `(output, request)` pair was first
    /// handled, plus whether the balance ledger has funded them yet
    pub fn read_action_result(
        &self,
        output_id: &str,
        request_id: &str,
    ) -> Result<Option<(Vec<Payment>, bool)>> {
        let conn = self.lock();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT payments, funded FROM action_results
                 WHERE output_id=?1 AND request_id=?2",
                params![output_id, request_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sql_err)?;
        match row {
            None => Ok(None),
            Some((json, funded)) => Ok(Some((serde_json::from_str(&json)?, funded != 0))),
        }
    }

    pub fn write_action_result(
        &self,
        output_id: &str,
        request_id: &str,
        payments: &[Payment],
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO action_results
             (output_id, request_id, payments, funded, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
            params![output_id, request_id, serde_json::to_string(payments)?, now()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Mark the cached payments as settled by the balance ledger
    pub fn mark_action_result_funded(&self, output_id: &str, request_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE action_results SET funded=1, updated_at=?1
             WHERE output_id=?2 AND request_id=?3",
            params![now(), output_id, request_id],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ============ Balance Ledger ============

    /// Credit the balance carried in by a consumed transport output
    pub fn credit_balance(&self, asset_id: &str, amount: Decimal) -> Result<()> {
        let conn = self.lock();
        let current = read_balance(&conn, asset_id)?;
        let next = current + amount;
        conn.execute(
            "INSERT INTO balances (asset_id, amount, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(asset_id) DO UPDATE SET amount=?2, updated_at=?3",
            params![asset_id, next.to_string(), now()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Debit the payments an action wants to emit; returns the first asset
    /// the keeper cannot fund, leaving all balances untouched in that case
    pub fn debit_payments(&self, payments: &[Payment]) -> Result<Option<String>> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        for payment in payments {
            let current = read_balance(&tx, &payment.asset_id)?;
            if current < payment.amount {
                return Ok(Some(payment.asset_id.clone()));
            }
            let next = current - payment.amount;
            tx.execute(
                "INSERT INTO balances (asset_id, amount, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(asset_id) DO UPDATE SET amount=?2, updated_at=?3",
                params![payment.asset_id, next.to_string(), now()],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)?;
        Ok(None)
    }

    pub fn read_balance(&self, asset_id: &str) -> Result<Decimal> {
        let conn = self.lock();
        read_balance(&conn, asset_id)
    }
}

fn read_balance(conn: &Connection, asset_id: &str) -> Result<Decimal> {
    let amount: Option<String> = conn
        .query_row(
            "SELECT amount FROM balances WHERE asset_id=?1",
            params![asset_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql_err)?;
    match amount {
        None => Ok(Decimal::ZERO),
        Some(s) => Decimal::from_str(&s).map_err(|e| Error::Store(e.to_string())),
    }
}

pub(crate) fn sql_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub(crate) fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|e| Error::Store(e.to_string()))
}

pub(crate) fn parse_time(s: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| Error::Store(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_properties() {
        let store = Store::open_memory().unwrap();
        assert!(store.read_property("missing").unwrap().is_none());
        store.write_property("k", "v1").unwrap();
        store.write_property("k", "v2").unwrap();
        assert_eq!(store.read_property("k").unwrap().unwrap(), "v2");
    }

    #[test]
    fn test_action_result_cache() {
        let store = Store::open_memory().unwrap();
        let payment = Payment::new(
            Uuid::new_v4(),
            "asset",
            Decimal::ONE,
            vec![1, 2],
            vec!["r".into()],
            1,
        );
        assert!(store.read_action_result("o", "r").unwrap().is_none());
        store.write_action_result("o", "r", &[payment.clone()]).unwrap();
        // the first result wins, a second write is a no-op
        store.write_action_result("o", "r", &[]).unwrap();
        let (cached, funded) = store.read_action_result("o", "r").unwrap().unwrap();
        assert_eq!(cached, vec![payment]);
        assert!(!funded);

        store.mark_action_result_funded("o", "r").unwrap();
        let (_, funded) = store.read_action_result("o", "r").unwrap().unwrap();
        assert!(funded);
    }

    #[test]
    fn test_balance_ledger() {
        let store = Store::open_memory().unwrap();
        store.credit_balance("a", Decimal::new(10, 0)).unwrap();
        store.credit_balance("a", Decimal::new(5, 0)).unwrap();
        assert_eq!(store.read_balance("a").unwrap(), Decimal::new(15, 0));

        let affordable = Payment::new(
            Uuid::new_v4(),
            "a",
            Decimal::new(15, 0),
            vec![],
            vec!["r".into()],
            1,
        );
        let unaffordable = Payment::new(
            Uuid::new_v4(),
            "b",
            Decimal::ONE,
            vec![],
            vec!["r".into()],
            1,
        );
        // shortage leaves every balance untouched
        let shortage = store
            .debit_payments(&[affordable.clone(), unaffordable])
            .unwrap();
        assert_eq!(shortage.as_deref(), Some("b"));
        assert_eq!(store.read_balance("a").unwrap(), Decimal::new(15, 0));

        assert!(store.debit_payments(&[affordable]).unwrap().is_none());
        assert_eq!(store.read_balance("a").unwrap(), Decimal::ZERO);
    }
}
