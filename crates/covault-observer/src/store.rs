//! Durable observer store
//!
//! Owns what the keeper does not: accountant outputs and keys, transaction
//! approvals in flight, the scan checkpoints, and the operator quarantine
//! table. Same discipline as the keeper store: one writer lock, one SQL
//! transaction per mutation, idempotent writes.

use chrono::{DateTime, Utc};
use covault_core::{Chain, Error, RequestState, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accountant_outputs (
    transaction_hash TEXT NOT NULL,
    output_index INTEGER NOT NULL,
    address TEXT NOT NULL,
    satoshi INTEGER NOT NULL,
    chain INTEGER NOT NULL,
    state INTEGER NOT NULL,
    spent_by TEXT,
    raw_transaction BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (transaction_hash, output_index)
);

CREATE TABLE IF NOT EXISTS accountant_keys (
    address TEXT PRIMARY KEY,
    private_key TEXT NOT NULL,
    chain INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transaction_approvals (
    transaction_hash TEXT PRIMARY KEY,
    chain INTEGER NOT NULL,
    holder TEXT NOT NULL,
    raw_transaction BLOB NOT NULL,
    spent_hash TEXT,
    spent_raw BLOB,
    state INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS seen_deposits (
    transaction_hash TEXT NOT NULL,
    output_index INTEGER NOT NULL,
    chain INTEGER NOT NULL,
    address TEXT NOT NULL,
    satoshi INTEGER NOT NULL,
    height INTEGER NOT NULL,
    state INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (transaction_hash, output_index)
);

CREATE TABLE IF NOT EXISTS quarantined_transactions (
    transaction_hash TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS properties (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_accountant_outputs_range
    ON accountant_outputs (chain, state, satoshi);
CREATE INDEX IF NOT EXISTS idx_approvals_state ON transaction_approvals (chain, state);
CREATE INDEX IF NOT EXISTS idx_seen_deposits_state ON seen_deposits (chain, state, height);
"#;

/// One accountant wallet output; `Done` once a spend consumed it
#[derive(Debug, Clone)]
pub struct AccountantOutput {
    pub transaction_hash: String,
    pub output_index: u32,
    pub address: String,
    pub satoshi: u64,
    pub chain: Chain,
    pub state: RequestState,
    pub spent_by: Option<String>,
    /// Raw splitter transaction to broadcast before use, if any
    pub raw_transaction: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

/// A keeper-approved transaction making its way to the chain
#[derive(Debug, Clone)]
pub struct TransactionApproval {
    pub transaction_hash: String,
    pub chain: Chain,
    pub holder: String,
    pub raw_transaction: Vec<u8>,
    pub spent_hash: Option<String>,
    pub spent_raw: Option<Vec<u8>>,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
}

/// A deposit noticed by the block scanner, pending confirmation depth
#[derive(Debug, Clone)]
pub struct SeenDeposit {
    pub transaction_hash: String,
    pub output_index: u32,
    pub chain: Chain,
    pub address: String,
    pub satoshi: u64,
    pub height: u64,
    pub state: RequestState,
}

/// SQLite-backed observer store
pub struct ObserverStore {
    conn: Mutex<Connection>,
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Store(e.to_string()))
}

impl ObserverStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock")
    }

    // ============ Properties / Checkpoints ============

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

    pub fn read_scan_checkpoint(&self, chain: Chain, genesis: u64) -> Result<u64> {
        let key = format!("scan-checkpoint-{}", chain as u8);
        match self.read_property(&key)? {
            Some(value) => value
                .parse()
                .map_err(|e| Error::Store(format!("checkpoint {value}: {e}"))),
            None => Ok(genesis),
        }
    }

    pub fn write_scan_checkpoint(&self, chain: Chain, height: u64) -> Result<()> {
        let key = format!("scan-checkpoint-{}", chain as u8);
        self.write_property(&key, &height.to_string())
    }

    // ============ Quarantine ============

    /// Operator-managed: transactions listed here are skipped by the
    /// combine and broadcast paths
    pub fn quarantine_transaction(&self, hash: &str, reason: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO quarantined_transactions
             (transaction_hash, reason, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![hash, reason, now()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn is_quarantined(&self, hash: &str) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM quarantined_transactions WHERE transaction_hash=?1",
                params![hash],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(count > 0)
    }

    pub fn release_quarantine(&self, hash: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM quarantined_transactions WHERE transaction_hash=?1",
            params![hash],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ============ Accountant ============

    pub fn write_accountant_key(&self, chain: Chain, address: &str, private_key: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO accountant_keys
             (address, private_key, chain, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![address, private_key, chain as u8, now()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn read_accountant_key(&self, address: &str) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT private_key FROM accountant_keys WHERE address=?1",
            params![address],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql_err)
    }

    pub fn write_accountant_output_if_not_exists(&self, output: &AccountantOutput) -> Result<bool> {
        let conn = self.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO accountant_outputs
                 (transaction_hash, output_index, address, satoshi, chain, state,
                  spent_by, raw_transaction, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    output.transaction_hash,
                    output.output_index,
                    output.address,
                    output.satoshi as i64,
                    output.chain as u8,
                    output.state as u8,
                    output.spent_by,
                    output.raw_transaction,
                    output.created_at.to_rfc3339(),
                ],
            )
            .map_err(sql_err)?;
        Ok(inserted > 0)
    }

    /// Atomically assign one spendable output in `[low, high]` to the
    /// transaction; returns the previous assignment when one exists
    pub fn assign_accountant_output_in_range(
        &self,
        chain: Chain,
        low: u64,
        high: u64,
        spender_hash: &str,
    ) -> Result<Option<AccountantOutput>> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        let raw = tx
            .query_row(
                &format!(
                    "SELECT {ACCOUNTANT_COLS} FROM accountant_outputs
                     WHERE (chain=?1 AND satoshi>=?2 AND satoshi<=?3 AND state=?4)
                        OR spent_by=?5
                     ORDER BY spent_by DESC LIMIT 1"
                ),
                params![
                    chain as u8,
                    low as i64,
                    high as i64,
                    RequestState::Initial as u8,
                    spender_hash
                ],
                accountant_output_row,
            )
            .optional()
            .map_err(sql_err)?;
        let Some(raw) = raw else { return Ok(None) };
        let output = raw.build()?;
        if output.spent_by.as_deref() == Some(spender_hash) {
            return Ok(Some(output));
        }
        let updated = tx
            .execute(
                "UPDATE accountant_outputs SET state=?1, spent_by=?2, updated_at=?3
                 WHERE transaction_hash=?4 AND output_index=?5 AND state=?6
                   AND spent_by IS NULL",
                params![
                    RequestState::Done as u8,
                    spender_hash,
                    now(),
                    output.transaction_hash,
                    output.output_index,
                    RequestState::Initial as u8
                ],
            )
            .map_err(sql_err)?;
        if updated != 1 {
            return Ok(None);
        }
        tx.commit().map_err(sql_err)?;
        Ok(Some(AccountantOutput {
            state: RequestState::Done,
            spent_by: Some(spender_hash.to_string()),
            ..output
        }))
    }

    pub fn list_spendable_accountant_outputs(
        &self,
        chain: Chain,
        limit: usize,
    ) -> Result<Vec<AccountantOutput>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ACCOUNTANT_COLS} FROM accountant_outputs
                 WHERE chain=?1 AND state=?2 ORDER BY created_at ASC LIMIT ?3"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                params![chain as u8, RequestState::Initial as u8, limit as i64],
                accountant_output_row,
            )
            .map_err(sql_err)?;
        let mut outputs = Vec::new();
        for row in rows {
            outputs.push(row.map_err(sql_err)?.build()?);
        }
        Ok(outputs)
    }

    /// Record a fee-splitter transaction: its inputs flip to Done and its
    /// outputs enter the wallet, the first one pre-assigned to the spender
    pub fn write_fee_splitter(
        &self,
        chain: Chain,
        consumed: &[(String, u32)],
        produced: &[AccountantOutput],
        spender_hash: &str,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        for (hash, index) in consumed {
            let updated = tx
                .execute(
                    "UPDATE accountant_outputs SET state=?1, spent_by=?2, updated_at=?3
                     WHERE transaction_hash=?4 AND output_index=?5 AND state=?6
                       AND spent_by IS NULL",
                    params![
                        RequestState::Done as u8,
                        produced
                            .first()
                            .map(|o| o.transaction_hash.clone())
                            .unwrap_or_default(),
                        now(),
                        hash,
                        index,
                        RequestState::Initial as u8
                    ],
                )
                .map_err(sql_err)?;
            assert_eq!(updated, 1, "accountant output {hash}:{index} already spent");
        }
        for (i, output) in produced.iter().enumerate() {
            let (state, spent_by) = if i == 0 {
                (RequestState::Done as u8, Some(spender_hash.to_string()))
            } else {
                (RequestState::Initial as u8, None)
            };
            tx.execute(
                "INSERT INTO accountant_outputs
                 (transaction_hash, output_index, address, satoshi, chain, state,
                  spent_by, raw_transaction, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    output.transaction_hash,
                    output.output_index,
                    output.address,
                    output.satoshi as i64,
                    chain as u8,
                    state,
                    spent_by,
                    output.raw_transaction,
                    output.created_at.to_rfc3339(),
                ],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    // ============ Transaction Approvals ============

    pub fn write_transaction_approval(&self, approval: &TransactionApproval) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO transaction_approvals
             (transaction_hash, chain, holder, raw_transaction, spent_hash, spent_raw,
              state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5, ?6, ?6)
             ON CONFLICT(transaction_hash) DO NOTHING",
            params![
                approval.transaction_hash,
                approval.chain as u8,
                approval.holder,
                approval.raw_transaction,
                approval.state as u8,
                approval.created_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn read_transaction_approval(&self, hash: &str) -> Result<Option<TransactionApproval>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {APPROVAL_COLS} FROM transaction_approvals
                     WHERE transaction_hash=?1"
                ),
                params![hash],
                approval_row,
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(RawApproval::build).transpose()
    }

    /// Record the fully combined raw; the approval becomes broadcastable
    pub fn finish_transaction_signatures(&self, hash: &str, raw: &[u8]) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE transaction_approvals SET raw_transaction=?1, state=?2, updated_at=?3
             WHERE transaction_hash=?4 AND state=?5",
            params![
                raw,
                RequestState::Done as u8,
                now(),
                hash,
                RequestState::Pending as u8
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn list_fully_signed_approvals(&self, chain: Chain) -> Result<Vec<TransactionApproval>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {APPROVAL_COLS} FROM transaction_approvals
                 WHERE chain=?1 AND state=?2 AND spent_hash IS NULL
                 ORDER BY created_at ASC"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![chain as u8, RequestState::Done as u8], approval_row)
            .map_err(sql_err)?;
        let mut approvals = Vec::new();
        for row in rows {
            approvals.push(row.map_err(sql_err)?.build()?);
        }
        Ok(approvals)
    }

    pub fn confirm_spent_approval(&self, hash: &str, spent_hash: &str, spent_raw: &[u8]) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE transaction_approvals SET spent_hash=?1, spent_raw=?2, updated_at=?3
             WHERE transaction_hash=?4 AND spent_hash IS NULL",
            params![spent_hash, spent_raw, now(), hash],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ============ Scanner ============

    /// Record a scanned deposit candidate; a known `(hash, vout)` is a
    /// no-op returning false
    pub fn write_seen_deposit_if_not_exists(&self, deposit: &SeenDeposit) -> Result<bool> {
        let conn = self.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO seen_deposits
                 (transaction_hash, output_index, chain, address, satoshi, height,
                  state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    deposit.transaction_hash,
                    deposit.output_index,
                    deposit.chain as u8,
                    deposit.address,
                    deposit.satoshi as i64,
                    deposit.height as i64,
                    RequestState::Initial as u8,
                    now(),
                ],
            )
            .map_err(sql_err)?;
        Ok(inserted > 0)
    }

    /// Candidates whose block is at or below `confirmed_height`
    pub fn list_confirmable_deposits(
        &self,
        chain: Chain,
        confirmed_height: u64,
    ) -> Result<Vec<SeenDeposit>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT transaction_hash, output_index, chain, address, satoshi, height, state
                 FROM seen_deposits
                 WHERE chain=?1 AND state=?2 AND height<=?3
                 ORDER BY height ASC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                params![chain as u8, RequestState::Initial as u8, confirmed_height as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? as u32,
                        row.get::<_, i64>(2)? as u8,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)? as u64,
                        row.get::<_, i64>(5)? as u64,
                        row.get::<_, i64>(6)? as u8,
                    ))
                },
            )
            .map_err(sql_err)?;
        let mut deposits = Vec::new();
        for row in rows {
            let raw = row.map_err(sql_err)?;
            deposits.push(SeenDeposit {
                transaction_hash: raw.0,
                output_index: raw.1,
                chain: Chain::from_byte(raw.2)?,
                address: raw.3,
                satoshi: raw.4,
                height: raw.5,
                state: RequestState::from_byte(raw.6)?,
            });
        }
        Ok(deposits)
    }

    pub fn confirm_seen_deposit(&self, hash: &str, index: u32) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE seen_deposits SET state=?1, updated_at=?2
             WHERE transaction_hash=?3 AND output_index=?4 AND state=?5",
            params![
                RequestState::Done as u8,
                now(),
                hash,
                index,
                RequestState::Initial as u8
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

const ACCOUNTANT_COLS: &str = "transaction_hash, output_index, address, satoshi, chain, state, \
                               spent_by, raw_transaction, created_at";

struct RawAccountantOutput {
    transaction_hash: String,
    output_index: u32,
    address: String,
    satoshi: u64,
    chain: u8,
    state: u8,
    spent_by: Option<String>,
    raw_transaction: Option<Vec<u8>>,
    created_at: String,
}

impl RawAccountantOutput {
    fn build(self) -> Result<AccountantOutput> {
        Ok(AccountantOutput {
            transaction_hash: self.transaction_hash,
            output_index: self.output_index,
            address: self.address,
            satoshi: self.satoshi,
            chain: Chain::from_byte(self.chain)?,
            state: RequestState::from_byte(self.state)?,
            spent_by: self.spent_by,
            raw_transaction: self.raw_transaction,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

fn accountant_output_row(row: &Row<'_>) -> rusqlite::Result<RawAccountantOutput> {
    Ok(RawAccountantOutput {
        transaction_hash: row.get(0)?,
        output_index: row.get::<_, i64>(1)? as u32,
        address: row.get(2)?,
        satoshi: row.get::<_, i64>(3)? as u64,
        chain: row.get::<_, i64>(4)? as u8,
        state: row.get::<_, i64>(5)? as u8,
        spent_by: row.get(6)?,
        raw_transaction: row.get(7)?,
        created_at: row.get(8)?,
    })
}

const APPROVAL_COLS: &str = "transaction_hash, chain, holder, raw_transaction, spent_hash, \
                             spent_raw, state, created_at";

struct RawApproval {
    transaction_hash: String,
    chain: u8,
    holder: String,
    raw_transaction: Vec<u8>,
    spent_hash: Option<String>,
    spent_raw: Option<Vec<u8>>,
    state: u8,
    created_at: String,
}

impl RawApproval {
    fn build(self) -> Result<TransactionApproval> {
        Ok(TransactionApproval {
            transaction_hash: self.transaction_hash,
            chain: Chain::from_byte(self.chain)?,
            holder: self.holder,
            raw_transaction: self.raw_transaction,
            spent_hash: self.spent_hash,
            spent_raw: self.spent_raw,
            state: RequestState::from_byte(self.state)?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

fn approval_row(row: &Row<'_>) -> rusqlite::Result<RawApproval> {
    Ok(RawApproval {
        transaction_hash: row.get(0)?,
        chain: row.get::<_, i64>(1)? as u8,
        holder: row.get(2)?,
        raw_transaction: row.get(3)?,
        spent_hash: row.get(4)?,
        spent_raw: row.get(5)?,
        state: row.get::<_, i64>(6)? as u8,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(hash: &str, satoshi: u64) -> AccountantOutput {
        AccountantOutput {
            transaction_hash: hash.into(),
            output_index: 0,
            address: "bc1qfee".into(),
            satoshi,
            chain: Chain::Bitcoin,
            state: RequestState::Initial,
            spent_by: None,
            raw_transaction: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_assign_accountant_output_in_range() {
        let store = ObserverStore::open_memory().unwrap();
        store
            .write_accountant_output_if_not_exists(&output("small", 10_000))
            .unwrap();
        store
            .write_accountant_output_if_not_exists(&output("match", 50_000))
            .unwrap();

        // nothing in range
        assert!(store
            .assign_accountant_output_in_range(Chain::Bitcoin, 60_000, 70_000, "spender")
            .unwrap()
            .is_none());

        let assigned = store
            .assign_accountant_output_in_range(Chain::Bitcoin, 45_000, 55_000, "spender")
            .unwrap()
            .unwrap();
        assert_eq!(assigned.transaction_hash, "match");
        assert_eq!(assigned.spent_by.as_deref(), Some("spender"));

        // re-asking for the same spender returns the same assignment
        let again = store
            .assign_accountant_output_in_range(Chain::Bitcoin, 45_000, 55_000, "spender")
            .unwrap()
            .unwrap();
        assert_eq!(again.transaction_hash, "match");

        // and the output is no longer available to others
        assert!(store
            .assign_accountant_output_in_range(Chain::Bitcoin, 45_000, 55_000, "other")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_fee_splitter_bookkeeping() {
        let store = ObserverStore::open_memory().unwrap();
        store
            .write_accountant_output_if_not_exists(&output("big", 500_000))
            .unwrap();

        let produced = vec![
            AccountantOutput {
                transaction_hash: "split".into(),
                output_index: 0,
                satoshi: 40_000,
                ..output("split", 40_000)
            },
            AccountantOutput {
                transaction_hash: "split".into(),
                output_index: 1,
                satoshi: 455_000,
                ..output("split", 455_000)
            },
        ];
        store
            .write_fee_splitter(
                Chain::Bitcoin,
                &[("big".to_string(), 0)],
                &produced,
                "spender",
            )
            .unwrap();

        // the change output is spendable, the fee output is assigned
        let spendable = store
            .list_spendable_accountant_outputs(Chain::Bitcoin, 10)
            .unwrap();
        assert_eq!(spendable.len(), 1);
        assert_eq!(spendable[0].output_index, 1);

        let assigned = store
            .assign_accountant_output_in_range(Chain::Bitcoin, 36_000, 44_000, "spender")
            .unwrap()
            .unwrap();
        assert_eq!(assigned.transaction_hash, "split");
        assert_eq!(assigned.output_index, 0);
    }

    #[test]
    fn test_quarantine() {
        let store = ObserverStore::open_memory().unwrap();
        assert!(!store.is_quarantined("aa").unwrap());
        store.quarantine_transaction("aa", "operator hold").unwrap();
        assert!(store.is_quarantined("aa").unwrap());
        store.release_quarantine("aa").unwrap();
        assert!(!store.is_quarantined("aa").unwrap());
    }

    #[test]
    fn test_seen_deposit_dedup_and_confirmation() {
        let store = ObserverStore::open_memory().unwrap();
        let deposit = SeenDeposit {
            transaction_hash: "aa".into(),
            output_index: 0,
            chain: Chain::Bitcoin,
            address: "bc1qaddr".into(),
            satoshi: 1_000,
            height: 100,
            state: RequestState::Initial,
        };
        assert!(store.write_seen_deposit_if_not_exists(&deposit).unwrap());
        assert!(!store.write_seen_deposit_if_not_exists(&deposit).unwrap());

        // not confirmable below its height
        assert!(store
            .list_confirmable_deposits(Chain::Bitcoin, 99)
            .unwrap()
            .is_empty());
        let confirmable = store.list_confirmable_deposits(Chain::Bitcoin, 100).unwrap();
        assert_eq!(confirmable.len(), 1);

        store.confirm_seen_deposit("aa", 0).unwrap();
        assert!(store
            .list_confirmable_deposits(Chain::Bitcoin, 100)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_transaction_approval_lifecycle() {
        let store = ObserverStore::open_memory().unwrap();
        let approval = TransactionApproval {
            transaction_hash: "tx".into(),
            chain: Chain::Bitcoin,
            holder: "holder".into(),
            raw_transaction: vec![1],
            spent_hash: None,
            spent_raw: None,
            state: RequestState::Pending,
            created_at: Utc::now(),
        };
        store.write_transaction_approval(&approval).unwrap();
        // duplicate notification is a no-op
        store.write_transaction_approval(&approval).unwrap();

        store.finish_transaction_signatures("tx", &[2]).unwrap();
        let signed = store.list_fully_signed_approvals(Chain::Bitcoin).unwrap();
        assert_eq!(signed.len(), 1);
        assert_eq!(signed[0].raw_transaction, vec![2]);

        store.confirm_spent_approval("tx", "spent", &[3]).unwrap();
        assert!(store
            .list_fully_signed_approvals(Chain::Bitcoin)
            .unwrap()
            .is_empty());
        let read = store.read_transaction_approval("tx").unwrap().unwrap();
        assert_eq!(read.spent_hash.as_deref(), Some("spent"));
    }
}
