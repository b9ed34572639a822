//! Deposits, spend transactions and per-input signature requests

use super::accounts::finish_request_tx;
use super::{now, parse_time, sql_err, Store};
use chrono::{DateTime, Utc};
use covault_core::{Chain, Curve, RequestState, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

/// A confirmed deposit to a vault account
///
/// States: Initial (spendable), Pending (assigned to exactly one pending
/// transaction, `spent_by` set), Done (spent). Pending deposits return to
/// Initial when their transaction is revoked; Done is terminal.
#[derive(Debug, Clone)]
pub struct Deposit {
    pub transaction_hash: String,
    pub output_index: u32,
    pub address: String,
    pub satoshi: u64,
    pub chain: Chain,
    pub holder: String,
    /// Witness script of the vault account
    pub script: Vec<u8>,
    /// CSV blocks of the recovery branch
    pub sequence: u32,
    /// Keeper's latest network height when the deposit was recorded,
    /// the reference point of the recovery time-lock
    pub deposit_height: u64,
    pub state: RequestState,
    pub spent_by: Option<String>,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}

/// A proposed spend or recovery, keyed by its chain transaction hash
#[derive(Debug, Clone)]
pub struct VaultTransaction {
    pub transaction_hash: String,
    pub request_id: Uuid,
    pub holder: String,
    pub chain: Chain,
    pub asset_id: String,
    /// JSON summary of the requested outputs
    pub data: String,
    /// PSBT (Bitcoin family) or marshaled safe transaction (Ethereum family)
    pub raw_transaction: Vec<u8>,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
}

/// One input awaiting a signer federation signature
#[derive(Debug, Clone)]
pub struct SignatureRequest {
    pub request_id: Uuid,
    pub transaction_hash: String,
    pub input_index: u32,
    pub signer: String,
    pub curve: Curve,
    /// The sighash digest to sign
    pub message: Vec<u8>,
    pub signature: Option<Vec<u8>>,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
}

fn deposit_from_row(row: &Row<'_>) -> rusqlite::Result<RawDeposit> {
    Ok(RawDeposit {
        transaction_hash: row.get(0)?,
        output_index: row.get::<_, i64>(1)? as u32,
        address: row.get(2)?,
        satoshi: row.get::<_, i64>(3)? as u64,
        chain: row.get::<_, i64>(4)? as u8,
        holder: row.get(5)?,
        script: row.get(6)?,
        sequence: row.get::<_, i64>(7)? as u32,
        deposit_height: row.get::<_, i64>(8)? as u64,
        state: row.get::<_, i64>(9)? as u8,
        spent_by: row.get(10)?,
        request_id: row.get(11)?,
        created_at: row.get(12)?,
    })
}

struct RawDeposit {
    transaction_hash: String,
    output_index: u32,
    address: String,
    satoshi: u64,
    chain: u8,
    holder: String,
    script: Vec<u8>,
    sequence: u32,
    deposit_height: u64,
    state: u8,
    spent_by: Option<String>,
    request_id: String,
    created_at: String,
}

impl RawDeposit {
    fn into_deposit(self) -> Result<Deposit> {
        Ok(Deposit {
            transaction_hash: self.transaction_hash,
            output_index: self.output_index,
            address: self.address,
            satoshi: self.satoshi,
            chain: Chain::from_byte(self.chain)?,
            holder: self.holder,
            script: self.script,
            sequence: self.sequence,
            deposit_height: self.deposit_height,
            state: RequestState::from_byte(self.state)?,
            spent_by: self.spent_by,
            request_id: self.request_id,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

const DEPOSIT_COLS: &str = "transaction_hash, output_index, address, satoshi, chain, holder, \
                            script, sequence, deposit_height, state, spent_by, request_id, \
                            created_at";

impl Store {
    // ============ Deposits ============

    /// Record a confirmed deposit and finish the carrying request; a known
    /// `(hash, index)` pair is a no-op returning false so redelivered
    /// notifications never double-mint
    pub fn write_deposit_with_request(&self, deposit: &Deposit, request_id: &Uuid) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO deposits
                 (transaction_hash, output_index, address, satoshi, chain, holder, script,
                  sequence, deposit_height, state, spent_by, request_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, ?12, ?12)",
                params![
                    deposit.transaction_hash,
                    deposit.output_index,
                    deposit.address,
                    deposit.satoshi as i64,
                    deposit.chain as u8,
                    deposit.holder,
                    deposit.script,
                    deposit.sequence,
                    deposit.deposit_height as i64,
                    RequestState::Initial as u8,
                    deposit.request_id,
                    deposit.created_at.to_rfc3339(),
                ],
            )
            .map_err(sql_err)?;
        finish_request_tx(&tx, request_id, RequestState::Done)?;
        tx.commit().map_err(sql_err)?;
        Ok(inserted > 0)
    }

    pub fn read_deposit(&self, hash: &str, index: u32) -> Result<Option<Deposit>> {
        let conn = self.lock();
        read_deposit(&conn, hash, index)
    }

    /// Spendable deposits of a holder, oldest first
    pub fn list_spendable_deposits(&self, holder: &str, limit: usize) -> Result<Vec<Deposit>> {
        self.list_deposits_in_state(holder, RequestState::Initial, limit)
    }

    /// Deposits assigned to a pending transaction
    pub fn list_pending_deposits(&self, holder: &str) -> Result<Vec<Deposit>> {
        self.list_deposits_in_state(holder, RequestState::Pending, 256)
    }

    fn list_deposits_in_state(
        &self,
        holder: &str,
        state: RequestState,
        limit: usize,
    ) -> Result<Vec<Deposit>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DEPOSIT_COLS} FROM deposits
                 WHERE holder=?1 AND state=?2
                 ORDER BY created_at ASC, transaction_hash ASC, output_index ASC LIMIT ?3"
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![holder, state as u8, limit as i64], deposit_from_row)
            .map_err(sql_err)?;
        let mut deposits = Vec::new();
        for row in rows {
            deposits.push(row.map_err(sql_err)?.into_deposit()?);
        }
        Ok(deposits)
    }

    // ============ Transactions ============

    /// Atomically: write the transaction, flip each assigned deposit
    /// Initial -> Pending with `spent_by`, and finish the proposing request.
    /// Either every input flips or none does.
    pub fn write_transaction_with_request(
        &self,
        transaction: &VaultTransaction,
        assigned: &[(String, u32)],
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "INSERT INTO transactions
             (transaction_hash, request_id, holder, chain, asset_id, data,
              raw_transaction, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                transaction.transaction_hash,
                transaction.request_id.to_string(),
                transaction.holder,
                transaction.chain as u8,
                transaction.asset_id,
                transaction.data,
                transaction.raw_transaction,
                transaction.state as u8,
                transaction.created_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;

        for (hash, index) in assigned {
            let updated = tx
                .execute(
                    "UPDATE deposits SET state=?1, spent_by=?2, updated_at=?3
                     WHERE transaction_hash=?4 AND output_index=?5 AND state=?6
                       AND spent_by IS NULL",
                    params![
                        RequestState::Pending as u8,
                        transaction.transaction_hash,
                        now(),
                        hash,
                        index,
                        RequestState::Initial as u8
                    ],
                )
                .map_err(sql_err)?;
            assert_eq!(updated, 1, "deposit {hash}:{index} already assigned");
        }

        finish_request_tx(&tx, &transaction.request_id, RequestState::Done)?;
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    pub fn read_transaction(&self, hash: &str) -> Result<Option<VaultTransaction>> {
        let conn = self.lock();
        read_transaction(&conn, "transaction_hash", hash)
    }

    pub fn read_transaction_by_request(&self, request_id: &Uuid) -> Result<Option<VaultTransaction>> {
        let conn = self.lock();
        read_transaction(&conn, "request_id", &request_id.to_string())
    }

    /// Fail a pending transaction and release its deposits back to Initial
    pub fn fail_transaction_with_request(
        &self,
        transaction_hash: &str,
        request_id: &Uuid,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "UPDATE transactions SET state=?1, updated_at=?2
             WHERE transaction_hash=?3 AND state IN (?4, ?5)",
            params![
                RequestState::Failed as u8,
                now(),
                transaction_hash,
                RequestState::Initial as u8,
                RequestState::Pending as u8
            ],
        )
        .map_err(sql_err)?;
        tx.execute(
            "UPDATE deposits SET state=?1, spent_by=NULL, updated_at=?2
             WHERE spent_by=?3 AND state=?4",
            params![
                RequestState::Initial as u8,
                now(),
                transaction_hash,
                RequestState::Pending as u8
            ],
        )
        .map_err(sql_err)?;
        tx.execute(
            "UPDATE signature_requests SET state=?1, updated_at=?2
             WHERE transaction_hash=?3 AND state IN (?4, ?5)",
            params![
                RequestState::Failed as u8,
                now(),
                transaction_hash,
                RequestState::Initial as u8,
                RequestState::Pending as u8
            ],
        )
        .map_err(sql_err)?;
        finish_request_tx(&tx, request_id, RequestState::Done)?;
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    /// Store the holder-signed raw, create one signature request per input
    /// and move the transaction to Pending
    pub fn request_transaction_signatures(
        &self,
        transaction_hash: &str,
        raw_transaction: &[u8],
        signature_requests: &[SignatureRequest],
        approving_request: &Uuid,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "UPDATE transactions SET raw_transaction=?1, state=?2, updated_at=?3
             WHERE transaction_hash=?4 AND state=?5",
            params![
                raw_transaction,
                RequestState::Pending as u8,
                now(),
                transaction_hash,
                RequestState::Initial as u8
            ],
        )
        .map_err(sql_err)?;
        for request in signature_requests {
            tx.execute(
                "INSERT INTO signature_requests
                 (request_id, transaction_hash, input_index, signer, curve, message,
                  signature, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?8)",
                params![
                    request.request_id.to_string(),
                    request.transaction_hash,
                    request.input_index,
                    request.signer,
                    request.curve as u8,
                    request.message,
                    RequestState::Initial as u8,
                    request.created_at.to_rfc3339(),
                ],
            )
            .map_err(sql_err)?;
        }
        finish_request_tx(&tx, approving_request, RequestState::Done)?;
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    pub fn read_signature_request(&self, id: &Uuid) -> Result<Option<SignatureRequest>> {
        let conn = self.lock();
        read_signature_request(&conn, id)
    }

    pub fn list_signature_requests(
        &self,
        transaction_hash: &str,
        state: RequestState,
    ) -> Result<Vec<SignatureRequest>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT request_id, transaction_hash, input_index, signer, curve, message,
                        signature, state, created_at
                 FROM signature_requests
                 WHERE transaction_hash=?1 AND state=?2
                 ORDER BY input_index ASC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![transaction_hash, state as u8], signature_request_row)
            .map_err(sql_err)?;
        let mut requests = Vec::new();
        for row in rows {
            requests.push(row.map_err(sql_err)?.build()?);
        }
        Ok(requests)
    }

    /// Record a signer response; returns true when every request of the
    /// transaction is Done, in which case the transaction (and the updated
    /// raw) moves to Done in the same store transaction
    pub fn finish_signature_request(
        &self,
        id: &Uuid,
        transaction_hash: &str,
        signature: &[u8],
        updated_raw: &[u8],
    ) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "UPDATE signature_requests SET signature=?1, state=?2, updated_at=?3
             WHERE request_id=?4 AND state IN (?5, ?6)",
            params![
                signature,
                RequestState::Done as u8,
                now(),
                id.to_string(),
                RequestState::Initial as u8,
                RequestState::Pending as u8
            ],
        )
        .map_err(sql_err)?;
        tx.execute(
            "UPDATE transactions SET raw_transaction=?1, updated_at=?2
             WHERE transaction_hash=?3",
            params![updated_raw, now(), transaction_hash],
        )
        .map_err(sql_err)?;

        let open: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM signature_requests
                 WHERE transaction_hash=?1 AND state IN (?2, ?3)",
                params![
                    transaction_hash,
                    RequestState::Initial as u8,
                    RequestState::Pending as u8
                ],
            |row| row.get(0),
            )
            .map_err(sql_err)?;
        let all_done = open == 0;
        if all_done {
            tx.execute(
                "UPDATE transactions SET state=?1, updated_at=?2
                 WHERE transaction_hash=?3 AND state=?4",
                params![
                    RequestState::Done as u8,
                    now(),
                    transaction_hash,
                    RequestState::Pending as u8
                ],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)?;
        Ok(all_done)
    }

    /// A fully signed spend permanently consumes its assigned deposits
    pub fn spend_assigned_deposits(&self, transaction_hash: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE deposits SET state=?1, updated_at=?2
             WHERE spent_by=?3 AND state=?4",
            params![
                RequestState::Done as u8,
                now(),
                transaction_hash,
                RequestState::Pending as u8
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Finalize a completed recovery: the account moves Done -> Failed and
    /// every deposit assigned to the recovery transaction becomes Done
    pub fn close_safe_with_transaction(
        &self,
        holder: &str,
        transaction_hash: &str,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "UPDATE safes SET state=?1, updated_at=?2 WHERE holder=?3 AND state=?4",
            params![
                RequestState::Failed as u8,
                now(),
                holder,
                RequestState::Done as u8
            ],
        )
        .map_err(sql_err)?;
        tx.execute(
            "UPDATE deposits SET state=?1, updated_at=?2 WHERE spent_by=?3",
            params![RequestState::Done as u8, now(), transaction_hash],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    /// Record an externally assembled recovery transaction (the
    /// holder+observer pre-signed close path) in its terminal state
    pub fn write_closed_transaction_with_request(
        &self,
        transaction: &VaultTransaction,
        assigned: &[(String, u32)],
        request_id: &Uuid,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "INSERT INTO transactions
             (transaction_hash, request_id, holder, chain, asset_id, data,
              raw_transaction, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                transaction.transaction_hash,
                transaction.request_id.to_string(),
                transaction.holder,
                transaction.chain as u8,
                transaction.asset_id,
                transaction.data,
                transaction.raw_transaction,
                RequestState::Done as u8,
                transaction.created_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        for (hash, index) in assigned {
            let updated = tx
                .execute(
                    "UPDATE deposits SET state=?1, spent_by=?2, updated_at=?3
                     WHERE transaction_hash=?4 AND output_index=?5 AND state IN (?6, ?7)",
                    params![
                        RequestState::Done as u8,
                        transaction.transaction_hash,
                        now(),
                        hash,
                        index,
                        RequestState::Initial as u8,
                        RequestState::Pending as u8
                    ],
                )
                .map_err(sql_err)?;
            assert_eq!(updated, 1, "deposit {hash}:{index} not spendable");
        }
        tx.execute(
            "UPDATE safes SET state=?1, updated_at=?2 WHERE holder=?3 AND state=?4",
            params![
                RequestState::Failed as u8,
                now(),
                transaction.holder,
                RequestState::Done as u8
            ],
        )
        .map_err(sql_err)?;
        finish_request_tx(&tx, request_id, RequestState::Done)?;
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    /// Move dispatched signature requests Initial -> Pending
    pub fn mark_signature_requests_pending(&self, transaction_hash: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE signature_requests SET state=?1, updated_at=?2
             WHERE transaction_hash=?3 AND state=?4",
            params![
                RequestState::Pending as u8,
                now(),
                transaction_hash,
                RequestState::Initial as u8
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

fn read_deposit(conn: &Connection, hash: &str, index: u32) -> Result<Option<Deposit>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {DEPOSIT_COLS} FROM deposits
                 WHERE transaction_hash=?1 AND output_index=?2"
            ),
            params![hash, index],
            deposit_from_row,
        )
        .optional()
        .map_err(sql_err)?;
    raw.map(RawDeposit::into_deposit).transpose()
}

fn read_transaction(
    conn: &Connection,
    column: &str,
    value: &str,
) -> Result<Option<VaultTransaction>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT transaction_hash, request_id, holder, chain, asset_id, data,
                        raw_transaction, state, created_at
                 FROM transactions WHERE {column}=?1"
            ),
            params![value],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)? as u8,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Vec<u8>>(6)?,
                    row.get::<_, i64>(7)? as u8,
                    row.get::<_, String>(8)?,
                ))
            },
        )
        .optional()
        .map_err(sql_err)?;
    let Some(raw) = raw else { return Ok(None) };
    Ok(Some(VaultTransaction {
        transaction_hash: raw.0,
        request_id: Uuid::parse_str(&raw.1)?,
        holder: raw.2,
        chain: Chain::from_byte(raw.3)?,
        asset_id: raw.4,
        data: raw.5,
        raw_transaction: raw.6,
        state: RequestState::from_byte(raw.7)?,
        created_at: parse_time(&raw.8)?,
    }))
}

struct RawSignatureRequest {
    request_id: String,
    transaction_hash: String,
    input_index: u32,
    signer: String,
    curve: u8,
    message: Vec<u8>,
    signature: Option<Vec<u8>>,
    state: u8,
    created_at: String,
}

impl RawSignatureRequest {
    fn build(self) -> Result<SignatureRequest> {
        Ok(SignatureRequest {
            request_id: Uuid::parse_str(&self.request_id)?,
            transaction_hash: self.transaction_hash,
            input_index: self.input_index,
            signer: self.signer,
            curve: Curve::from_byte(self.curve)?,
            message: self.message,
            signature: self.signature,
            state: RequestState::from_byte(self.state)?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

fn signature_request_row(row: &Row<'_>) -> rusqlite::Result<RawSignatureRequest> {
    Ok(RawSignatureRequest {
        request_id: row.get(0)?,
        transaction_hash: row.get(1)?,
        input_index: row.get::<_, i64>(2)? as u32,
        signer: row.get(3)?,
        curve: row.get::<_, i64>(4)? as u8,
        message: row.get(5)?,
        signature: row.get(6)?,
        state: row.get::<_, i64>(7)? as u8,
        created_at: row.get(8)?,
    })
}

fn read_signature_request(conn: &Connection, id: &Uuid) -> Result<Option<SignatureRequest>> {
    let raw = conn
        .query_row(
            "SELECT request_id, transaction_hash, input_index, signer, curve, message,
                    signature, state, created_at
             FROM signature_requests WHERE request_id=?1",
            params![id.to_string()],
            signature_request_row,
        )
        .optional()
        .map_err(sql_err)?;
    raw.map(RawSignatureRequest::build).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deposit(hash: &str, index: u32, satoshi: u64) -> Deposit {
        Deposit {
            transaction_hash: hash.into(),
            output_index: index,
            address: "bc1qaddr".into(),
            satoshi,
            chain: Chain::Bitcoin,
            holder: "holder".into(),
            script: vec![0x51],
            sequence: 6,
            deposit_height: 100,
            state: RequestState::Initial,
            spent_by: None,
            request_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        }
    }

    fn transaction(hash: &str) -> VaultTransaction {
        VaultTransaction {
            transaction_hash: hash.into(),
            request_id: Uuid::new_v4(),
            holder: "holder".into(),
            chain: Chain::Bitcoin,
            asset_id: "bond".into(),
            data: "[]".into(),
            raw_transaction: vec![1, 2, 3],
            state: RequestState::Initial,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_deposit_dedup() {
        let store = Store::open_memory().unwrap();
        let d = deposit("aa", 0, 1000);
        let rid = Uuid::new_v4();
        assert!(store.write_deposit_with_request(&d, &rid).unwrap());
        assert!(!store.write_deposit_with_request(&d, &rid).unwrap());
        assert_eq!(store.list_spendable_deposits("holder", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_assignment_and_release() {
        let store = Store::open_memory().unwrap();
        store
            .write_deposit_with_request(&deposit("aa", 0, 1000), &Uuid::new_v4())
            .unwrap();
        store
            .write_deposit_with_request(&deposit("bb", 1, 2000), &Uuid::new_v4())
            .unwrap();

        let tx = transaction("spend-1");
        store
            .write_transaction_with_request(
                &tx,
                &[("aa".to_string(), 0), ("bb".to_string(), 1)],
            )
            .unwrap();
        assert_eq!(store.list_spendable_deposits("holder", 10).unwrap().len(), 0);
        assert_eq!(store.list_pending_deposits("holder").unwrap().len(), 2);
        let d = store.read_deposit("aa", 0).unwrap().unwrap();
        assert_eq!(d.spent_by.as_deref(), Some("spend-1"));

        store
            .fail_transaction_with_request("spend-1", &Uuid::new_v4())
            .unwrap();
        assert_eq!(store.list_spendable_deposits("holder", 10).unwrap().len(), 2);
        assert_eq!(store.list_pending_deposits("holder").unwrap().len(), 0);
        assert_eq!(
            store.read_transaction("spend-1").unwrap().unwrap().state,
            RequestState::Failed
        );
    }

    #[test]
    #[should_panic(expected = "already assigned")]
    fn test_double_assignment_panics() {
        let store = Store::open_memory().unwrap();
        store
            .write_deposit_with_request(&deposit("aa", 0, 1000), &Uuid::new_v4())
            .unwrap();
        store
            .write_transaction_with_request(&transaction("spend-1"), &[("aa".to_string(), 0)])
            .unwrap();
        store
            .write_transaction_with_request(&transaction("spend-2"), &[("aa".to_string(), 0)])
            .unwrap();
    }

    #[test]
    fn test_signature_request_lifecycle() {
        let store = Store::open_memory().unwrap();
        store
            .write_deposit_with_request(&deposit("aa", 0, 1000), &Uuid::new_v4())
            .unwrap();
        let tx = transaction("spend-1");
        store
            .write_transaction_with_request(&tx, &[("aa".to_string(), 0)])
            .unwrap();

        let requests: Vec<SignatureRequest> = (0..2)
            .map(|i| SignatureRequest {
                request_id: Uuid::new_v4(),
                transaction_hash: "spend-1".into(),
                input_index: i,
                signer: "signer".into(),
                curve: Curve::Secp256k1EcdsaBitcoin,
                message: vec![i as u8; 32],
                signature: None,
                state: RequestState::Initial,
                created_at: Utc::now(),
            })
            .collect();
        store
            .request_transaction_signatures("spend-1", &[9, 9], &requests, &Uuid::new_v4())
            .unwrap();
        assert_eq!(
            store.read_transaction("spend-1").unwrap().unwrap().state,
            RequestState::Pending
        );
        assert_eq!(
            store
                .list_signature_requests("spend-1", RequestState::Initial)
                .unwrap()
                .len(),
            2
        );

        store.mark_signature_requests_pending("spend-1").unwrap();
        let done = store
            .finish_signature_request(&requests[0].request_id, "spend-1", &[1], &[9])
            .unwrap();
        assert!(!done);
        let done = store
            .finish_signature_request(&requests[1].request_id, "spend-1", &[2], &[10])
            .unwrap();
        assert!(done);

        let read = store.read_transaction("spend-1").unwrap().unwrap();
        assert_eq!(read.state, RequestState::Done);
        assert_eq!(read.raw_transaction, vec![10]);
        assert_eq!(
            store
                .list_signature_requests("spend-1", RequestState::Done)
                .unwrap()
                .len(),
            2
        );
    }
}
