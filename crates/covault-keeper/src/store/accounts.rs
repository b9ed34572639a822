//! Spare keys, account proposals and accounts

use super::{now, parse_time, sql_err, Store};
use chrono::{DateTime, Utc};
use covault_core::{Curve, Error, RequestState, Result, Role};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

/// A signer- or observer-flagged key produced by keygen or enrolled by the
/// observer; spare until bound to an account proposal
#[derive(Debug, Clone)]
pub struct SpareKey {
    pub public: String,
    pub fingerprint: String,
    pub curve: Curve,
    pub chain_code: [u8; 32],
    pub flags: Role,
    /// Holder of the account this key is bound to, none while spare
    pub holder: Option<String>,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}

/// First stage of the account lifecycle
#[derive(Debug, Clone)]
pub struct SafeProposal {
    pub request_id: Uuid,
    pub chain: covault_core::Chain,
    pub holder: String,
    pub signer: String,
    pub observer: String,
    pub timelock_secs: u64,
    pub address: String,
    /// Chain-specific account blob (witness account or contract record)
    pub extra: Vec<u8>,
    pub receivers: Vec<String>,
    pub threshold: u8,
    pub created_at: DateTime<Utc>,
}

/// An approved, immutable account; only `state` may change, Done -> Failed
/// on a successful close
#[derive(Debug, Clone)]
pub struct Safe {
    pub holder: String,
    pub chain: covault_core::Chain,
    pub signer: String,
    pub observer: String,
    pub timelock_secs: u64,
    /// Compact BIP32 path the signer/observer child keys derive along
    pub path: Vec<u8>,
    pub address: String,
    pub extra: Vec<u8>,
    pub receivers: Vec<String>,
    pub threshold: u8,
    pub request_id: Uuid,
    /// Next contract nonce, Ethereum family only
    pub nonce: u64,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
}

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, u8, Vec<u8>, u8, Option<String>, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get::<_, i64>(2)? as u8,
        row.get(3)?,
        row.get::<_, i64>(4)? as u8,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn build_key(
    raw: (String, String, u8, Vec<u8>, u8, Option<String>, String, String),
) -> Result<SpareKey> {
    let chain_code: [u8; 32] = raw
        .3
        .try_into()
        .map_err(|_| Error::Store("chain code must be 32 bytes".into()))?;
    Ok(SpareKey {
        public: raw.0,
        fingerprint: raw.1,
        curve: Curve::from_byte(raw.2)?,
        chain_code,
        flags: Role::from_byte(raw.4)?,
        holder: raw.5,
        request_id: raw.6,
        created_at: parse_time(&raw.7)?,
    })
}

const KEY_COLS: &str =
    "public, fingerprint, curve, chain_code, flags, holder, request_id, created_at";

fn safe_from_row(row: &Row<'_>) -> rusqlite::Result<RawSafe> {
    Ok(RawSafe {
        holder: row.get(0)?,
        chain: row.get::<_, i64>(1)? as u8,
        signer: row.get(2)?,
        observer: row.get(3)?,
        timelock: row.get::<_, i64>(4)? as u64,
        path: row.get(5)?,
        address: row.get(6)?,
        extra: row.get(7)?,
        receivers: row.get(8)?,
        threshold: row.get::<_, i64>(9)? as u8,
        request_id: row.get(10)?,
        nonce: row.get::<_, i64>(11)? as u64,
        state: row.get::<_, i64>(12)? as u8,
        created_at: row.get(13)?,
    })
}

struct RawSafe {
    holder: String,
    chain: u8,
    signer: String,
    observer: String,
    timelock: u64,
    path: Vec<u8>,
    address: String,
    extra: Vec<u8>,
    receivers: String,
    threshold: u8,
    request_id: String,
    nonce: u64,
    state: u8,
    created_at: String,
}

impl RawSafe {
    fn into_safe(self) -> Result<Safe> {
        Ok(Safe {
            holder: self.holder,
            chain: covault_core::Chain::from_byte(self.chain)?,
            signer: self.signer,
            observer: self.observer,
            timelock_secs: self.timelock,
            path: self.path,
            address: self.address,
            extra: self.extra,
            receivers: split_receivers(&self.receivers),
            threshold: self.threshold,
            request_id: Uuid::parse_str(&self.request_id)?,
            nonce: self.nonce,
            state: RequestState::from_byte(self.state)?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

const SAFE_COLS: &str = "holder, chain, signer, observer, timelock, path, address, extra, \
                         receivers, threshold, request_id, nonce, state, created_at";

fn split_receivers(joined: &str) -> Vec<String> {
    joined.split(';').map(str::to_string).collect()
}

impl Store {
    // ============ Keys ============

    /// Enroll a key; a duplicate public key returns false
    pub fn write_key_if_not_exists(&self, key: &SpareKey) -> Result<bool> {
        let conn = self.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO keys
                 (public, fingerprint, curve, chain_code, flags, holder, request_id,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    key.public,
                    key.fingerprint,
                    key.curve as u8,
                    key.chain_code.as_slice(),
                    key.flags as u8,
                    key.holder,
                    key.request_id,
                    key.created_at.to_rfc3339(),
                ],
            )
            .map_err(sql_err)?;
        Ok(inserted > 0)
    }

    pub fn read_key(&self, public: &str) -> Result<Option<SpareKey>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {KEY_COLS} FROM keys WHERE public=?1"),
                params![public],
                key_from_row,
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(build_key).transpose()
    }

    pub fn count_spare_keys(&self, curve: Curve, flags: Role) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM keys WHERE curve=?1 AND flags=?2 AND holder IS NULL",
                params![curve as u8, flags as u8],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(count as usize)
    }

    fn oldest_spare_key(
        conn: &Connection,
        curve: Curve,
        flags: Role,
        matured_before: &DateTime<Utc>,
    ) -> Result<Option<SpareKey>> {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {KEY_COLS} FROM keys
                     WHERE curve=?1 AND flags=?2 AND holder IS NULL AND created_at<=?3
                     ORDER BY created_at ASC LIMIT 1"
                ),
                params![curve as u8, flags as u8, matured_before.to_rfc3339()],
                key_from_row,
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(build_key).transpose()
    }

    /// Oldest matured spare key without binding it; the proposal write
    /// re-reads under its transaction and binds the same key because the
    /// keeper consumer is single-threaded
    pub fn peek_spare_key(
        &self,
        curve: Curve,
        flags: Role,
        matured_before: &DateTime<Utc>,
    ) -> Result<Option<SpareKey>> {
        let conn = self.lock();
        Store::oldest_spare_key(&conn, curve, flags, matured_before)
    }

    // ============ Proposals ============

    pub fn read_safe_proposal(&self, request_id: &Uuid) -> Result<Option<SafeProposal>> {
        let conn = self.lock();
        read_proposal(&conn, "request_id", &request_id.to_string())
    }

    pub fn read_safe_proposal_by_holder(&self, holder: &str) -> Result<Option<SafeProposal>> {
        let conn = self.lock();
        read_proposal(&conn, "holder", holder)
    }

    pub fn read_safe_proposal_by_address(&self, address: &str) -> Result<Option<SafeProposal>> {
        let conn = self.lock();
        read_proposal(&conn, "address", address)
    }

    /// Atomically: bind one spare signer key and one spare observer key to
    /// the holder, write the proposal, and finish the proposing request.
    /// Returns the bound (signer, observer) keys, or None when no matured
    /// spare pair exists (the request is failed in that case by the caller).
    pub fn write_safe_proposal_with_request(
        &self,
        proposal: &SafeProposal,
        matured_before: &DateTime<Utc>,
    ) -> Result<Option<(SpareKey, SpareKey)>> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;

        let signer = Store::oldest_spare_key(&tx, proposal.chain_curve(), Role::Signer, matured_before)?;
        let observer =
            Store::oldest_spare_key(&tx, proposal.chain_curve(), Role::Observer, matured_before)?;
        let (signer, observer) = match (signer, observer) {
            (Some(s), Some(o)) => (s, o),
            _ => return Ok(None),
        };

        for key in [&signer, &observer] {
            let updated = tx
                .execute(
                    "UPDATE keys SET holder=?1, updated_at=?2 WHERE public=?3 AND holder IS NULL",
                    params![proposal.holder, now(), key.public],
                )
                .map_err(sql_err)?;
            assert_eq!(updated, 1, "spare key {} already bound", key.public);
        }

        tx.execute(
            "INSERT INTO safe_proposals
             (request_id, chain, holder, signer, observer, timelock, address, extra,
              receivers, threshold, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                proposal.request_id.to_string(),
                proposal.chain as u8,
                proposal.holder,
                signer.public,
                observer.public,
                proposal.timelock_secs as i64,
                proposal.address,
                proposal.extra,
                proposal.receivers.join(";"),
                proposal.threshold,
                proposal.created_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;

        finish_request_tx(&tx, &proposal.request_id, RequestState::Done)?;
        tx.commit().map_err(sql_err)?;
        Ok(Some((signer, observer)))
    }

    // ============ Safes ============

    /// Promote a proposal to an account and finish the approving request
    pub fn write_safe_with_request(&self, safe: &Safe, approving_request: &Uuid) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "INSERT INTO safes
             (holder, chain, signer, observer, timelock, path, address, extra,
              receivers, threshold, request_id, nonce, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                safe.holder,
                safe.chain as u8,
                safe.signer,
                safe.observer,
                safe.timelock_secs as i64,
                safe.path,
                safe.address,
                safe.extra,
                safe.receivers.join(";"),
                safe.threshold,
                safe.request_id.to_string(),
                safe.nonce as i64,
                safe.state as u8,
                safe.created_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        finish_request_tx(&tx, approving_request, RequestState::Done)?;
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    pub fn read_safe(&self, holder: &str) -> Result<Option<Safe>> {
        let conn = self.lock();
        read_safe(&conn, "holder", holder)
    }

    pub fn read_safe_by_address(&self, address: &str) -> Result<Option<Safe>> {
        let conn = self.lock();
        read_safe(&conn, "address", address)
    }

    /// Bump the contract nonce after an Ethereum-family proposal
    pub fn increment_safe_nonce(&self, holder: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE safes SET nonce=nonce+1, updated_at=?1 WHERE holder=?2",
            params![now(), holder],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

impl SafeProposal {
    /// Key family the proposal's authorities live on
    pub fn chain_curve(&self) -> Curve {
        if self.chain.is_bitcoin_family() {
            Curve::Secp256k1EcdsaBitcoin
        } else {
            Curve::Secp256k1EcdsaEthereum
        }
    }
}

fn read_proposal(conn: &Connection, column: &str, value: &str) -> Result<Option<SafeProposal>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT request_id, chain, holder, signer, observer, timelock, address,
                        extra, receivers, threshold, created_at
                 FROM safe_proposals WHERE {column}=?1"
            ),
            params![value],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as u8,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)? as u64,
                    row.get::<_, String>(6)?,
                    row.get::<_, Vec<u8>>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, i64>(9)? as u8,
                    row.get::<_, String>(10)?,
                ))
            },
        )
        .optional()
        .map_err(sql_err)?;
    let Some(raw) = raw else { return Ok(None) };
    Ok(Some(SafeProposal {
        request_id: Uuid::parse_str(&raw.0)?,
        chain: covault_core::Chain::from_byte(raw.1)?,
        holder: raw.2,
        signer: raw.3,
        observer: raw.4,
        timelock_secs: raw.5,
        address: raw.6,
        extra: raw.7,
        receivers: split_receivers(&raw.8),
        threshold: raw.9,
        created_at: parse_time(&raw.10)?,
    }))
}

fn read_safe(conn: &Connection, column: &str, value: &str) -> Result<Option<Safe>> {
    let raw = conn
        .query_row(
            &format!("SELECT {SAFE_COLS} FROM safes WHERE {column}=?1"),
            params![value],
            safe_from_row,
        )
        .optional()
        .map_err(sql_err)?;
    raw.map(RawSafe::into_safe).transpose()
}

pub(crate) fn finish_request_tx(
    conn: &Connection,
    id: &Uuid,
    state: RequestState,
) -> Result<()> {
    conn.execute(
        "UPDATE requests SET state=?1, updated_at=?2 WHERE request_id=?3 AND state=?4",
        params![
            state as u8,
            now(),
            id.to_string(),
            RequestState::Initial as u8
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use covault_core::Chain;

    fn spare(public: &str, flags: Role, age_hours: i64) -> SpareKey {
        SpareKey {
            public: public.into(),
            fingerprint: hex::encode(covault_core::fingerprint(public.as_bytes())),
            curve: Curve::Secp256k1EcdsaBitcoin,
            chain_code: [7u8; 32],
            flags,
            holder: None,
            request_id: Uuid::new_v4().to_string(),
            created_at: Utc::now() - Duration::hours(age_hours),
        }
    }

    fn proposal(holder: &str) -> SafeProposal {
        SafeProposal {
            request_id: Uuid::new_v4(),
            chain: Chain::Bitcoin,
            holder: holder.into(),
            signer: String::new(),
            observer: String::new(),
            timelock_secs: 3_600,
            address: format!("bc1q{holder}"),
            extra: vec![1],
            receivers: vec!["r1".into(), "r2".into()],
            threshold: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_spare_key_accounting() {
        let store = Store::open_memory().unwrap();
        assert!(store
            .write_key_if_not_exists(&spare("s1", Role::Signer, 48))
            .unwrap());
        assert!(!store
            .write_key_if_not_exists(&spare("s1", Role::Signer, 48))
            .unwrap());
        store
            .write_key_if_not_exists(&spare("o1", Role::Observer, 48))
            .unwrap();

        assert_eq!(
            store
                .count_spare_keys(Curve::Secp256k1EcdsaBitcoin, Role::Signer)
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .count_spare_keys(Curve::Secp256k1EcdsaBitcoin, Role::Observer)
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_proposal_binds_matured_keys_fifo() {
        let store = Store::open_memory().unwrap();
        store
            .write_key_if_not_exists(&spare("s-old", Role::Signer, 72))
            .unwrap();
        store
            .write_key_if_not_exists(&spare("s-new", Role::Signer, 48))
            .unwrap();
        store
            .write_key_if_not_exists(&spare("o1", Role::Observer, 48))
            .unwrap();
        // immature key must not be picked
        store
            .write_key_if_not_exists(&spare("o-young", Role::Observer, 1))
            .unwrap();

        let matured = Utc::now() - Duration::hours(24);
        let p = proposal("holder-a");
        let (signer, observer) = store
            .write_safe_proposal_with_request(&p, &matured)
            .unwrap()
            .unwrap();
        assert_eq!(signer.public, "s-old");
        assert_eq!(observer.public, "o1");

        assert_eq!(
            store
                .count_spare_keys(Curve::Secp256k1EcdsaBitcoin, Role::Signer)
                .unwrap(),
            1
        );
        let bound = store.read_key("s-old").unwrap().unwrap();
        assert_eq!(bound.holder.as_deref(), Some("holder-a"));

        let read = store.read_safe_proposal(&p.request_id).unwrap().unwrap();
        assert_eq!(read.signer, "s-old");
        assert_eq!(read.receivers, vec!["r1", "r2"]);
        assert!(store
            .read_safe_proposal_by_address(&p.address)
            .unwrap()
            .is_some());

        // a second proposal cannot bind: no observer key left
        let none = store
            .write_safe_proposal_with_request(&proposal("holder-b"), &matured)
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_safe_round_trip() {
        let store = Store::open_memory().unwrap();
        let safe = Safe {
            holder: "holder".into(),
            chain: Chain::Bitcoin,
            signer: "signer".into(),
            observer: "observer".into(),
            timelock_secs: 3_600,
            path: vec![0, 0, 0, 0],
            address: "bc1qaddr".into(),
            extra: vec![9],
            receivers: vec!["r".into()],
            threshold: 1,
            request_id: Uuid::new_v4(),
            nonce: 0,
            state: RequestState::Done,
            created_at: Utc::now(),
        };
        store.write_safe_with_request(&safe, &safe.request_id).unwrap();
        let read = store.read_safe("holder").unwrap().unwrap();
        assert_eq!(read.address, "bc1qaddr");
        assert_eq!(read.state, RequestState::Done);
        assert!(store.read_safe_by_address("bc1qaddr").unwrap().is_some());

        store.increment_safe_nonce("holder").unwrap();
        assert_eq!(store.read_safe("holder").unwrap().unwrap().nonce, 1);
    }
}
