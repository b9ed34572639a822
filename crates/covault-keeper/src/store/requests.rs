//! Request rows: one per delivered authorization

use super::{now, parse_decimal, parse_time, sql_err, Store};
use covault_core::{Curve, Request, RequestState, Result, Role};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<RawRequest> {
    Ok(RawRequest {
        id: row.get(0)?,
        output_id: row.get(1)?,
        sequence: row.get::<_, i64>(2)? as u64,
        asset_id: row.get(3)?,
        amount: row.get(4)?,
        role: row.get::<_, i64>(5)? as u8,
        action: row.get::<_, i64>(6)? as u8,
        curve: row.get::<_, i64>(7)? as u8,
        holder: row.get(8)?,
        extra: row.get(9)?,
        state: row.get::<_, i64>(10)? as u8,
        created_at: row.get(11)?,
    })
}

struct RawRequest {
    id: String,
    output_id: String,
    sequence: u64,
    asset_id: String,
    amount: String,
    role: u8,
    action: u8,
    curve: u8,
    holder: String,
    extra: Vec<u8>,
    state: u8,
    created_at: String,
}

impl RawRequest {
    fn into_request(self) -> Result<Request> {
        Ok(Request {
            id: Uuid::parse_str(&self.id)?,
            output_id: self.output_id,
            sequence: self.sequence,
            asset_id: self.asset_id,
            amount: parse_decimal(&self.amount)?,
            role: Role::from_byte(self.role)?,
            action: self.action,
            curve: Curve::from_byte(self.curve)?,
            holder: self.holder,
            extra: self.extra,
            state: RequestState::from_byte(self.state)?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

impl Store {
    /// Record a freshly delivered request; a duplicate id is a no-op and
    /// returns false
    pub fn write_request_if_not_exists(&self, req: &Request) -> Result<bool> {
        assert!(req.state == RequestState::Initial, "request {:?}", req.state);
        let conn = self.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO requests
                 (request_id, output_id, sequence, asset_id, amount, role, action,
                  curve, holder, extra, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                params![
                    req.id.to_string(),
                    req.output_id,
                    req.sequence as i64,
                    req.asset_id,
                    req.amount.to_string(),
                    req.role as u8,
                    req.action,
                    req.curve as u8,
                    req.holder,
                    req.extra,
                    RequestState::Initial as u8,
                    req.created_at.to_rfc3339(),
                ],
            )
            .map_err(sql_err)?;
        Ok(inserted > 0)
    }

    pub fn read_request(&self, id: &Uuid) -> Result<Option<Request>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                "SELECT request_id, output_id, sequence, asset_id, amount, role, action,
                        curve, holder, extra, state, created_at
                 FROM requests WHERE request_id=?1",
                params![id.to_string()],
                request_from_row,
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(RawRequest::into_request).transpose()
    }

    /// Terminal transition of a request, Initial -> Done or Failed
    pub fn finish_request(&self, id: &Uuid, state: RequestState) -> Result<()> {
        assert!(
            matches!(state, RequestState::Done | RequestState::Failed),
            "finish state {state:?}"
        );
        let conn = self.lock();
        conn.execute(
            "UPDATE requests SET state=?1, updated_at=?2
             WHERE request_id=?3 AND state=?4",
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

    /// Most recently delivered request, used by replay checks
    pub fn read_latest_request(&self) -> Result<Option<Request>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                "SELECT request_id, output_id, sequence, asset_id, amount, role, action,
                        curve, holder, extra, state, created_at
                 FROM requests ORDER BY sequence DESC LIMIT 1",
                [],
                request_from_row,
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(RawRequest::into_request).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn sample(id: Uuid) -> Request {
        Request {
            id,
            output_id: "output".into(),
            sequence: 42,
            asset_id: "asset".into(),
            amount: Decimal::new(1, 0),
            role: Role::Holder,
            action: 110,
            curve: Curve::Secp256k1EcdsaBitcoin,
            holder: "holder".into(),
            extra: vec![1, 2, 3],
            state: RequestState::Initial,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_request_round_trip() {
        let store = Store::open_memory().unwrap();
        let req = sample(Uuid::new_v4());
        assert!(store.write_request_if_not_exists(&req).unwrap());
        assert!(!store.write_request_if_not_exists(&req).unwrap());

        let read = store.read_request(&req.id).unwrap().unwrap();
        assert_eq!(read.id, req.id);
        assert_eq!(read.sequence, 42);
        assert_eq!(read.role, Role::Holder);
        assert_eq!(read.extra, vec![1, 2, 3]);
        assert_eq!(read.state, RequestState::Initial);
    }

    #[test]
    fn test_finish_request_is_one_way() {
        let store = Store::open_memory().unwrap();
        let req = sample(Uuid::new_v4());
        store.write_request_if_not_exists(&req).unwrap();
        store.finish_request(&req.id, RequestState::Done).unwrap();
        // a second transition away from a terminal state does nothing
        store.finish_request(&req.id, RequestState::Failed).unwrap();
        let read = store.read_request(&req.id).unwrap().unwrap();
        assert_eq!(read.state, RequestState::Done);
    }

    #[test]
    fn test_latest_request_by_sequence() {
        let store = Store::open_memory().unwrap();
        let mut a = sample(Uuid::new_v4());
        a.sequence = 10;
        let mut b = sample(Uuid::new_v4());
        b.sequence = 20;
        store.write_request_if_not_exists(&a).unwrap();
        store.write_request_if_not_exists(&b).unwrap();
        assert_eq!(store.read_latest_request().unwrap().unwrap().id, b.id);
    }
}
