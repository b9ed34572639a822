//! Network-info snapshots and operation parameters pushed by observers

use super::accounts::finish_request_tx;
use super::{parse_decimal, parse_time, sql_err, Store};
use chrono::{DateTime, Utc};
use covault_core::{Chain, RequestState, Result};
use rusqlite::{params, OptionalExtension};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Latest chain tip and fee estimate as pushed by an observer
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub request_id: Uuid,
    pub chain: Chain,
    /// sat/vB for Bitcoin family, wei price for Ethereum family
    pub fee: u64,
    pub height: u64,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// Economic parameters: account price and spend minimum
#[derive(Debug, Clone)]
pub struct OperationParams {
    pub request_id: Uuid,
    pub chain: Chain,
    pub price_asset: String,
    pub price_amount: Decimal,
    pub transaction_minimum: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub fn write_network_info_with_request(&self, info: &NetworkInfo) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "INSERT INTO network_infos
             (request_id, chain, fee, height, hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                info.request_id.to_string(),
                info.chain as u8,
                info.fee as i64,
                info.height as i64,
                info.hash,
                info.created_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        finish_request_tx(&tx, &info.request_id, RequestState::Done)?;
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    /// Latest accepted snapshot for the chain; height never decreases
    pub fn read_latest_network_info(&self, chain: Chain) -> Result<Option<NetworkInfo>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                "SELECT request_id, chain, fee, height, hash, created_at
                 FROM network_infos WHERE chain=?1
                 ORDER BY height DESC, created_at DESC LIMIT 1",
                params![chain as u8],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? as u8,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, i64>(3)? as u64,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;
        let Some(raw) = raw else { return Ok(None) };
        Ok(Some(NetworkInfo {
            request_id: Uuid::parse_str(&raw.0)?,
            chain: Chain::from_byte(raw.1)?,
            fee: raw.2,
            height: raw.3,
            hash: raw.4,
            created_at: parse_time(&raw.5)?,
        }))
    }

    pub fn write_operation_params_with_request(&self, params_row: &OperationParams) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "INSERT INTO operation_params
             (request_id, chain, price_asset, price_amount, transaction_minimum,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                params_row.request_id.to_string(),
                params_row.chain as u8,
                params_row.price_asset,
                params_row.price_amount.to_string(),
                params_row.transaction_minimum.to_string(),
                params_row.created_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        finish_request_tx(&tx, &params_row.request_id, RequestState::Done)?;
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    pub fn read_latest_operation_params(&self, chain: Chain) -> Result<Option<OperationParams>> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                "SELECT request_id, chain, price_asset, price_amount, transaction_minimum,
                        created_at
                 FROM operation_params WHERE chain=?1
                 ORDER BY created_at DESC LIMIT 1",
                params![chain as u8],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? as u8,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;
        let Some(raw) = raw else { return Ok(None) };
        Ok(Some(OperationParams {
            request_id: Uuid::parse_str(&raw.0)?,
            chain: Chain::from_byte(raw.1)?,
            price_asset: raw.2,
            price_amount: parse_decimal(&raw.3)?,
            transaction_minimum: parse_decimal(&raw.4)?,
            created_at: parse_time(&raw.5)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_network_info_orders_by_height() {
        let store = Store::open_memory().unwrap();
        for (height, hash) in [(100u64, "aa"), (102, "cc"), (101, "bb")] {
            store
                .write_network_info_with_request(&NetworkInfo {
                    request_id: Uuid::new_v4(),
                    chain: Chain::Bitcoin,
                    fee: 1,
                    height,
                    hash: hash.into(),
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let latest = store
            .read_latest_network_info(Chain::Bitcoin)
            .unwrap()
            .unwrap();
        assert_eq!(latest.height, 102);
        assert_eq!(latest.hash, "cc");
        assert!(store
            .read_latest_network_info(Chain::Litecoin)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_operation_params_round_trip() {
        let store = Store::open_memory().unwrap();
        store
            .write_operation_params_with_request(&OperationParams {
                request_id: Uuid::new_v4(),
                chain: Chain::Bitcoin,
                price_asset: "31d2ea9c-95eb-3355-b65b-ba096853bc18".into(),
                price_amount: Decimal::new(30123, 4),
                transaction_minimum: Decimal::new(1, 4),
                created_at: Utc::now(),
            })
            .unwrap();
        let params = store
            .read_latest_operation_params(Chain::Bitcoin)
            .unwrap()
            .unwrap();
        assert_eq!(params.price_amount.to_string(), "3.0123");
        assert_eq!(params.transaction_minimum.to_string(), "0.0001");
    }
}
