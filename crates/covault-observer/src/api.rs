//! Read-only HTTP API
//!
//! Small informational surface over the stores: account lookup by address,
//! transaction lookup by hash, and the latest chain tips. Nothing here
//! mutates state.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use covault_core::{Chain, RequestState};
use covault_keeper::store::Store as KeeperStore;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared handler state
pub struct ApiState {
    pub keeper_store: Arc<KeeperStore>,
}

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct AccountView {
    address: String,
    chain: String,
    holder: String,
    threshold: u8,
    timelock_secs: u64,
    state: RequestState,
}

#[derive(Debug, Serialize)]
struct TransactionView {
    transaction_hash: String,
    chain: String,
    holder: String,
    outputs: serde_json::Value,
    state: RequestState,
}

#[derive(Debug, Serialize)]
struct ChainTipView {
    chain: String,
    height: u64,
    hash: String,
    fee: u64,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ApiResponse::<()>::error(self.1))).into_response()
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, format!("{what} not found"))
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/accounts/:id", get(get_account))
        .route("/transactions/:id", get(get_transaction))
        .route("/chains", get(get_chains))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the process stops
pub async fn serve(state: Arc<ApiState>, addr: SocketAddr) -> std::io::Result<()> {
    info!(address = %addr, "starting read-only api");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .await
        .map_err(std::io::Error::other)
}

async fn get_account(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let safe = state
        .keeper_store
        .read_safe_by_address(&id)
        .map_err(internal)?
        .ok_or_else(|| not_found("account"))?;
    Ok(Json(ApiResponse::success(AccountView {
        address: safe.address,
        chain: safe.chain.to_string(),
        holder: safe.holder,
        threshold: safe.threshold,
        timelock_secs: safe.timelock_secs,
        state: safe.state,
    })))
}

async fn get_transaction(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tx = state
        .keeper_store
        .read_transaction(&id)
        .map_err(internal)?
        .ok_or_else(|| not_found("transaction"))?;
    let outputs = serde_json::from_str(&tx.data).unwrap_or(serde_json::Value::Null);
    Ok(Json(ApiResponse::success(TransactionView {
        transaction_hash: tx.transaction_hash,
        chain: tx.chain.to_string(),
        holder: tx.holder,
        outputs,
        state: tx.state,
    })))
}

async fn get_chains(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let mut tips = Vec::new();
    for chain in [Chain::Bitcoin, Chain::Ethereum, Chain::Litecoin, Chain::Polygon] {
        if let Some(info) = state
            .keeper_store
            .read_latest_network_info(chain)
            .map_err(internal)?
        {
            tips.push(ChainTipView {
                chain: chain.to_string(),
                height: info.height,
                hash: info.hash,
                fee: info.fee,
            });
        }
    }
    Ok(Json(ApiResponse::success(tips)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_shapes() {
        let ok = ApiResponse::success(42);
        let body = serde_json::to_value(&ok).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], 42);
        assert!(body.get("error").is_none());

        let err = ApiResponse::<()>::error("missing");
        let body = serde_json::to_value(&err).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "missing");
    }
}
