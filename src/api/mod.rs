//! HTTP API for health checks, status and transaction submission

use crate::config::ApiConfig;
use crate::coordination::{ManagerSnapshot, TransactionManager};
use crate::error::{RelayerError, RelayerResult};
use crate::state::StateManager;
use crate::tx::{TransactionRequest, TxId};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TransactionManager>,
    pub state_manager: Option<Arc<StateManager>>,
    pub started: Instant,
}

impl AppState {
    pub fn new(manager: Arc<TransactionManager>, state_manager: Option<Arc<StateManager>>) -> Self {
        Self {
            manager,
            state_manager,
            started: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/transactions", axum::routing::post(submit_transaction))
        .route(
            "/transactions/:id",
            get(get_transaction).delete(cancel_transaction),
        )
        .route("/transactions/:id/attempts", get(get_attempts))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Config(format!("Cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - usable accounts and, if configured, the journal database
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.manager.snapshot().await;
    let accounts_ok = snapshot.accounts_usable > 0;

    let database = match &state.state_manager {
        Some(db) => Some(db.health_check().await.is_ok()),
        None => None,
    };

    let ready = accounts_ok && database.unwrap_or(true);
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(ReadinessResponse {
            ready,
            accounts: accounts_ok,
            database,
        }),
    )
}

/// Get relayer status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        manager: state.manager.snapshot().await,
    })
}

async fn submit_transaction(
    State(state): State<AppState>,
    Json(request): Json<TransactionRequest>,
) -> Response {
    match state.manager.submit_transaction(request).await {
        Ok(tx_id) => (StatusCode::ACCEPTED, Json(SubmittedResponse { tx_id })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_transaction(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let tx_id = match parse_id(&id) {
        Ok(tx_id) => tx_id,
        Err(resp) => return resp,
    };

    match state.manager.get_status(tx_id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_attempts(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let tx_id = match parse_id(&id) {
        Ok(tx_id) => tx_id,
        Err(resp) => return resp,
    };

    match state.manager.get_status(tx_id).await {
        Ok(_) => Json(state.manager.attempts(tx_id).await).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_transaction(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let tx_id = match parse_id(&id) {
        Ok(tx_id) => tx_id,
        Err(resp) => return resp,
    };

    match state.manager.cancel(tx_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

fn parse_id(id: &str) -> Result<TxId, Response> {
    id.parse::<TxId>().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("Invalid transaction id: {}", id),
            }),
        )
            .into_response()
    })
}

fn error_response(err: RelayerError) -> Response {
    let code = match &err {
        RelayerError::TransactionNotFound { .. } => StatusCode::NOT_FOUND,
        RelayerError::NotCancellable { .. } => StatusCode::CONFLICT,
        RelayerError::Backpressure { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        code,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    accounts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<bool>,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    #[serde(flatten)]
    manager: ManagerSnapshot,
}

#[derive(Serialize)]
struct SubmittedResponse {
    tx_id: TxId,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
