//! HTTP surface of the context engine.
//!
//! Routes:
//! - POST /api/tenants/:tenant_id/exchanges - Record an exchange
//! - GET /api/tenants/:tenant_id/context - Assemble a context transcript
//! - GET /api/health - Log and index health

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use recall_models::NewExchange;

use crate::services::ContextSource;
use crate::{AppState, Result};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/tenants/:tenant_id/exchanges", post(record_exchange))
        .route("/api/tenants/:tenant_id/context", get(get_context))
        .route("/api/health", get(get_health))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Acknowledgement for a recorded exchange.
#[derive(Debug, Serialize)]
pub struct RecordResponse {
    pub tenant_id: i64,
    pub sequence_id: u64,
    pub created_at: DateTime<Utc>,
}

/// Query parameters for context assembly.
#[derive(Debug, Deserialize)]
pub struct ContextQuery {
    /// Query text to retrieve context for.
    pub q: String,
    /// Optional budget override, clamped to the configured maximum.
    pub max_chars: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ContextResponse {
    pub context: String,
    pub source: ContextSource,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` or `degraded`; degraded means the last append failed.
    pub log: &'static str,
    /// Circuit state: `closed`, `open`, or `half_open`.
    pub index: &'static str,
}

// ============================================================================
// Handlers
// ============================================================================

/// Record one exchange. Returns 201 once the append is durable; the
/// index write happens in the background.
async fn record_exchange(
    State(state): State<AppState>,
    Path(tenant_id): Path<i64>,
    Json(new): Json<NewExchange>,
) -> Result<(StatusCode, Json<RecordResponse>)> {
    let exchange = state.context.record(tenant_id, new).await?;
    Ok((
        StatusCode::CREATED,
        Json(RecordResponse {
            tenant_id: exchange.tenant_id,
            sequence_id: exchange.sequence_id,
            created_at: exchange.created_at,
        }),
    ))
}

/// Assemble a context transcript for a query.
async fn get_context(
    State(state): State<AppState>,
    Path(tenant_id): Path<i64>,
    Query(params): Query<ContextQuery>,
) -> Result<Json<ContextResponse>> {
    let assembled = state
        .context
        .build_context(tenant_id, &params.q, params.max_chars)
        .await?;
    Ok(Json(ContextResponse {
        context: assembled.context,
        source: assembled.source,
    }))
}

/// Report log and index health. The endpoint itself always answers;
/// a degraded dependency shows up in the body, not as a 5xx.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let health = state.context.health();
    Json(HealthResponse {
        log: if health.log_ok { "ok" } else { "degraded" },
        index: health.circuit.as_str(),
    })
}
