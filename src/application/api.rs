//! Read-only monitoring surface.
//!
//! Serves the store's queries as JSON for dashboards: per-symbol state,
//! active orders, recent fills and events, daily P&L, overall trade
//! statistics, and the per-symbol performance breakdown. No endpoint mutates
//! anything; the bot does not take commands over HTTP.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::error;

use crate::config::BotConfig;
use crate::persistence::repository::Store;
use crate::persistence::DatabaseError;

use super::services::performance::PerformanceTracker;

const MAX_FILLS: i64 = 200;
const MAX_EVENTS: i64 = 200;
const MAX_DAILY: i64 = 90;

#[derive(Clone)]
pub struct ApiState {
    store: Store,
    config: Arc<BotConfig>,
    started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(store: Store, config: Arc<BotConfig>) -> Self {
        Self {
            store,
            config,
            started_at: Utc::now(),
        }
    }
}

/// Build the monitoring router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/orders/active", get(active_orders))
        .route("/api/fills", get(recent_fills))
        .route("/api/events", get(recent_events))
        .route("/api/performance/daily", get(daily_pnl))
        .route("/api/performance/summary", get(summary))
        .route("/api/performance/symbols", get(symbol_performance))
        .with_state(state)
}

struct ApiError(DatabaseError);

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "monitoring query failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<i64>,
}

impl LimitParams {
    fn clamped(&self, default: i64, max: i64) -> i64 {
        self.limit.unwrap_or(default).clamp(1, max)
    }
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "running",
        "mode": format!("{:?}", state.config.mode).to_lowercase(),
        "started_at": state.started_at.to_rfc3339(),
        "symbols": state.config.symbols().len(),
    }))
}

/// Per-symbol controller state as persisted. Broker truth lives at the
/// broker; this reflects what the bot has committed.
async fn status(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    let now = Utc::now();
    let states = state.store.all_states().await?;
    let rows: Vec<serde_json::Value> = states
        .iter()
        .map(|s| {
            serde_json::json!({
                "symbol": s.symbol,
                "in_cooldown": s.in_cooldown(now),
                "cooldown_until": s.cooldown_until.map(|t| t.to_rfc3339()),
                "last_parent_id": s.last_parent_id,
                "last_trail_id": s.last_trail_id,
                "updated_at": s.updated_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "symbols": rows })))
}

async fn active_orders(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let orders = state.store.active_orders(None).await?;
    Ok(Json(serde_json::json!({ "orders": orders })))
}

async fn recent_fills(
    State(state): State<ApiState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let fills = state
        .store
        .recent_fills(params.clamped(50, MAX_FILLS))
        .await?;
    Ok(Json(serde_json::json!({ "fills": fills })))
}

async fn recent_events(
    State(state): State<ApiState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let events = state
        .store
        .recent_events(params.clamped(50, MAX_EVENTS))
        .await?;
    let rows: Vec<serde_json::Value> = events
        .iter()
        .map(|e| {
            serde_json::json!({
                "id": e.id,
                "event_type": e.event_type,
                "symbol": e.symbol,
                "payload": e.payload(),
                "ts": e.ts.to_rfc3339(),
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "events": rows })))
}

async fn daily_pnl(
    State(state): State<ApiState>,
    Query(params): Query<LimitParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshots = state
        .store
        .recent_snapshots(params.clamped(30, MAX_DAILY))
        .await?;
    Ok(Json(serde_json::json!({ "snapshots": snapshots })))
}

async fn summary(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    let tracker = PerformanceTracker::new(state.store.clone());
    let stats = tracker.trade_statistics().await?;
    Ok(Json(serde_json::json!({ "statistics": stats })))
}

async fn symbol_performance(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tracker = PerformanceTracker::new(state.store.clone());
    let by_symbol = tracker.symbol_breakdown().await?;
    Ok(Json(serde_json::json!({ "symbols": by_symbol })))
}
