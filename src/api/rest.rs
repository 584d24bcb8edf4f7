// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Pull queries against the latest snapshot, plus a health endpoint. The push
// WebSocket is mounted on the same router at `/` and `/ws`.
//
// CORS is configured permissively; the relay serves public market prices.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::{AppState, ErrorRecord};
use crate::broadcast::QueryError;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Pull queries ────────────────────────────────────────────
        .route("/price/:symbol", get(price))
        .route("/prices", get(prices))
        .route("/prices/full", get(prices_full))
        // ── Status ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Push ────────────────────────────────────────────────────
        .route("/", get(crate::api::ws::ws_handler))
        .route("/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Prices
// =============================================================================

#[derive(Serialize)]
struct PriceResponse {
    status: &'static str,
    symbol: String,
    price: f64,
}

#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    message: &'static str,
}

async fn price(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let symbol = symbol.to_lowercase();
    match state.broadcaster.get_price(&symbol) {
        Ok(price) => Json(PriceResponse {
            status: "success",
            symbol,
            price,
        })
        .into_response(),
        Err(QueryError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                status: "error",
                message: "Symbol not found",
            }),
        )
            .into_response(),
    }
}

async fn prices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "success",
        "prices": state.broadcaster.get_all_adjusted_prices(),
    }))
}

async fn prices_full(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "success",
        "prices": state.broadcaster.get_all_prices(),
    }))
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    /// `"ok"` while the feed is usable, `"degraded"` once it has given up.
    status: &'static str,
    feed_state: String,
    symbols_configured: Vec<String>,
    symbols_tracked: usize,
    subscribers: usize,
    adjustments: usize,
    last_adjustment_refresh: Option<String>,
    last_adjustment_error: Option<String>,
    state_version: u64,
    recent_errors: Vec<ErrorRecord>,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let feed_state = state.feed_state();
    let status = if feed_state == crate::types::FeedState::Failed {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        feed_state: feed_state.to_string(),
        symbols_configured: state.runtime_config.feed_symbols(),
        symbols_tracked: state.aggregator.len(),
        subscribers: state.broadcaster.subscriber_count(),
        adjustments: state.adjustments.len(),
        last_adjustment_refresh: state.adjustments.last_refresh_at().map(|t| t.to_rfc3339()),
        last_adjustment_error: state.adjustments.last_error(),
        state_version: state.current_state_version(),
        recent_errors: state.recent_errors.read().clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Tests
// =============================================================================
