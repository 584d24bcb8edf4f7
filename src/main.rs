// =============================================================================
// Price Relay — Main Entry Point
// =============================================================================
//
// Ingests Binance 1s klines, aggregates intraday stats per symbol, overlays
// operator adjustments from the database and republishes the result over
// HTTP and WebSocket.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod adjustments;
mod api;
mod app_state;
mod broadcast;
mod market_data;
mod pricing;
mod runtime_config;
mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::adjustments::{AdjustmentSource, MySqlAdjustmentSource};
use crate::app_state::AppState;
use crate::market_data::{FeedConnector, TungsteniteTransport};
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "relay_config.json";

/// Candles buffered between the connector and the ingestion task.
const CANDLE_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Price relay starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    if let Ok(syms) = std::env::var("RELAY_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(addr) = std::env::var("RELAY_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.database_url = Some(url);
    }

    let symbols = config.feed_symbols();
    info!(symbols = ?symbols, "Configured symbols");

    // ── 2. Feed connector & shared state ─────────────────────────────────
    let connector = FeedConnector::new(
        &config.stream_base_url,
        &symbols,
        &config.quote_asset,
        config.reconnect_delay(),
        config.max_reconnect_attempts,
    );
    let state = Arc::new(AppState::new(config.clone(), connector.state_handle()));

    // ── 3. Adjustments: initial load, then periodic refresh ──────────────
    let source: Option<Arc<dyn AdjustmentSource>> = match config.database_url.as_deref() {
        Some(url) => match MySqlAdjustmentSource::connect_lazy(url, &config.adjustment_table) {
            Ok(src) => Some(Arc::new(src)),
            Err(e) => {
                error!(error = %e, "Adjustment source unavailable — adjustments default to 0");
                state.push_error("adjustments", format!("{e:#}"));
                None
            }
        },
        None => {
            warn!("DATABASE_URL not set — adjustments default to 0");
            None
        }
    };

    if let Some(source) = source {
        if let Err(e) = state.adjustments.refresh(source.as_ref()).await {
            state.push_error("adjustments", format!("{e:#}"));
        }

        let refresh_state = state.clone();
        tokio::spawn(adjustments::run_refresh_loop(
            state.adjustments.clone(),
            source,
            config.adjustment_refresh_interval(),
            move |e| refresh_state.push_error("adjustments", format!("{e:#}")),
        ));
    }

    // ── 4. Ingestion pipeline ────────────────────────────────────────────
    let (candle_tx, candle_rx) = mpsc::channel(CANDLE_CHANNEL_CAPACITY);
    tokio::spawn(app_state::run_ingestion(state.clone(), candle_rx));

    let feed_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = connector.run(&TungsteniteTransport, candle_tx).await {
            error!(error = %e, "Upstream feed stopped — prices are now stale");
            feed_state.push_error("feed", e.to_string());
        }
    });

    // ── 5. API server ────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "HTTP and WebSocket server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");

    Ok(())
}
