// =============================================================================
// Central Application State — Price Relay
// =============================================================================
//
// Ties the pipeline components together:
//
//   FeedConnector ──mpsc──> ingestion task ──> SymbolAggregator
//                                          ──> PriceMerger (reads AdjustmentStore)
//                                          ──> Broadcaster ──> subscribers
//
// The ingestion task is the only writer of histories and published prices.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::adjustments::AdjustmentStore;
use crate::broadcast::Broadcaster;
use crate::market_data::SymbolAggregator;
use crate::pricing::PriceMerger;
use crate::runtime_config::RuntimeConfig;
use crate::types::{is_stablecoin, ClosedCandle, FeedState, PublishedPrice};

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Which subsystem raised it, e.g. `"feed"` or `"adjustments"`.
    pub source: &'static str,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

// =============================================================================
// AppState
// =============================================================================

pub struct AppState {
    /// Incremented once per published update.
    pub state_version: AtomicU64,

    pub runtime_config: RuntimeConfig,

    pub aggregator: Arc<SymbolAggregator>,
    pub adjustments: Arc<AdjustmentStore>,
    pub merger: Arc<PriceMerger>,
    pub broadcaster: Arc<Broadcaster>,

    /// Upstream connection state, shared with the `FeedConnector`.
    pub feed_state: Arc<RwLock<FeedState>>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig, feed_state: Arc<RwLock<FeedState>>) -> Self {
        let adjustments = Arc::new(AdjustmentStore::new());
        let merger = Arc::new(PriceMerger::new(adjustments.clone()));
        let broadcaster = Arc::new(Broadcaster::new(
            merger.clone(),
            config.subscriber_queue_capacity,
        ));

        Self {
            state_version: AtomicU64::new(0),
            runtime_config: config,
            aggregator: Arc::new(SymbolAggregator::new()),
            adjustments,
            merger,
            broadcaster,
            feed_state,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn feed_state(&self) -> FeedState {
        *self.feed_state.read()
    }

    // ── Pipeline ────────────────────────────────────────────────────────

    /// One update cycle: aggregate, merge, push. Stablecoin candles are
    /// ignored.
    pub fn apply_candle(&self, candle: &ClosedCandle) -> Option<PublishedPrice> {
        if is_stablecoin(&candle.symbol) {
            return None;
        }

        let tick = self.aggregator.on_closed_candle(candle);
        let published = self.merger.on_derived_tick(&tick);
        self.state_version.fetch_add(1, Ordering::SeqCst);

        let delivered = self.broadcaster.publish_update();
        debug!(
            symbol = %tick.symbol,
            price = published.adjusted_price,
            subscribers = delivered,
            "price update published"
        );
        Some(published)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message. The ring buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted first.
    pub fn push_error(&self, source: &'static str, msg: String) {
        let record = ErrorRecord {
            message: msg,
            source,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }
}

/// Consume closed candles until the connector side of the channel is gone.
pub async fn run_ingestion(state: Arc<AppState>, mut candles: mpsc::Receiver<ClosedCandle>) {
    while let Some(candle) = candles.recv().await {
        state.apply_candle(&candle);
    }
    info!("candle channel closed, ingestion stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(
            RuntimeConfig::default(),
            Arc::new(RwLock::new(FeedState::Disconnected)),
        )
    }

    fn candle(symbol: &str, open: f64, close: f64) -> ClosedCandle {
        ClosedCandle {
            symbol: symbol.into(),
            open,
            high: open.max(close) + 3.0,
            low: open.min(close) - 5.0,
            close,
            volume: 10.0,
            event_time: 1_700_000_000_000,
        }
    }

    #[test]
    fn end_to_end_adjusted_record() {
        let state = state();
        state
            .adjustments
            .replace([("BTC".to_string(), 2.0)].into_iter().collect());

        let published = state.apply_candle(&candle("BTC", 100.0, 102.0)).unwrap();

        assert_eq!(published.base_price, 102.0);
        assert_eq!(published.adjusted_price, 104.0);
        assert_eq!(published.price_change, 4.0);
        assert!((published.price_change_pct - 4.0).abs() < 1e-12);
        assert_eq!(published.adjustment, 2.0);
        assert_eq!(published.timestamp, 1_700_000_000_000);
        assert_eq!(state.current_state_version(), 1);
    }

    #[test]
    fn stablecoin_candles_bypass_pipeline() {
        let state = state();
        assert!(state.apply_candle(&candle("DAI", 1.0, 0.999)).is_none());
        assert!(state.aggregator.history("DAI").is_none());
        assert_eq!(state.broadcaster.get_price("dai"), Ok(1.00));
        assert_eq!(state.current_state_version(), 0);
    }

    #[tokio::test]
    async fn each_update_is_pushed_to_subscribers() {
        let state = state();
        let mut sub = state.broadcaster.subscribe();
        let _initial = sub.rx.recv().await.unwrap();

        state.apply_candle(&candle("ETH", 2000.0, 2010.0));
        let msg: serde_json::Value = serde_json::from_str(&sub.rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "price_update");
        assert_eq!(msg["data"]["ETH"]["price"], 2010.0);
    }

    #[tokio::test]
    async fn ingestion_drains_channel() {
        let state = Arc::new(state());
        let (tx, rx) = mpsc::channel(4);
        tx.send(candle("BTC", 100.0, 101.0)).await.unwrap();
        tx.send(candle("BTC", 101.0, 103.0)).await.unwrap();
        drop(tx);

        run_ingestion(state.clone(), rx).await;

        let history = state.aggregator.history("BTC").unwrap();
        assert_eq!(history.anchor_price, 100.0);
        assert_eq!(history.last_price, 103.0);
        assert_eq!(history.cumulative_volume, 20.0);
        assert_eq!(state.broadcaster.get_price("BTC"), Ok(103.0));
    }

    #[test]
    fn error_ring_is_capped() {
        let state = state();
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            state.push_error("feed", format!("e{i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, "e5");
    }
}
