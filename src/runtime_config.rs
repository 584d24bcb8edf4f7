// =============================================================================
// Runtime Configuration — relay settings loaded once at startup
// =============================================================================
//
// All fields carry `#[serde(default)]` so that a partial (or empty) JSON file
// still loads. Environment overrides are applied by `main.rs` after loading.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{canonical_symbol, is_stablecoin};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    [
        "BTC", "ETH", "SOL", "BNB", "TRX", "DOGE", "ADA", "XRP", "AVAX", "MATIC", "DOT",
        "SHIB", "LINK", "LTC", "UNI", "BCH", "XLM",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_stream_base_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_adjustment_refresh_secs() -> u64 {
    60
}

fn default_adjustment_table() -> String {
    "admin_adjustment".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_subscriber_queue_capacity() -> usize {
    64
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Feed ---------------------------------------------------------------

    /// Base tickers to track (without the quote asset), e.g. `"BTC"`.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Quote asset appended to each ticker to form the upstream pair.
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    /// Scheme + host + port of the combined-stream endpoint.
    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,

    /// Fixed delay between reconnect attempts.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Reconnect attempts allowed after a failure before the feed gives up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    // --- Adjustments --------------------------------------------------------

    /// Interval between adjustment table refreshes.
    #[serde(default = "default_adjustment_refresh_secs")]
    pub adjustment_refresh_secs: u64,

    /// Table holding `coin_symbol` / `adjustment_amount` rows.
    #[serde(default = "default_adjustment_table")]
    pub adjustment_table: String,

    /// MySQL connection string. Without it every adjustment is 0.
    #[serde(default)]
    pub database_url: Option<String>,

    // --- Server -------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Pending pushes buffered per subscriber before updates are skipped.
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            quote_asset: default_quote_asset(),
            stream_base_url: default_stream_base_url(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            adjustment_refresh_secs: default_adjustment_refresh_secs(),
            adjustment_table: default_adjustment_table(),
            database_url: None,
            bind_addr: default_bind_addr(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Tickers that go upstream: canonicalised, deduplicated, stablecoins
    /// removed.
    pub fn feed_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.symbols.len());
        for sym in self.symbols.iter().map(|s| canonical_symbol(s)) {
            if sym.is_empty() || is_stablecoin(&sym) || out.contains(&sym) {
                continue;
            }
            out.push(sym);
        }
        out
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn adjustment_refresh_interval(&self) -> Duration {
        // A zero period would make `tokio::time::interval` panic.
        Duration::from_secs(self.adjustment_refresh_secs.max(1))
    }
}
