// =============================================================================
// Shared types used across the price relay
// =============================================================================

use serde::{Deserialize, Serialize};

/// Symbols that are pinned to 1.00 and never touch the feed or adjustments.
pub const STABLECOINS: &[&str] = &["USDT", "DAI"];

/// Price reported for every entry in [`STABLECOINS`].
pub const STABLECOIN_PRICE: f64 = 1.00;

/// Returns `true` for a stablecoin ticker, in any letter case.
pub fn is_stablecoin(symbol: &str) -> bool {
    STABLECOINS
        .iter()
        .any(|s| s.eq_ignore_ascii_case(symbol))
}

/// Canonical form of a base ticker: trimmed and uppercased.
pub fn canonical_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// A finalized 1-second candle for one symbol, as admitted from the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedCandle {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Upstream event time, epoch milliseconds.
    pub event_time: i64,
}

/// Intraday statistics derived from the running history of one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedTick {
    pub symbol: String,
    pub last_price: f64,
    /// `last_price - anchor_price`.
    pub change: f64,
    pub change_pct: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub event_time: i64,
}

/// The externally visible price record for one symbol.
///
/// Field names on the wire follow what subscribers expect (`price` is the
/// adjusted price).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedPrice {
    #[serde(rename = "price")]
    pub adjusted_price: f64,
    pub base_price: f64,
    pub price_change: f64,
    #[serde(rename = "priceChangePercent")]
    pub price_change_pct: f64,
    pub adjustment: f64,
    pub timestamp: i64,
}

/// Connection state of the upstream feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "attempt")]
pub enum FeedState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closed,
    Errored,
    /// Waiting before reconnect attempt `n`.
    Backoff(u32),
    /// Retries exhausted; the connector will not try again.
    Failed,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Closed => write!(f, "Closed"),
            Self::Errored => write!(f, "Errored"),
            Self::Backoff(n) => write!(f, "Backoff({n})"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}
