// =============================================================================
// Symbol Aggregator — running intraday statistics per symbol
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{ClosedCandle, DerivedTick};

/// Running statistics for one symbol since the first closed candle seen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolHistory {
    /// Open of the first closed candle. Never changes afterwards.
    pub anchor_price: f64,
    pub last_price: f64,
    pub high: f64,
    pub low: f64,
    pub cumulative_volume: f64,
}

impl SymbolHistory {
    fn from_candle(candle: &ClosedCandle) -> Self {
        Self {
            anchor_price: candle.open,
            last_price: candle.close,
            high: candle.high,
            low: candle.low,
            cumulative_volume: candle.volume,
        }
    }

    fn extend(&mut self, candle: &ClosedCandle) {
        self.last_price = candle.close;
        self.high = self.high.max(candle.high);
        self.low = self.low.min(candle.low);
        self.cumulative_volume += candle.volume;
    }

    fn tick(&self, symbol: &str, event_time: i64) -> DerivedTick {
        let change = self.last_price - self.anchor_price;
        DerivedTick {
            symbol: symbol.to_string(),
            last_price: self.last_price,
            change,
            change_pct: change / self.anchor_price * 100.0,
            high: self.high,
            low: self.low,
            volume: self.cumulative_volume,
            event_time,
        }
    }
}

/// Per-symbol histories. Written only by the ingestion task.
pub struct SymbolAggregator {
    histories: RwLock<HashMap<String, SymbolHistory>>,
}

impl SymbolAggregator {
    pub fn new() -> Self {
        Self {
            histories: RwLock::new(HashMap::new()),
        }
    }

    /// Fold a closed candle into its symbol's history and return the
    /// resulting tick.
    pub fn on_closed_candle(&self, candle: &ClosedCandle) -> DerivedTick {
        let mut map = self.histories.write();
        match map.get_mut(&candle.symbol) {
            Some(history) => {
                history.extend(candle);
                history.tick(&candle.symbol, candle.event_time)
            }
            None => {
                let history = SymbolHistory::from_candle(candle);
                let tick = history.tick(&candle.symbol, candle.event_time);
                map.insert(candle.symbol.clone(), history);
                tick
            }
        }
    }

    #[cfg(test)]
    pub fn history(&self, symbol: &str) -> Option<SymbolHistory> {
        self.histories.read().get(symbol).cloned()
    }

    /// Number of symbols seen so far.
    pub fn len(&self) -> usize {
        self.histories.read().len()
    }
}

impl Default for SymbolAggregator {
    fn default() -> Self {
        Self::new()
    }
}
