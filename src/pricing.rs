// =============================================================================
// Price Merger — overlays the current adjustment onto derived ticks
// =============================================================================
//
// Holds the latest published record per symbol. Records are built completely
// before the write lock is taken, so readers see a whole record or none.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::adjustments::AdjustmentStore;
use crate::types::{DerivedTick, PublishedPrice};

pub struct PriceMerger {
    adjustments: Arc<AdjustmentStore>,
    prices: RwLock<HashMap<String, PublishedPrice>>,
}

impl PriceMerger {
    pub fn new(adjustments: Arc<AdjustmentStore>) -> Self {
        Self {
            adjustments,
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Apply the symbol's adjustment to `tick`, store and return the result.
    pub fn on_derived_tick(&self, tick: &DerivedTick) -> PublishedPrice {
        let adjustment = self.adjustments.get(&tick.symbol);
        let published = merge(tick, adjustment);
        self.prices
            .write()
            .insert(tick.symbol.clone(), published.clone());
        published
    }

    pub fn get(&self, symbol: &str) -> Option<PublishedPrice> {
        self.prices.read().get(symbol).cloned()
    }

    /// All records, ordered by symbol.
    pub fn snapshot(&self) -> BTreeMap<String, PublishedPrice> {
        self.prices
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Adjusted price only, per symbol.
    pub fn adjusted_prices(&self) -> BTreeMap<String, f64> {
        self.prices
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.adjusted_price))
            .collect()
    }
}

/// The change figures are taken against the unadjusted anchor implied by the
/// tick (`last_price - change`), so `price_change` includes the adjustment.
fn merge(tick: &DerivedTick, adjustment: f64) -> PublishedPrice {
    let adjusted_price = tick.last_price + adjustment;
    let implied_anchor = tick.last_price - tick.change;

    let price_change = adjusted_price - implied_anchor;
    let price_change_pct = if implied_anchor != 0.0 {
        price_change / implied_anchor * 100.0
    } else {
        0.0
    };

    PublishedPrice {
        adjusted_price,
        base_price: tick.last_price,
        price_change,
        price_change_pct,
        adjustment,
        timestamp: tick.event_time,
    }
}
