// =============================================================================
// Adjustment Store — copy-on-write cache of the adjustment table
// =============================================================================
//
// Readers look up the current map under a short read lock. A refresh fetches
// the whole table without holding any lock and then swaps the `Arc`, so a
// reader sees either the old map or the new one, never a mix.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use super::source::{AdjustmentMap, AdjustmentSource};

pub struct AdjustmentStore {
    current: RwLock<Arc<AdjustmentMap>>,
    last_refresh_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

impl AdjustmentStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(AdjustmentMap::new())),
            last_refresh_at: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    /// Adjustment for `symbol`, or 0.0 when none is configured.
    pub fn get(&self, symbol: &str) -> f64 {
        self.current.read().get(symbol).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn last_refresh_at(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh_at.read()
    }

    /// Error from the most recent refresh, cleared by the next success.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Replace the whole mapping. Rows absent from `map` disappear.
    pub fn replace(&self, map: AdjustmentMap) {
        *self.current.write() = Arc::new(map);
    }

    /// Fetch the full table and swap it in. On failure the previous mapping
    /// stays in place and the error is returned.
    pub async fn refresh(&self, source: &dyn AdjustmentSource) -> Result<usize> {
        match source.fetch_all().await {
            Ok(map) => {
                let count = map.len();
                self.replace(map);
                *self.last_refresh_at.write() = Some(Utc::now());
                *self.last_error.write() = None;
                info!(count, "adjustments updated");
                Ok(count)
            }
            Err(e) => {
                *self.last_error.write() = Some(format!("{e:#}"));
                warn!(error = %e, "error fetching adjustments, keeping previous snapshot");
                Err(e)
            }
        }
    }
}

impl Default for AdjustmentStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Refresh every `period`, forever. The first refresh is expected to have
/// run already at startup, so this waits one full period before the first
/// fetch. `on_error` is called with each failure.
pub async fn run_refresh_loop<F>(
    store: Arc<AdjustmentStore>,
    source: Arc<dyn AdjustmentSource>,
    period: Duration,
    on_error: F,
) where
    F: Fn(&anyhow::Error) + Send,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // `interval` fires immediately on the first tick.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = store.refresh(source.as_ref()).await {
            on_error(&e);
        }
    }
}
