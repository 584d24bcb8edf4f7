// =============================================================================
// Broadcaster — subscriber registry, snapshot fan-out and pull queries
// =============================================================================
//
// Every subscriber owns a bounded queue. Pushes are serialised once and
// offered to each queue with `try_send`, so one stalled connection never
// delays the others:
//   - queue closed -> subscriber removed;
//   - queue full   -> this update is skipped for that subscriber only. Every
//     message is a full snapshot, so the next one supersedes it.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pricing::PriceMerger;
use crate::types::{canonical_symbol, is_stablecoin, PublishedPrice, STABLECOIN_PRICE};

#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("symbol not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    InitialPrices,
    PriceUpdate,
}

#[derive(Serialize)]
struct PushMessage<'a> {
    #[serde(rename = "type")]
    kind: PushKind,
    data: &'a BTreeMap<String, PublishedPrice>,
}

/// Receiving end handed to a connection task.
pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<Arc<str>>,
}

pub struct Broadcaster {
    merger: Arc<PriceMerger>,
    subscribers: RwLock<HashMap<Uuid, mpsc::Sender<Arc<str>>>>,
    queue_capacity: usize,
}

impl Broadcaster {
    pub fn new(merger: Arc<PriceMerger>, queue_capacity: usize) -> Self {
        Self {
            merger,
            subscribers: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    // ── Push side ───────────────────────────────────────────────────────

    /// Register a subscriber. Its queue already holds the initial snapshot,
    /// ahead of any update published afterwards.
    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let mut subs = self.subscribers.write();
        if let Some(initial) = self.encode(PushKind::InitialPrices) {
            // Fresh queue with capacity >= 1; cannot be full.
            let _ = tx.try_send(initial);
        }
        subs.insert(id, tx);
        info!(subscriber = %id, total = subs.len(), "subscriber connected");

        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        let mut subs = self.subscribers.write();
        if subs.remove(&id).is_some() {
            info!(subscriber = %id, total = subs.len(), "subscriber disconnected");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Push the full current snapshot to every subscriber. Returns how many
    /// queues accepted it.
    pub fn publish_update(&self) -> usize {
        let Some(payload) = self.encode(PushKind::PriceUpdate) else {
            return 0;
        };

        let mut delivered = 0;
        let mut gone = Vec::new();
        {
            let subs = self.subscribers.read();
            for (id, tx) in subs.iter() {
                match tx.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        debug!(subscriber = %id, "subscriber queue full, skipping update");
                    }
                    Err(TrySendError::Closed(_)) => gone.push(*id),
                }
            }
        }

        if !gone.is_empty() {
            let mut subs = self.subscribers.write();
            for id in gone {
                subs.remove(&id);
                info!(subscriber = %id, "dropping closed subscriber");
            }
        }

        delivered
    }

    fn encode(&self, kind: PushKind) -> Option<Arc<str>> {
        let data = self.merger.snapshot();
        match serde_json::to_string(&PushMessage { kind, data: &data }) {
            Ok(json) => Some(json.into()),
            Err(e) => {
                warn!(error = %e, "failed to serialize price snapshot");
                None
            }
        }
    }

    // ── Pull side ───────────────────────────────────────────────────────

    /// Adjusted price for `symbol`, case-insensitive. Stablecoins are always
    /// 1.00.
    pub fn get_price(&self, symbol: &str) -> Result<f64, QueryError> {
        if is_stablecoin(symbol) {
            return Ok(STABLECOIN_PRICE);
        }
        let key = canonical_symbol(symbol);
        self.merger
            .get(&key)
            .map(|p| p.adjusted_price)
            .ok_or(QueryError::NotFound(key))
    }

    pub fn get_all_prices(&self) -> BTreeMap<String, PublishedPrice> {
        self.merger.snapshot()
    }

    pub fn get_all_adjusted_prices(&self) -> BTreeMap<String, f64> {
        self.merger.adjusted_prices()
    }
}
