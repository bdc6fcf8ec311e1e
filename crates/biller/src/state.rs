//! Purchase state: what the session has granted so far.
//!
//! Read-only to the host. The reconciler is the only writer.
//!
//! Consumed events are delivered to every subscriber through its own unbounded queue. A
//! consumption has already happened on the backend when the event is published, so a slow
//! subscriber must never lose one.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::{mpsc, watch};

/// One successful consumption. A consumable can be bought and consumed repeatedly, so these are
/// events rather than set members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedEvent {
    pub offer_id: String,
    pub token: String,
}

pub struct PurchaseState {
    acknowledged: watch::Sender<BTreeSet<String>>,
    consumed: Mutex<Vec<mpsc::UnboundedSender<ConsumedEvent>>>,
}

impl PurchaseState {
    pub fn new() -> Self {
        let (acknowledged, _) = watch::channel(BTreeSet::new());
        Self {
            acknowledged,
            consumed: Mutex::new(Vec::new()),
        }
    }

    /// Ids of acknowledged offers. Only grows during a session.
    pub fn acknowledged(&self) -> BTreeSet<String> {
        self.acknowledged.borrow().clone()
    }

    pub fn is_acknowledged(&self, offer_id: &str) -> bool {
        self.acknowledged.borrow().contains(offer_id)
    }

    /// Replay-latest receiver of the acknowledged set.
    pub fn watch_acknowledged(&self) -> watch::Receiver<BTreeSet<String>> {
        self.acknowledged.subscribe()
    }

    /// Consumed events published after this call, in order. No replay, no loss.
    pub fn subscribe_consumed(&self) -> mpsc::UnboundedReceiver<ConsumedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumed.lock().push(tx);
        rx
    }

    /// Returns true if the offer was not in the set yet.
    pub(crate) fn add_acknowledged(&self, offer_id: &str) -> bool {
        self.acknowledged.send_if_modified(|set| set.insert(offer_id.to_string()))
    }

    pub(crate) fn push_consumed(&self, event: ConsumedEvent) {
        tracing::info!(offer_id = %event.offer_id, "offer consumed");
        // Dropped receivers are forgotten; nobody listening is fine.
        self.consumed.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for PurchaseState {
    fn default() -> Self {
        Self::new()
    }
}
