//! Reconciler: settles purchase records into acknowledged offers and consumed events.
//!
//! Push-delivered updates and sweeps go through [Reconciler::reconcile]. Dedup key is the
//! purchase token. Before any backend call a token is claimed in the ledger; a token that is
//! already settled this session, or currently claimed by a concurrent reconcile, is not sent to
//! the backend again. A failed call releases the claim and records nothing, so the next update
//! or sweep retries it.
//!
//! Settled tokens are forgotten once two consecutive complete sweeps, neither overlapping
//! another sweep, no longer see them on the backend.

use crate::backend::BillingBackend;
use crate::catalog::OfferCatalog;
use crate::offer::{Offer, OfferKind, OfferType};
use crate::purchase::{PurchaseRecord, PurchaseStatus, PurchaseUpdate};
use crate::state::{ConsumedEvent, PurchaseState};
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// What one [Reconciler::reconcile] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Offer ids confirmed acknowledged (newly or already settled).
    pub acknowledged: Vec<String>,
    /// Tokens consumed by this call.
    pub consumed: Vec<String>,
    /// Tokens still pending on the backend.
    pub pending: Vec<String>,
    /// Offer ids not in the catalog.
    pub unknown: Vec<String>,
    /// Tokens whose acknowledge/consume call failed.
    pub failed: Vec<String>,
    /// Tokens not sent to the backend: already settled, in flight elsewhere, or repeated in the batch.
    pub skipped: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

enum Outcome {
    Acknowledged(String),
    Consumed(String),
    Pending(String),
    Unknown(String),
    Failed(String),
    Skipped(String),
    Ignored,
}

#[derive(Default)]
struct TokenLedger {
    in_flight: HashSet<String>,
    /// Token -> last sweep generation that saw it (or that was current when it settled).
    settled: HashMap<String, u64>,
    /// Complete, non-overlapping sweeps so far.
    generation: u64,
    sweeps_started: u64,
    sweeps_running: usize,
}

impl TokenLedger {
    fn settle(&mut self, token: &str) {
        let generation = self.generation;
        self.settled.insert(token.to_string(), generation);
    }

    /// Records a complete sweep that saw `seen`, then drops settled tokens missing from this
    /// sweep and the previous one.
    fn advance(&mut self, seen: &HashSet<String>) -> usize {
        self.generation += 1;
        let generation = self.generation;
        let before = self.settled.len();
        self.settled.retain(|token, last_seen| {
            if seen.contains(token) {
                *last_seen = generation;
            }
            *last_seen + 1 >= generation
        });
        before - self.settled.len()
    }
}

enum Claim<'a> {
    Settled,
    InFlight,
    Claimed(ClaimGuard<'a>),
}

/// Releases an in-flight claim on drop, including when the reconcile future is cancelled
/// mid-call. Marks the token settled only if [ClaimGuard::settle] was called.
struct ClaimGuard<'a> {
    ledger: &'a Mutex<TokenLedger>,
    token: String,
    settled: bool,
}

impl ClaimGuard<'_> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        let mut ledger = self.ledger.lock();
        ledger.in_flight.remove(&self.token);
        if self.settled {
            ledger.settle(&self.token);
        }
    }
}

/// Counts a running sweep so overlapping sweeps never prune the ledger.
struct SweepGuard<'a> {
    ledger: &'a Mutex<TokenLedger>,
    started: u64,
    alone: bool,
}

impl<'a> SweepGuard<'a> {
    fn begin(ledger: &'a Mutex<TokenLedger>) -> Self {
        let mut l = ledger.lock();
        l.sweeps_started += 1;
        let alone = l.sweeps_running == 0;
        l.sweeps_running += 1;
        Self {
            ledger,
            started: l.sweeps_started,
            alone,
        }
    }

    /// Prunes the ledger if no other sweep overlapped this one.
    fn complete(&self, seen: &HashSet<String>) {
        let mut l = self.ledger.lock();
        if self.alone && l.sweeps_running == 1 && l.sweeps_started == self.started {
            let pruned = l.advance(seen);
            if pruned > 0 {
                tracing::debug!(pruned, remaining = l.settled.len(), "settled tokens pruned");
            }
        }
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.ledger.lock().sweeps_running -= 1;
    }
}

pub struct Reconciler<B: BillingBackend> {
    backend: Arc<B>,
    catalog: Arc<OfferCatalog>,
    state: Arc<PurchaseState>,
    ledger: Mutex<TokenLedger>,
}

impl<B: BillingBackend> Reconciler<B> {
    pub fn new(backend: Arc<B>, catalog: Arc<OfferCatalog>, state: Arc<PurchaseState>) -> Self {
        Self {
            backend,
            catalog,
            state,
            ledger: Mutex::new(TokenLedger::default()),
        }
    }

    /// Settles every record of a purchase update. Records with distinct tokens are settled
    /// concurrently; a token repeated within the batch is handled once.
    pub async fn reconcile(&self, update: &PurchaseUpdate) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if !update.is_settleable() {
            tracing::debug!(code = %update.code, "purchase update not settleable, ignored");
            return report;
        }

        let mut seen = HashSet::new();
        let mut batch = Vec::new();
        for record in update.records() {
            if seen.insert(record.token.as_str()) {
                batch.push(record);
            } else {
                report.skipped.push(record.token.clone());
            }
        }

        for outcome in join_all(batch.into_iter().map(|r| self.settle(r))).await {
            match outcome {
                Outcome::Acknowledged(id) => report.acknowledged.push(id),
                Outcome::Consumed(token) => report.consumed.push(token),
                Outcome::Pending(token) => report.pending.push(token),
                Outcome::Unknown(id) => report.unknown.push(id),
                Outcome::Failed(token) => report.failed.push(token),
                Outcome::Skipped(token) => report.skipped.push(token),
                Outcome::Ignored => {}
            }
        }
        if !report.is_empty() {
            tracing::info!(
                acknowledged = report.acknowledged.len(),
                consumed = report.consumed.len(),
                pending = report.pending.len(),
                unknown = report.unknown.len(),
                failed = report.failed.len(),
                skipped = report.skipped.len(),
                "purchases reconciled"
            );
        }
        report
    }

    /// Full sweep: queries outstanding purchases of both offer types and reconciles them.
    /// A failed query for one type does not stop the other.
    pub async fn reconcile_all(&self) -> ReconcileReport {
        let sweep = SweepGuard::begin(&self.ledger);
        let mut purchases = Vec::new();
        let mut complete = true;
        for offer_type in OfferType::ALL {
            let result = self.backend.query_purchases(offer_type).await;
            if !result.code.is_ok() {
                tracing::warn!(?offer_type, code = %result.code, "purchase query failed");
                complete = false;
                continue;
            }
            purchases.extend(result.purchases);
        }
        tracing::debug!(count = purchases.len(), "reconciliation sweep");
        let seen: HashSet<String> = purchases.iter().map(|r| r.token.clone()).collect();
        let report = self.reconcile(&PurchaseUpdate::ok(purchases)).await;
        if complete {
            sweep.complete(&seen);
        }
        report
    }

    #[cfg(test)]
    fn settled_len(&self) -> usize {
        self.ledger.lock().settled.len()
    }

    async fn settle(&self, record: &PurchaseRecord) -> Outcome {
        let Some(offer) = self.catalog.get(&record.offer_id) else {
            tracing::warn!(offer_id = %record.offer_id, "purchase for unknown offer discarded");
            return Outcome::Unknown(record.offer_id.clone());
        };
        match record.status {
            PurchaseStatus::Purchased => {}
            PurchaseStatus::Pending => {
                tracing::debug!(offer_id = %record.offer_id, "purchase pending, deferred");
                return Outcome::Pending(record.token.clone());
            }
            PurchaseStatus::Other => return Outcome::Ignored,
        }
        match offer.kind() {
            OfferKind::Acknowledgeable => self.acknowledge(offer, record).await,
            OfferKind::Consumable => self.consume(offer, record).await,
        }
    }

    async fn acknowledge(&self, offer: &Offer, record: &PurchaseRecord) -> Outcome {
        if record.acknowledged {
            self.ledger.lock().settle(&record.token);
            self.state.add_acknowledged(offer.id());
            return Outcome::Acknowledged(offer.id().to_string());
        }
        let mut guard = match self.claim(&record.token) {
            Claim::Settled => {
                self.state.add_acknowledged(offer.id());
                return Outcome::Acknowledged(offer.id().to_string());
            }
            Claim::InFlight => return Outcome::Skipped(record.token.clone()),
            Claim::Claimed(guard) => guard,
        };
        let code = self.backend.acknowledge(&record.token).await;
        if !code.is_ok() {
            tracing::warn!(offer_id = %offer.id(), %code, "acknowledge failed, left for next sweep");
            return Outcome::Failed(record.token.clone());
        }
        guard.settle();
        if self.state.add_acknowledged(offer.id()) {
            tracing::info!(offer_id = %offer.id(), "offer acknowledged");
        }
        Outcome::Acknowledged(offer.id().to_string())
    }

    /// A token settled earlier in this session is never consumed again, whichever path delivers
    /// it; repurchases arrive with fresh tokens.
    async fn consume(&self, offer: &Offer, record: &PurchaseRecord) -> Outcome {
        let mut guard = match self.claim(&record.token) {
            Claim::Settled | Claim::InFlight => return Outcome::Skipped(record.token.clone()),
            Claim::Claimed(guard) => guard,
        };
        let result = self.backend.consume(&record.token).await;
        if !result.code.is_ok() {
            tracing::warn!(offer_id = %offer.id(), code = %result.code, "consume failed, left for next sweep");
            return Outcome::Failed(record.token.clone());
        }
        guard.settle();
        self.state.push_consumed(ConsumedEvent {
            offer_id: offer.id().to_string(),
            token: record.token.clone(),
        });
        Outcome::Consumed(record.token.clone())
    }

    fn claim(&self, token: &str) -> Claim<'_> {
        let mut ledger = self.ledger.lock();
        if ledger.settled.contains_key(token) {
            return Claim::Settled;
        }
        if !ledger.in_flight.insert(token.to_string()) {
            return Claim::InFlight;
        }
        Claim::Claimed(ClaimGuard {
            ledger: &self.ledger,
            token: token.to_string(),
            settled: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ResponseCode;
    use crate::simulated::SimulatedBackend;

    fn setup() -> (Arc<SimulatedBackend>, Arc<PurchaseState>, Reconciler<SimulatedBackend>) {
        let backend = Arc::new(SimulatedBackend::new());
        let catalog = Arc::new(
            OfferCatalog::new([
                Offer::acknowledgeable("premium", OfferType::OneTime),
                Offer::acknowledgeable("pro_monthly", OfferType::Recurring),
                Offer::consumable("gem_pack_10"),
            ])
            .unwrap(),
        );
        let state = Arc::new(PurchaseState::new());
        let reconciler = Reconciler::new(Arc::clone(&backend), catalog, Arc::clone(&state));
        (backend, state, reconciler)
    }

    #[tokio::test]
    async fn acknowledges_once_across_deliveries() {
        let (backend, state, reconciler) = setup();
        let update = PurchaseUpdate::ok(vec![PurchaseRecord::purchased("premium", "t1")]);
        let first = reconciler.reconcile(&update).await;
        let second = reconciler.reconcile(&update).await;
        assert_eq!(first.acknowledged, vec!["premium".to_string()]);
        assert_eq!(second.acknowledged, vec!["premium".to_string()]);
        assert_eq!(backend.acknowledge_calls(), 1);
        assert!(state.is_acknowledged("premium"));
    }

    #[tokio::test]
    async fn already_acknowledged_flag_skips_backend() {
        let (backend, state, reconciler) = setup();
        let record = PurchaseRecord::purchased("pro_monthly", "t1").with_acknowledged(true);
        reconciler.reconcile(&PurchaseUpdate::ok(vec![record])).await;
        assert_eq!(backend.acknowledge_calls(), 0);
        assert!(state.is_acknowledged("pro_monthly"));
    }

    #[tokio::test]
    async fn repeated_token_in_batch_consumed_once() {
        let (backend, state, reconciler) = setup();
        let mut rx = state.subscribe_consumed();
        let record = PurchaseRecord::purchased("gem_pack_10", "t1");
        let report = reconciler
            .reconcile(&PurchaseUpdate::ok(vec![record.clone(), record]))
            .await;
        assert_eq!(report.consumed, vec!["t1".to_string()]);
        assert_eq!(report.skipped, vec!["t1".to_string()]);
        assert_eq!(backend.consume_calls(), 1);
        assert_eq!(rx.recv().await.unwrap().offer_id, "gem_pack_10");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_consume_is_retried_later() {
        let (backend, state, reconciler) = setup();
        let mut rx = state.subscribe_consumed();
        let update = PurchaseUpdate::ok(vec![PurchaseRecord::purchased("gem_pack_10", "t1")]);
        backend.fail_consume(1);
        let report = reconciler.reconcile(&update).await;
        assert_eq!(report.failed, vec!["t1".to_string()]);
        assert!(rx.try_recv().is_err());
        let report = reconciler.reconcile(&update).await;
        assert_eq!(report.consumed, vec!["t1".to_string()]);
        assert_eq!(backend.consume_calls(), 2);
        assert_eq!(rx.recv().await.unwrap().token, "t1");
    }

    #[tokio::test]
    async fn unknown_and_unsettleable_are_dropped() {
        let (backend, state, reconciler) = setup();
        let report = reconciler
            .reconcile(&PurchaseUpdate::ok(vec![PurchaseRecord::purchased("nope", "t1")]))
            .await;
        assert_eq!(report.unknown, vec!["nope".to_string()]);
        let canceled = PurchaseUpdate::new(
            ResponseCode::UserCanceled,
            Some(vec![PurchaseRecord::purchased("premium", "t2")]),
        );
        assert!(reconciler.reconcile(&canceled).await.is_empty());
        assert_eq!(backend.acknowledge_calls(), 0);
        assert!(state.acknowledged().is_empty());
    }

    #[tokio::test]
    async fn large_batch_delivers_every_consumed_event() {
        let (backend, state, reconciler) = setup();
        let mut rx = state.subscribe_consumed();
        let records: Vec<_> = (0..80)
            .map(|i| PurchaseRecord::purchased("gem_pack_10", format!("gems-{}", i)))
            .collect();
        let report = reconciler.reconcile(&PurchaseUpdate::ok(records)).await;
        assert_eq!(report.consumed.len(), 80);
        assert_eq!(backend.consume_calls(), 80);

        let mut tokens = HashSet::new();
        while let Ok(event) = rx.try_recv() {
            tokens.insert(event.token);
        }
        assert_eq!(tokens.len(), 80);
    }

    #[tokio::test]
    async fn sweeps_forget_tokens_gone_from_backend() {
        let (backend, _state, reconciler) = setup();
        backend.put_purchase(OfferType::OneTime, PurchaseRecord::purchased("premium", "t-premium"));
        backend.put_purchase(OfferType::OneTime, PurchaseRecord::purchased("gem_pack_10", "t-gems"));
        let report = reconciler.reconcile_all().await;
        assert_eq!(report.consumed, vec!["t-gems".to_string()]);
        assert_eq!(reconciler.settled_len(), 2);

        // Consumed token is gone from the backend; kept for one more sweep, then dropped.
        reconciler.reconcile_all().await;
        assert_eq!(reconciler.settled_len(), 2);
        reconciler.reconcile_all().await;
        assert_eq!(reconciler.settled_len(), 1);

        // Still reported as acknowledged, so it stays.
        for _ in 0..3 {
            reconciler.reconcile_all().await;
        }
        assert_eq!(reconciler.settled_len(), 1);
        assert_eq!(backend.acknowledge_calls(), 1);
        assert_eq!(backend.consume_calls(), 1);
    }

    #[tokio::test]
    async fn partial_sweeps_never_prune() {
        let (backend, _state, reconciler) = setup();
        backend.fail_purchase_query(OfferType::Recurring, ResponseCode::ServiceUnavailable);
        let update = PurchaseUpdate::ok(vec![PurchaseRecord::purchased("gem_pack_10", "t-gems")]);
        reconciler.reconcile(&update).await;
        for _ in 0..4 {
            reconciler.reconcile_all().await;
        }
        assert_eq!(reconciler.settled_len(), 1);
        reconciler.reconcile(&update).await;
        assert_eq!(backend.consume_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_sweeps_never_prune() {
        let (backend, _state, reconciler) = setup();
        backend.set_latency(std::time::Duration::from_millis(100));
        reconciler
            .reconcile(&PurchaseUpdate::ok(vec![PurchaseRecord::purchased("gem_pack_10", "t-gems")]))
            .await;
        for _ in 0..3 {
            tokio::join!(reconciler.reconcile_all(), reconciler.reconcile_all());
        }
        assert_eq!(reconciler.settled_len(), 1);
        assert_eq!(backend.consume_calls(), 1);
    }

    #[tokio::test]
    async fn item_already_owned_is_settled() {
        let (_backend, state, reconciler) = setup();
        let update = PurchaseUpdate::new(
            ResponseCode::ItemAlreadyOwned,
            Some(vec![PurchaseRecord::purchased("premium", "t1")]),
        );
        reconciler.reconcile(&update).await;
        assert!(state.is_acknowledged("premium"));
    }
}
