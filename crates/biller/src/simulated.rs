//! In-process billing backend with scripted behaviour.
//!
//! Holds a metadata table, an outstanding-purchase book keyed by token, and per-call failure
//! injection. Connect outcomes are scripted in order; once the script runs out every connect
//! succeeds. Tokens not present in the book are accepted by acknowledge/consume.

use crate::backend::{
    BillingBackend, ConsumeResult, OfferDetails, OfferDetailsResult, PurchasesResult, ResponseCode,
};
use crate::offer::OfferType;
use crate::purchase::{PurchaseRecord, PurchaseUpdate};
use crate::session::PurchaseUpdateSink;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;

/// Host context for the simulated flow: who is buying.
#[derive(Debug, Clone, Default)]
pub struct SimulatedHost {
    pub account: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connect: usize,
    pub disconnect: usize,
    pub details_queries: usize,
    pub purchase_queries: usize,
    pub launch: usize,
    pub acknowledge: usize,
    pub consume: usize,
}

#[derive(Default)]
struct Sim {
    /// `None` entries hang the connect attempt forever.
    connect_script: VecDeque<Option<ResponseCode>>,
    connected: bool,
    details: HashMap<String, OfferDetails>,
    details_failures: HashMap<OfferType, ResponseCode>,
    book: Vec<(OfferType, PurchaseRecord)>,
    purchase_query_failures: HashMap<OfferType, ResponseCode>,
    launch_code: Option<ResponseCode>,
    complete_launched: bool,
    acknowledge_failures: usize,
    consume_failures: usize,
    latency: Option<Duration>,
    listener: Option<PurchaseUpdateSink>,
    calls: CallCounts,
}

#[derive(Default)]
pub struct SimulatedBackend {
    sim: Mutex<Sim>,
    dropped: Notify,
}

pub fn new_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes for the next connect attempts, in order.
    pub fn script_connect(&self, codes: impl IntoIterator<Item = ResponseCode>) {
        self.sim.lock().connect_script.extend(codes.into_iter().map(Some));
    }

    /// The next connect attempt never completes.
    pub fn hang_next_connect(&self) {
        self.sim.lock().connect_script.push_back(None);
    }

    /// Simulates the service dropping an established connection.
    pub fn drop_connection(&self) {
        let was_connected = std::mem::replace(&mut self.sim.lock().connected, false);
        if was_connected {
            self.dropped.notify_one();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sim.lock().connected
    }

    pub fn set_details(&self, details: OfferDetails) {
        self.sim.lock().details.insert(details.offer_id.clone(), details);
    }

    /// Convenience for [SimulatedBackend::set_details].
    pub fn set_price(&self, offer_id: &str, offer_type: OfferType, price: &str, billing_period: Option<&str>) {
        self.set_details(OfferDetails {
            offer_id: offer_id.to_string(),
            offer_type,
            price: price.to_string(),
            billing_period: billing_period.map(str::to_string),
        });
    }

    /// Metadata queries for `offer_type` answer with `code` until cleared.
    pub fn fail_details_query(&self, offer_type: OfferType, code: ResponseCode) {
        self.sim.lock().details_failures.insert(offer_type, code);
    }

    pub fn clear_details_failures(&self) {
        self.sim.lock().details_failures.clear();
    }

    /// Adds or replaces (by token) an outstanding purchase.
    pub fn put_purchase(&self, offer_type: OfferType, record: PurchaseRecord) {
        let mut sim = self.sim.lock();
        sim.book.retain(|(_, r)| r.token != record.token);
        sim.book.push((offer_type, record));
    }

    pub fn outstanding(&self) -> Vec<PurchaseRecord> {
        self.sim.lock().book.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn fail_purchase_query(&self, offer_type: OfferType, code: ResponseCode) {
        self.sim.lock().purchase_query_failures.insert(offer_type, code);
    }

    pub fn set_launch_code(&self, code: ResponseCode) {
        self.sim.lock().launch_code = Some(code);
    }

    /// When enabled, a launched flow immediately completes a purchase and reports it to the
    /// attached listener, as the store would after the user confirms.
    pub fn complete_launched_flows(&self, enabled: bool) {
        self.sim.lock().complete_launched = enabled;
    }

    pub fn attach_listener(&self, sink: PurchaseUpdateSink) {
        self.sim.lock().listener = Some(sink);
    }

    /// The next `n` acknowledge calls fail with `Error`.
    pub fn fail_acknowledge(&self, n: usize) {
        self.sim.lock().acknowledge_failures = n;
    }

    /// The next `n` consume calls fail with `Error`.
    pub fn fail_consume(&self, n: usize) {
        self.sim.lock().consume_failures = n;
    }

    /// Delay applied to every query, acknowledge and consume call.
    pub fn set_latency(&self, latency: Duration) {
        self.sim.lock().latency = Some(latency);
    }

    pub fn calls(&self) -> CallCounts {
        self.sim.lock().calls
    }

    pub fn connect_calls(&self) -> usize {
        self.calls().connect
    }

    pub fn acknowledge_calls(&self) -> usize {
        self.calls().acknowledge
    }

    pub fn consume_calls(&self) -> usize {
        self.calls().consume
    }

    pub fn launch_calls(&self) -> usize {
        self.calls().launch
    }

    async fn delay(&self) {
        let latency = self.sim.lock().latency;
        if let Some(latency) = latency {
            sleep(latency).await;
        }
    }
}

#[async_trait]
impl BillingBackend for SimulatedBackend {
    type HostContext = SimulatedHost;

    async fn connect(&self) -> ResponseCode {
        let step = {
            let mut sim = self.sim.lock();
            sim.calls.connect += 1;
            sim.connect_script.pop_front().unwrap_or(Some(ResponseCode::Ok))
        };
        let Some(code) = step else {
            return std::future::pending().await;
        };
        if code.is_ok() {
            self.sim.lock().connected = true;
        }
        code
    }

    async fn disconnected(&self) {
        self.dropped.notified().await;
    }

    async fn disconnect(&self) {
        let mut sim = self.sim.lock();
        sim.calls.disconnect += 1;
        sim.connected = false;
    }

    async fn query_offer_details(&self, ids: &[String], offer_type: OfferType) -> OfferDetailsResult {
        self.delay().await;
        let mut sim = self.sim.lock();
        sim.calls.details_queries += 1;
        if let Some(code) = sim.details_failures.get(&offer_type) {
            return OfferDetailsResult {
                code: *code,
                details: Vec::new(),
            };
        }
        let details = ids
            .iter()
            .filter_map(|id| sim.details.get(id))
            .filter(|d| d.offer_type == offer_type)
            .cloned()
            .collect();
        OfferDetailsResult {
            code: ResponseCode::Ok,
            details,
        }
    }

    async fn query_purchases(&self, offer_type: OfferType) -> PurchasesResult {
        self.delay().await;
        let mut sim = self.sim.lock();
        sim.calls.purchase_queries += 1;
        if let Some(code) = sim.purchase_query_failures.get(&offer_type) {
            return PurchasesResult {
                code: *code,
                purchases: Vec::new(),
            };
        }
        let purchases = sim
            .book
            .iter()
            .filter(|(t, _)| *t == offer_type)
            .map(|(_, r)| r.clone())
            .collect();
        PurchasesResult {
            code: ResponseCode::Ok,
            purchases,
        }
    }

    async fn launch_purchase_flow(&self, host: &SimulatedHost, details: &OfferDetails) -> ResponseCode {
        let (code, completed) = {
            let mut sim = self.sim.lock();
            sim.calls.launch += 1;
            let code = sim.launch_code.unwrap_or(ResponseCode::Ok);
            if !code.is_ok() || !sim.complete_launched {
                return code;
            }
            let record = PurchaseRecord::purchased(details.offer_id.clone(), new_token());
            sim.book.push((details.offer_type, record.clone()));
            (code, sim.listener.clone().map(|sink| (sink, record)))
        };
        if let Some((sink, record)) = completed {
            tracing::debug!(account = %host.account, offer_id = %record.offer_id, "simulated purchase completed");
            sink.deliver(PurchaseUpdate::ok(vec![record]));
        }
        code
    }

    async fn acknowledge(&self, token: &str) -> ResponseCode {
        self.delay().await;
        let mut sim = self.sim.lock();
        sim.calls.acknowledge += 1;
        if sim.acknowledge_failures > 0 {
            sim.acknowledge_failures -= 1;
            return ResponseCode::Error;
        }
        for (_, record) in sim.book.iter_mut().filter(|(_, r)| r.token == token) {
            record.acknowledged = true;
        }
        ResponseCode::Ok
    }

    async fn consume(&self, token: &str) -> ConsumeResult {
        self.delay().await;
        let mut sim = self.sim.lock();
        sim.calls.consume += 1;
        if sim.consume_failures > 0 {
            sim.consume_failures -= 1;
            return ConsumeResult {
                code: ResponseCode::Error,
                token: token.to_string(),
            };
        }
        sim.book.retain(|(_, r)| r.token != token);
        ConsumeResult {
            code: ResponseCode::Ok,
            token: token.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_follows_script_then_succeeds() {
        let backend = SimulatedBackend::new();
        backend.script_connect([ResponseCode::ServiceUnavailable]);
        assert_eq!(backend.connect().await, ResponseCode::ServiceUnavailable);
        assert!(!backend.is_connected());
        assert_eq!(backend.connect().await, ResponseCode::Ok);
        assert!(backend.is_connected());
        assert_eq!(backend.connect_calls(), 2);
    }

    #[tokio::test]
    async fn consume_removes_from_book() {
        let backend = SimulatedBackend::new();
        backend.put_purchase(OfferType::OneTime, PurchaseRecord::purchased("gems", "t1"));
        assert_eq!(backend.query_purchases(OfferType::OneTime).await.purchases.len(), 1);
        assert!(backend.consume("t1").await.code.is_ok());
        assert!(backend.outstanding().is_empty());
    }

    #[tokio::test]
    async fn acknowledge_sets_flag() {
        let backend = SimulatedBackend::new();
        backend.put_purchase(OfferType::Recurring, PurchaseRecord::purchased("pro", "t1"));
        backend.acknowledge("t1").await;
        assert!(backend.outstanding()[0].acknowledged);
    }

    #[test]
    fn tokens_are_unique_hex() {
        let a = new_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, new_token());
    }
}
