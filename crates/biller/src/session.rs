//! BillerSession: composes connection, catalog, reconciler and launcher under one lifetime.
//!
//! Passive until [BillerSession::start]. While running it owns three or four tasks:
//! - the connection loop;
//! - the readiness listener: every `Ready` value triggers a catalog refresh, then a sweep;
//! - the push intake: drains [PurchaseUpdateSink] into the reconciler;
//! - optionally, a periodic sweep ([SessionConfig::sweep_interval]).
//!
//! [BillerSession::stop] tears all of them down and closes the connection. A stopped session
//! can be started again; pushed updates delivered meanwhile are kept and processed on restart.

use crate::backend::BillingBackend;
use crate::catalog::{CatalogError, OfferCatalog, RefreshReport};
use crate::config::{ConfigError, SessionConfig};
use crate::connection::ConnectionManager;
use crate::launcher::{FlowLauncher, LaunchError};
use crate::offer::Offer;
use crate::purchase::PurchaseUpdate;
use crate::readiness::ReadinessGate;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::state::{ConsumedEvent, PurchaseState};
use crate::status::{ConnectionStatus, StatusCell, StatusStream};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session must be started from within a Tokio runtime")]
    NoRuntime,
}

/// Entry point for the backend's purchase callback. Cloneable; hand one to the SDK adapter.
#[derive(Clone)]
pub struct PurchaseUpdateSink {
    tx: mpsc::UnboundedSender<PurchaseUpdate>,
}

impl PurchaseUpdateSink {
    /// Queues an update for reconciliation. False only if the session is gone.
    pub fn deliver(&self, update: PurchaseUpdate) -> bool {
        self.tx.send(update).is_ok()
    }
}

pub struct BillerSession<B: BillingBackend> {
    config: SessionConfig,
    status: Arc<StatusCell>,
    catalog: Arc<OfferCatalog>,
    state: Arc<PurchaseState>,
    connection: Arc<ConnectionManager<B>>,
    reconciler: Arc<Reconciler<B>>,
    launcher: FlowLauncher<B>,
    gate: ReadinessGate,
    backend: Arc<B>,
    updates_tx: mpsc::UnboundedSender<PurchaseUpdate>,
    updates_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<PurchaseUpdate>>>,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
    running: watch::Sender<bool>,
}

impl<B: BillingBackend> BillerSession<B> {
    pub fn new(
        backend: Arc<B>,
        offers: impl IntoIterator<Item = Offer>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let catalog = Arc::new(OfferCatalog::new(offers)?);
        let status = Arc::new(StatusCell::new(config.status_buffer));
        let state = Arc::new(PurchaseState::new());
        let gate = ReadinessGate::new(Arc::clone(&status));
        let connection = Arc::new(ConnectionManager::new(
            Arc::clone(&backend),
            Arc::clone(&status),
            config.reconnection.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&backend),
            Arc::clone(&catalog),
            Arc::clone(&state),
        ));
        let launcher = FlowLauncher::new(
            Arc::clone(&backend),
            Arc::clone(&catalog),
            gate.clone(),
            config.launch_timeout,
        );
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            status,
            catalog,
            state,
            connection,
            reconciler,
            launcher,
            gate,
            backend,
            updates_tx,
            updates_rx: Arc::new(AsyncMutex::new(updates_rx)),
            tasks: parking_lot::Mutex::new(None),
            running: watch::channel(false).0,
        })
    }

    /// Starts the session. No-op if already running.
    pub fn start(&self) -> Result<(), SessionError> {
        let handle = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return Ok(());
        }
        let mut set = JoinSet::new();

        // Subscribe before the connection loop can publish anything.
        let mut ready = self.status.subscribe();
        let catalog = Arc::clone(&self.catalog);
        let backend = Arc::clone(&self.backend);
        let reconciler = Arc::clone(&self.reconciler);
        set.spawn_on(
            async move {
                while ready.wait_ready().await {
                    catalog.refresh(backend.as_ref()).await;
                    reconciler.reconcile_all().await;
                }
            },
            &handle,
        );

        let updates = Arc::clone(&self.updates_rx);
        let reconciler = Arc::clone(&self.reconciler);
        set.spawn_on(
            async move {
                let mut updates = updates.lock().await;
                while let Some(update) = updates.recv().await {
                    reconciler.reconcile(&update).await;
                }
            },
            &handle,
        );

        if let Some(period) = self.config.sweep_interval {
            let gate = self.gate.clone();
            let reconciler = Arc::clone(&self.reconciler);
            set.spawn_on(
                async move {
                    let mut ticker = interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    // First tick is immediate; readiness already triggers a sweep.
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        if gate.await_ready(None).await {
                            reconciler.reconcile_all().await;
                        }
                    }
                },
                &handle,
            );
        }

        set.spawn_on(Arc::clone(&self.connection).run(), &handle);
        *tasks = Some(set);
        self.running.send_replace(true);
        tracing::info!(offers = self.catalog.len(), "billing session started");
        Ok(())
    }

    /// Stops every session task and closes the connection. No-op if not running.
    pub async fn stop(&self) {
        let tasks = self.tasks.lock().take();
        let Some(mut tasks) = tasks else {
            return;
        };
        self.running.send_replace(false);
        tasks.shutdown().await;
        self.connection.shutdown().await;
        tracing::info!("billing session stopped");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Replay-latest subscription to connection status.
    pub fn connection_status(&self) -> StatusStream {
        self.connection.connection_status()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.connection.current_status()
    }

    pub fn purchase_state(&self) -> &PurchaseState {
        &self.state
    }

    pub fn acknowledged(&self) -> BTreeSet<String> {
        self.state.acknowledged()
    }

    pub fn subscribe_consumed(&self) -> mpsc::UnboundedReceiver<ConsumedEvent> {
        self.state.subscribe_consumed()
    }

    pub fn catalog(&self) -> &OfferCatalog {
        &self.catalog
    }

    pub fn offer(&self, id: &str) -> Option<&Offer> {
        self.catalog.get(id)
    }

    pub fn purchase_update_sink(&self) -> PurchaseUpdateSink {
        PurchaseUpdateSink {
            tx: self.updates_tx.clone(),
        }
    }

    /// Whether the purchase flow was launched. Says nothing about whether a purchase followed.
    pub async fn launch_flow(&self, offer_id: &str, host: &B::HostContext) -> bool {
        self.launcher.launch(offer_id, host).await
    }

    pub async fn try_launch_flow(&self, offer_id: &str, host: &B::HostContext) -> Result<(), LaunchError> {
        self.launcher.try_launch(offer_id, host).await
    }

    /// On-demand sweep (e.g. a "restore purchases" action). Waits for readiness first; returns an
    /// empty report if the session is not running or is stopped while waiting.
    pub async fn reconcile_all(&self) -> ReconcileReport {
        if !self.ready_while_running().await {
            tracing::warn!("session not running, sweep skipped");
            return ReconcileReport::default();
        }
        self.reconciler.reconcile_all().await
    }

    /// On-demand catalog refresh. Same waiting rules as [BillerSession::reconcile_all].
    pub async fn refresh_catalog(&self) -> RefreshReport {
        if !self.ready_while_running().await {
            tracing::warn!("session not running, catalog refresh skipped");
            return RefreshReport::default();
        }
        self.catalog.refresh(self.backend.as_ref()).await
    }

    async fn ready_while_running(&self) -> bool {
        let mut running = self.running.subscribe();
        if !*running.borrow_and_update() {
            return false;
        }
        tokio::select! {
            ready = self.gate.await_ready(None) => ready,
            _ = running.wait_for(|r| !*r) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::OfferType;
    use crate::purchase::PurchaseRecord;
    use crate::simulated::SimulatedBackend;
    use std::time::Duration;
    use tokio::time::sleep;

    fn offers() -> Vec<Offer> {
        vec![
            Offer::acknowledgeable("premium", OfferType::OneTime),
            Offer::consumable("gem_pack_10"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_picks_up_missed_purchases() {
        let backend = Arc::new(SimulatedBackend::new());
        let config = SessionConfig {
            sweep_interval: Some(Duration::from_secs(60)),
            ..SessionConfig::default()
        };
        let session = BillerSession::new(Arc::clone(&backend), offers(), config).unwrap();
        let mut consumed = session.subscribe_consumed();
        session.start().unwrap();
        assert!(session.connection_status().wait_ready().await);
        sleep(Duration::from_secs(1)).await;
        // Readiness sweep only, one query per offer type.
        assert_eq!(backend.calls().purchase_queries, 2);

        backend.put_purchase(OfferType::OneTime, PurchaseRecord::purchased("gem_pack_10", "tok-1"));
        sleep(Duration::from_secs(60)).await;
        assert_eq!(consumed.recv().await.unwrap().token, "tok-1");
        assert_eq!(backend.calls().purchase_queries, 4);
        session.stop().await;
    }

    #[tokio::test]
    async fn sink_reports_dropped_session() {
        let backend = Arc::new(SimulatedBackend::new());
        let session = BillerSession::new(backend, offers(), SessionConfig::default()).unwrap();
        let sink = session.purchase_update_sink();
        assert!(sink.deliver(PurchaseUpdate::ok(vec![])));
        drop(session);
        assert!(!sink.deliver(PurchaseUpdate::ok(vec![])));
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_calls_return_once_stopped() {
        let backend = Arc::new(SimulatedBackend::new());
        backend.put_purchase(OfferType::OneTime, PurchaseRecord::purchased("premium", "tok-1"));
        let session = BillerSession::new(Arc::clone(&backend), offers(), SessionConfig::default()).unwrap();
        let limit = Duration::from_secs(3600);

        // Never started.
        let report = tokio::time::timeout(limit, session.reconcile_all()).await.unwrap();
        assert!(report.is_empty());

        session.start().unwrap();
        assert!(session.connection_status().wait_ready().await);
        session.stop().await;
        let report = tokio::time::timeout(limit, session.reconcile_all()).await.unwrap();
        assert!(report.is_empty());
        let refresh = tokio::time::timeout(limit, session.refresh_catalog()).await.unwrap();
        assert_eq!(refresh, RefreshReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_a_pending_sweep() {
        let backend = Arc::new(SimulatedBackend::new());
        backend.hang_next_connect();
        let session = Arc::new(BillerSession::new(Arc::clone(&backend), offers(), SessionConfig::default()).unwrap());
        session.start().unwrap();
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.reconcile_all().await })
        };
        sleep(Duration::from_secs(30)).await;
        assert!(!waiter.is_finished());
        session.stop().await;
        let report = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(report.is_empty());
        assert_eq!(backend.calls().purchase_queries, 0);
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let backend = Arc::new(SimulatedBackend::new());
        let session = BillerSession::new(Arc::clone(&backend), offers(), SessionConfig::default()).unwrap();
        session.stop().await;
        assert_eq!(backend.calls().disconnect, 0);
        assert!(!session.is_running());
    }
}
