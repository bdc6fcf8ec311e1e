//! Common helpers for integration tests.
#![allow(dead_code)]

use anyhow::{Context, Result};
use biller::{BillerSession, Offer, OfferType, SessionConfig, SimulatedBackend};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("biller=debug".parse().unwrap()))
        .with_test_writer()
        .try_init();
}

/// One offer of each shape: one-time unlock, monthly subscription, consumable.
pub fn store_offers() -> Vec<Offer> {
    vec![
        Offer::acknowledgeable("premium", OfferType::OneTime),
        Offer::acknowledgeable("pro_monthly", OfferType::Recurring),
        Offer::consumable("gem_pack_10"),
    ]
}

/// Simulated backend with metadata for every offer in [store_offers].
pub fn priced_backend() -> Arc<SimulatedBackend> {
    let backend = Arc::new(SimulatedBackend::new());
    backend.set_price("premium", OfferType::OneTime, "$9.99", None);
    backend.set_price("pro_monthly", OfferType::Recurring, "$2.99", Some("P1M"));
    backend.set_price("gem_pack_10", OfferType::OneTime, "$0.99", None);
    backend
}

/// Session with default config, its sink wired into the backend's purchase callback.
pub fn session(backend: &Arc<SimulatedBackend>, offers: Vec<Offer>) -> Result<BillerSession<SimulatedBackend>> {
    let session = BillerSession::new(Arc::clone(backend), offers, SessionConfig::default())?;
    backend.attach_listener(session.purchase_update_sink());
    Ok(session)
}

/// Fails instead of hanging when a scenario never reaches its expected state.
pub async fn within<F: Future>(fut: F) -> Result<F::Output> {
    tokio::time::timeout(Duration::from_secs(120), fut)
        .await
        .context("timed out")
}

/// Waits until `offer_id` is in the acknowledged set.
pub async fn acknowledged(session: &BillerSession<SimulatedBackend>, offer_id: &str) -> Result<()> {
    let mut rx = session.purchase_state().watch_acknowledged();
    within(rx.wait_for(|set| set.contains(offer_id))).await??;
    Ok(())
}

/// Waits until the offer has a price from the backend.
pub async fn priced(session: &BillerSession<SimulatedBackend>, offer_id: &str) -> Result<()> {
    let mut rx = session.offer(offer_id).context("unknown offer")?.watch_pricing();
    within(rx.wait_for(|p| !p.price.is_empty())).await??;
    Ok(())
}
