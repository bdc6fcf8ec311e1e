//! Purchase flow launcher.
//!
//! A successful launch means the flow was opened, not that anything was bought. Purchases are
//! only observable later through [PurchaseState](crate::state::PurchaseState).

use crate::backend::{BillingBackend, ResponseCode};
use crate::catalog::OfferCatalog;
use crate::readiness::ReadinessGate;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LaunchError {
    /// No metadata cached for the offer yet (unknown id, or no refresh has returned it).
    #[error("offer not ready to purchase")]
    OfferNotReady,
    #[error("billing connection not ready within {0:?}")]
    NotConnected(Duration),
    #[error("purchase flow rejected: {0}")]
    Rejected(ResponseCode),
}

pub struct FlowLauncher<B: BillingBackend> {
    backend: Arc<B>,
    catalog: Arc<OfferCatalog>,
    gate: ReadinessGate,
    timeout: Duration,
}

impl<B: BillingBackend> FlowLauncher<B> {
    pub fn new(backend: Arc<B>, catalog: Arc<OfferCatalog>, gate: ReadinessGate, timeout: Duration) -> Self {
        Self {
            backend,
            catalog,
            gate,
            timeout,
        }
    }

    /// Opens the purchase flow for `offer_id` on `host`.
    pub async fn try_launch(&self, offer_id: &str, host: &B::HostContext) -> Result<(), LaunchError> {
        let details = self
            .catalog
            .details(offer_id)
            .await
            .ok_or(LaunchError::OfferNotReady)?;
        if !self.gate.await_ready(Some(self.timeout)).await {
            return Err(LaunchError::NotConnected(self.timeout));
        }
        let code = self.backend.launch_purchase_flow(host, &details).await;
        if !code.is_ok() {
            return Err(LaunchError::Rejected(code));
        }
        tracing::info!(%offer_id, "purchase flow launched");
        Ok(())
    }

    /// Whether the flow was launched.
    pub async fn launch(&self, offer_id: &str, host: &B::HostContext) -> bool {
        match self.try_launch(offer_id, host).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%offer_id, reason = %e, "purchase flow not launched");
                false
            }
        }
    }
}
