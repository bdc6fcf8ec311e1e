//! ConnectionManager: keeps a connection to the billing backend for as long as it runs.
//!
//! connect -> publish outcome -> (on success) wait for the drop -> sleep fixed backoff -> again.
//! Failures are never surfaced as errors, only as [ConnectionStatus] values.

use crate::backend::BillingBackend;
use crate::config::ReconnectionConfig;
use crate::status::{ConnectionStatus, StatusCell, StatusStream};
use std::sync::Arc;
use tokio::time::sleep;

pub struct ConnectionManager<B: BillingBackend> {
    backend: Arc<B>,
    status: Arc<StatusCell>,
    reconnection: ReconnectionConfig,
}

impl<B: BillingBackend> ConnectionManager<B> {
    pub fn new(backend: Arc<B>, status: Arc<StatusCell>, reconnection: ReconnectionConfig) -> Self {
        Self {
            backend,
            status,
            reconnection,
        }
    }

    /// Replay-latest subscription to connection status.
    pub fn connection_status(&self) -> StatusStream {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.status.current()
    }

    /// Runs the connect loop. Never returns; cancel the task to stop it, then call
    /// [ConnectionManager::shutdown].
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            self.status.publish(ConnectionStatus::Connecting);
            let code = self.backend.connect().await;
            if code.is_ok() {
                tracing::info!(attempt, "billing connection ready");
                self.status.publish(ConnectionStatus::Ready);
                attempt = 0;
                self.backend.disconnected().await;
                tracing::warn!("billing connection lost, reconnecting...");
                self.status.publish(ConnectionStatus::Disconnected);
            } else {
                tracing::warn!(attempt, %code, "billing connection failed, retrying...");
                self.status.publish(ConnectionStatus::Error(code));
            }
            sleep(self.reconnection.retry_delay).await;
        }
    }

    /// Closes the backend connection and publishes `Disconnected`.
    pub async fn shutdown(&self) {
        self.backend.disconnect().await;
        self.status.publish(ConnectionStatus::Disconnected);
    }
}
