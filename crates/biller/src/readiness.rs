//! Readiness gate: bounded wait for a usable connection.

use crate::status::StatusCell;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Derives "connection is usable" from the status broadcast. Each wait holds its own
/// subscription, so concurrent waiters never interfere.
#[derive(Clone)]
pub struct ReadinessGate {
    status: Arc<StatusCell>,
}

impl ReadinessGate {
    pub fn new(status: Arc<StatusCell>) -> Self {
        Self { status }
    }

    /// True once the status is (or becomes) `Ready`; false if `limit` elapses first or the status
    /// source goes away. `None` waits as long as it takes.
    pub async fn await_ready(&self, limit: Option<Duration>) -> bool {
        let mut stream = self.status.subscribe();
        match limit {
            Some(limit) => timeout(limit, stream.wait_ready()).await.unwrap_or(false),
            None => stream.wait_ready().await,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status.current().is_ready()
    }
}
