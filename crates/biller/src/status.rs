//! Connection status and its replay-latest broadcast.
//!
//! [StatusCell] is written by the connection manager only. Each [StatusStream] first yields the
//! value current at subscription time, then every later publication in order. A slow observer
//! loses the oldest buffered values first; the most recent ones are always delivered, so a
//! ready -> disconnected -> ready flap is seen as two distinct `Ready` values.

use crate::backend::ResponseCode;
use crate::config::MAX_STATUS_BUFFER;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "code")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Ready,
    Error(ResponseCode),
}

impl ConnectionStatus {
    pub fn is_ready(self) -> bool {
        self == ConnectionStatus::Ready
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
            ConnectionStatus::Connecting => f.write_str("connecting"),
            ConnectionStatus::Ready => f.write_str("ready"),
            ConnectionStatus::Error(code) => write!(f, "error({})", code),
        }
    }
}

/// Single-writer, multi-reader status cell with replay-of-one.
pub struct StatusCell {
    current: Mutex<ConnectionStatus>,
    tx: broadcast::Sender<ConnectionStatus>,
}

impl StatusCell {
    /// `buffer` is the per-observer backlog, clamped to `2..=MAX_STATUS_BUFFER`; values older than
    /// that are dropped for laggards.
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.clamp(2, MAX_STATUS_BUFFER));
        Self {
            current: Mutex::new(ConnectionStatus::Disconnected),
            tx,
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        *self.current.lock()
    }

    /// Subscribe: yields the current value, then every later publication.
    pub fn subscribe(&self) -> StatusStream {
        // Holding the lock orders this subscription strictly between two publications.
        let current = self.current.lock();
        StatusStream {
            replay: Some(*current),
            rx: self.tx.subscribe(),
        }
    }

    /// Publishes a new value. Every value is broadcast, including repeats.
    pub(crate) fn publish(&self, status: ConnectionStatus) {
        let mut current = self.current.lock();
        *current = status;
        // No receivers is not an error: late subscribers get the replayed value.
        let _ = self.tx.send(status);
        tracing::debug!(%status, "connection status");
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(16)
    }
}

/// One observer's view of the status broadcast.
pub struct StatusStream {
    replay: Option<ConnectionStatus>,
    rx: broadcast::Receiver<ConnectionStatus>,
}

impl StatusStream {
    /// Next status. `None` once the owning cell is gone.
    pub async fn next(&mut self) -> Option<ConnectionStatus> {
        if let Some(status) = self.replay.take() {
            return Some(status);
        }
        loop {
            match self.rx.recv().await {
                Ok(status) => return Some(status),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "status observer lagged, oldest values dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Waits for the next `Ready` value (including the replayed one).
    pub async fn wait_ready(&mut self) -> bool {
        while let Some(status) = self.next().await {
            if status.is_ready() {
                return true;
            }
        }
        false
    }
}
