//! Session configuration.

use std::time::Duration;
use thiserror::Error;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reconnection backoff for the connection loop.
    pub reconnection: ReconnectionConfig,
    /// How long an interactive flow launch waits for the connection to become ready.
    pub launch_timeout: Duration,
    /// Interval between background reconciliation sweeps. `None` sweeps only on readiness.
    pub sweep_interval: Option<Duration>,
    /// Connection-status values buffered per observer before the oldest are dropped.
    pub status_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnection: ReconnectionConfig::default(),
            launch_timeout: Duration::from_millis(2000),
            sweep_interval: None,
            status_buffer: 16,
        }
    }
}

/// Reconnection backoff. Fixed delay between attempts, no growth.
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    pub retry_delay: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(3000),
        }
    }
}

/// Largest per-observer status backlog accepted by [SessionConfig::validate].
pub const MAX_STATUS_BUFFER: usize = 4096;

/// Longest duration accepted for any timer in [SessionConfig::validate] (one year).
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
    #[error("status buffer must hold at least 2 values, got {0}")]
    StatusBufferTooSmall(usize),
    #[error("status buffer must hold at most {MAX_STATUS_BUFFER} values, got {0}")]
    StatusBufferTooLarge(usize),
    #[error("sweep interval must be non-zero")]
    ZeroSweepInterval,
    #[error("{name} of {value:?} exceeds the one-year limit")]
    DurationTooLong { name: &'static str, value: Duration },
}

impl SessionConfig {
    /// Defaults overridden by `BILLER_RETRY_DELAY_MS`, `BILLER_LAUNCH_TIMEOUT_MS`,
    /// `BILLER_SWEEP_INTERVAL_SECS` and `BILLER_STATUS_BUFFER` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, "BILLER_RETRY_DELAY_MS")? {
            config.reconnection.retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "BILLER_LAUNCH_TIMEOUT_MS")? {
            config.launch_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "BILLER_SWEEP_INTERVAL_SECS")? {
            // 0 disables the periodic sweep.
            config.sweep_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(n) = parse_var::<usize>(&lookup, "BILLER_STATUS_BUFFER")? {
            config.status_buffer = n;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.status_buffer < 2 {
            return Err(ConfigError::StatusBufferTooSmall(self.status_buffer));
        }
        if self.status_buffer > MAX_STATUS_BUFFER {
            return Err(ConfigError::StatusBufferTooLarge(self.status_buffer));
        }
        if self.sweep_interval == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroSweepInterval);
        }
        let timers = [
            ("retry delay", Some(self.reconnection.retry_delay)),
            ("launch timeout", Some(self.launch_timeout)),
            ("sweep interval", self.sweep_interval),
        ];
        for (name, value) in timers {
            if let Some(value) = value.filter(|v| *v > MAX_DURATION) {
                return Err(ConfigError::DurationTooLong { name, value });
            }
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
    }
}
