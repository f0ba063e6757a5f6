//! Reconnection policy.
//!
//! After an established connection drops the client walks the server pool,
//! sleeping a fixed `time_wait` before every attempt so that a fleet of
//! rejected or partitioned clients never spins on a server.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default pause before each reconnect attempt.
pub const DEFAULT_RECONNECT_TIME_WAIT: Duration = Duration::from_secs(2);

/// Default number of reconnect attempts per server.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// reconnect at all after losing an established connection
    pub enabled: bool,
    pub time_wait: Duration,
    /// attempts per server; `None` is unbounded
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            time_wait: DEFAULT_RECONNECT_TIME_WAIT,
            max_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sleep out the reconnect delay. Returns false if `cancel` fired first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.time_wait) => true,
        }
    }
}
