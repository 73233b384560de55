//! Reconnection backoff settings.

use std::time::Duration;

use serde::Deserialize;

/// Default first retry delay.
pub const DEFAULT_RECONNECT_MIN_DELAY_MS: u64 = 100;
/// Default ceiling for the retry delay.
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 5_000;
/// Default number of reconnection attempts.
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: usize = 30;

/// Backoff used when a consumer reconnects after `trigger_reconnect`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: DEFAULT_RECONNECT_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}
