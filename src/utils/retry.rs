//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use backon::ExponentialBuilder;

use crate::config::ReconnectConfig;

/// Backoff for reconnecting a consumer after a broker-driven disconnect.
///
/// Defaults:
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn reconnect_backoff(config: &ReconnectConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.min_delay())
        .with_max_delay(config.max_delay())
        .with_max_times(config.max_attempts)
        .with_jitter()
}
