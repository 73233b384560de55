//! Broker transport hooks.
//!
//! Broker-specific clients implement [`BrokerTransport`]; the consumer only
//! calls these hooks and owns everything around them (state machine,
//! sequences, bookkeeping).

use std::sync::Weak;

use async_trait::async_trait;

use super::Consumer;
use crate::broker::BrokerMessageIdentifier;

/// Errors reported by broker transports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Broker operation failed: {0}")]
    Operation(String),
}

/// Broker-specific consumer hooks.
///
/// Implementations deliver messages by calling
/// [`Consumer::handle_message`] from their consume loop, once per partition
/// or more depending on the broker's parallelism.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Called once when the consumer is built, so the consume loop can reach it.
    fn bind(&self, _consumer: Weak<Consumer>) {}

    async fn connect_core(&self) -> Result<(), TransportError>;

    async fn disconnect_core(&self) -> Result<(), TransportError>;

    /// Start the consume loop.
    async fn start_core(&self) -> Result<(), TransportError>;

    /// Ask the consume loop to stop. Must not wait for it.
    async fn stop_core(&self) -> Result<(), TransportError>;

    async fn commit_core(&self, identifiers: &[BrokerMessageIdentifier])
        -> Result<(), TransportError>;

    async fn rollback_core(
        &self,
        identifiers: &[BrokerMessageIdentifier],
    ) -> Result<(), TransportError>;

    /// Resolve once the consume loop has fully quiesced.
    async fn wait_until_consuming_stopped_core(&self) -> Result<(), TransportError>;
}
