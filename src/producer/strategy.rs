//! Produce strategies.

use std::sync::Arc;

use async_trait::async_trait;

use super::ProduceError;
use crate::broker::{BrokerMessageIdentifier, OutboundEnvelope};
use crate::consumer::TransportError;

/// Broker-specific produce hook.
#[async_trait]
pub trait ProducerTransport: Send + Sync {
    /// Deliver one envelope and return its position on the broker.
    async fn produce_core(
        &self,
        envelope: &OutboundEnvelope,
    ) -> Result<BrokerMessageIdentifier, TransportError>;
}

/// How outbound envelopes reach the broker.
#[async_trait]
pub trait ProduceStrategy: Send + Sync {
    /// Deliver the envelope. Returns it with the broker identifier attached.
    async fn produce(&self, envelope: OutboundEnvelope) -> Result<OutboundEnvelope, ProduceError>;
}

/// Delivers straight through a [`ProducerTransport`].
pub struct DefaultProduceStrategy {
    transport: Arc<dyn ProducerTransport>,
}

impl DefaultProduceStrategy {
    pub fn new(transport: Arc<dyn ProducerTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ProduceStrategy for DefaultProduceStrategy {
    async fn produce(&self, envelope: OutboundEnvelope) -> Result<OutboundEnvelope, ProduceError> {
        let identifier = self.transport.produce_core(&envelope).await?;
        Ok(envelope.with_identifier(identifier))
    }
}
