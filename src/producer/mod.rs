//! Broker producer.
//!
//! A [`Producer`] builds outbound envelopes for its endpoint and drives them
//! through the producer pipeline, whose last step hands them to a
//! [`ProduceStrategy`].

mod behaviors;
mod strategy;

pub use behaviors::{
    ChunkingBehavior, ProduceStrategyBehavior, CHUNKING_SORT_INDEX, PRODUCE_STRATEGY_SORT_INDEX,
};
pub use strategy::{DefaultProduceStrategy, ProduceStrategy, ProducerTransport};

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use crate::broker::{Endpoint, MessageHeaders, OutboundEnvelope, MESSAGE_ID_HEADER};
use crate::consumer::TransportError;
use crate::pipeline::{Behavior, Pipeline, PipelineError};

/// Errors raised while producing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProduceError {
    #[error("Broker produce failed: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Context flowing through the producer pipeline.
#[derive(Clone)]
pub struct ProducerPipelineContext {
    envelope: OutboundEnvelope,
    strategy: Arc<dyn ProduceStrategy>,
    produced: Arc<Mutex<Vec<OutboundEnvelope>>>,
}

impl ProducerPipelineContext {
    pub fn new(envelope: OutboundEnvelope, strategy: Arc<dyn ProduceStrategy>) -> Self {
        Self {
            envelope,
            strategy,
            produced: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn envelope(&self) -> &OutboundEnvelope {
        &self.envelope
    }

    pub fn strategy(&self) -> &Arc<dyn ProduceStrategy> {
        &self.strategy
    }

    pub fn with_envelope(self, envelope: OutboundEnvelope) -> Self {
        Self { envelope, ..self }
    }

    /// Record a delivered envelope. Shared by every context derived from the same call.
    pub fn record(&self, envelope: OutboundEnvelope) {
        self.produced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope);
    }

    /// Envelopes delivered so far, in order.
    pub fn produced(&self) -> Vec<OutboundEnvelope> {
        self.produced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for ProducerPipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerPipelineContext")
            .field("endpoint", &self.envelope.endpoint().name())
            .field("headers", self.envelope.headers())
            .finish()
    }
}

/// The default producer pipeline.
pub fn producer_pipeline() -> Pipeline<ProducerPipelineContext> {
    let behaviors: Vec<Arc<dyn Behavior<ProducerPipelineContext>>> =
        vec![Arc::new(ProduceStrategyBehavior), Arc::new(ChunkingBehavior)];
    Pipeline::new(behaviors)
}

/// Producer bound to one endpoint.
pub struct Producer {
    id: Uuid,
    endpoint: Arc<Endpoint>,
    strategy: Arc<dyn ProduceStrategy>,
    pipeline: Pipeline<ProducerPipelineContext>,
}

impl Producer {
    /// Producer with the default pipeline.
    pub fn new(endpoint: Arc<Endpoint>, strategy: Arc<dyn ProduceStrategy>) -> Self {
        Self::with_pipeline(endpoint, strategy, producer_pipeline())
    }

    pub fn with_pipeline(
        endpoint: Arc<Endpoint>,
        strategy: Arc<dyn ProduceStrategy>,
        pipeline: Pipeline<ProducerPipelineContext>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            strategy,
            pipeline,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Produce a message.
    ///
    /// A message id header is added when missing. Returns every envelope
    /// delivered, more than one when the body was chunked.
    #[tracing::instrument(
        name = "producer.produce",
        skip_all,
        fields(producer_id = %self.id, endpoint = %self.endpoint.name())
    )]
    pub async fn produce(
        &self,
        body: Option<Bytes>,
        mut headers: MessageHeaders,
    ) -> Result<Vec<OutboundEnvelope>, ProduceError> {
        if !headers.contains(MESSAGE_ID_HEADER) {
            headers.add(MESSAGE_ID_HEADER, Uuid::new_v4());
        }

        let envelope = OutboundEnvelope::new(body, headers, Arc::clone(&self.endpoint));
        let context = ProducerPipelineContext::new(envelope, Arc::clone(&self.strategy));
        self.pipeline.execute(context.clone()).await?;

        let produced = context.produced();
        debug!(count = produced.len(), "Message produced");
        Ok(produced)
    }
}

#[cfg(test)]
mod tests;
