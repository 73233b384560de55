//! Per-message pipeline context and the collaborators it carries.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::Consumer;
use crate::broker::InboundEnvelope;
use crate::sequence::{Sequence, SequenceStore, SequenceStream};

/// Error type returned by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What the application handler receives.
pub enum ConsumedMessage {
    /// A single message (or a reassembled chunked message).
    Single(InboundEnvelope),
    /// The stream of a batch sequence.
    Stream(SequenceStream),
}

/// Application subscriber invoked at the end of the consumer pipeline.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ConsumedMessage) -> Result<(), HandlerError>;
}

type SequenceStoreFactory = Arc<dyn Fn() -> SequenceStore + Send + Sync>;

/// Resolves the collaborators pipeline steps need per call.
#[derive(Clone)]
pub struct Services {
    sequence_store_factory: SequenceStoreFactory,
    handler: Option<Arc<dyn MessageHandler>>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            sequence_store_factory: Arc::new(SequenceStore::new),
            handler: None,
        }
    }
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_sequence_store_factory(
        mut self,
        factory: impl Fn() -> SequenceStore + Send + Sync + 'static,
    ) -> Self {
        self.sequence_store_factory = Arc::new(factory);
        self
    }

    /// Build a fresh sequence store.
    pub fn create_sequence_store(&self) -> SequenceStore {
        (self.sequence_store_factory)()
    }

    pub fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.clone()
    }
}

/// Context flowing through the consumer pipeline.
///
/// Behaviors never mutate a context in place; they hand a new one to the
/// next step with [`with_envelope`](Self::with_envelope) or
/// [`with_sequence`](Self::with_sequence).
#[derive(Clone)]
pub struct ConsumerPipelineContext {
    envelope: InboundEnvelope,
    consumer: Arc<Consumer>,
    sequence_store: Arc<SequenceStore>,
    services: Services,
    sequence: Option<Arc<Sequence>>,
}

impl ConsumerPipelineContext {
    pub fn new(
        envelope: InboundEnvelope,
        consumer: Arc<Consumer>,
        sequence_store: Arc<SequenceStore>,
        services: Services,
    ) -> Self {
        Self {
            envelope,
            consumer,
            sequence_store,
            services,
            sequence: None,
        }
    }

    pub fn envelope(&self) -> &InboundEnvelope {
        &self.envelope
    }

    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.consumer
    }

    pub fn sequence_store(&self) -> &Arc<SequenceStore> {
        &self.sequence_store
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Sequence being processed, when the context was started by one.
    pub fn sequence(&self) -> Option<&Arc<Sequence>> {
        self.sequence.as_ref()
    }

    pub fn with_envelope(self, envelope: InboundEnvelope) -> Self {
        Self { envelope, ..self }
    }

    pub fn with_sequence(self, sequence: Arc<Sequence>) -> Self {
        Self {
            sequence: Some(sequence),
            ..self
        }
    }
}

impl fmt::Debug for ConsumerPipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerPipelineContext")
            .field("identifier", self.envelope.identifier())
            .field("consumer_id", &self.consumer.id())
            .field("sequence_store", &self.sequence_store.id())
            .field("sequence", &self.sequence.as_ref().map(|s| s.id().to_string()))
            .finish()
    }
}
