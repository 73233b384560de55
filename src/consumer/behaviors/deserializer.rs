//! Body decoding.

use async_trait::async_trait;

use super::DESERIALIZER_SORT_INDEX;
use crate::consumer::ConsumerPipelineContext;
use crate::pipeline::{Behavior, Next, PipelineError, Result};

/// Decodes the body with the endpoint's serializer and passes on an
/// envelope carrying the decoded message.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeserializerBehavior;

#[async_trait]
impl Behavior<ConsumerPipelineContext> for DeserializerBehavior {
    fn name(&self) -> &'static str {
        "deserializer"
    }

    fn sort_index(&self) -> i32 {
        DESERIALIZER_SORT_INDEX
    }

    async fn handle(
        &self,
        context: ConsumerPipelineContext,
        next: Next<ConsumerPipelineContext>,
    ) -> Result<()> {
        let envelope = context.envelope();
        let message = envelope
            .endpoint()
            .serializer()
            .deserialize(envelope.body(), envelope.headers())
            .map_err(|e| PipelineError::Deserialization(e.to_string()))?;

        let envelope = envelope.clone().with_message(message);
        next.run(context.with_envelope(envelope)).await
    }
}
