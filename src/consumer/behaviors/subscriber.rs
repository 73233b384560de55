//! Application handler invocation.

use async_trait::async_trait;
use tracing::debug;

use super::{broker_error, SUBSCRIBER_SORT_INDEX};
use crate::consumer::{ConsumedMessage, ConsumerPipelineContext};
use crate::pipeline::{Behavior, Next, PipelineError, Result};
use crate::sequence::SequenceError;

/// Invokes the registered [`MessageHandler`](crate::consumer::MessageHandler)
/// and commits what it processed.
///
/// A context started by a batch hands the handler the batch stream; any
/// other context hands it the envelope. After the handler returns, the
/// single identifier or every member of the sequence is committed. A
/// sequence aborted while the handler was reading it is not committed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubscriberBehavior;

#[async_trait]
impl Behavior<ConsumerPipelineContext> for SubscriberBehavior {
    fn name(&self) -> &'static str {
        "subscriber"
    }

    fn sort_index(&self) -> i32 {
        SUBSCRIBER_SORT_INDEX
    }

    async fn handle(
        &self,
        context: ConsumerPipelineContext,
        next: Next<ConsumerPipelineContext>,
    ) -> Result<()> {
        let handler = context
            .services()
            .handler()
            .ok_or_else(|| PipelineError::Handler("no message handler registered".to_string()))?;

        let sequence = context.sequence().cloned();
        let message = match sequence.as_ref().and_then(|s| s.take_stream()) {
            Some(stream) => ConsumedMessage::Stream(stream),
            None => ConsumedMessage::Single(context.envelope().clone()),
        };

        handler
            .handle(message)
            .await
            .map_err(|e| PipelineError::Handler(e.to_string()))?;

        let identifiers = match &sequence {
            Some(sequence) => {
                if let Some(reason) = sequence.abort_reason() {
                    return Err(SequenceError::Aborted {
                        id: sequence.id().to_string(),
                        reason,
                    }
                    .into());
                }
                sequence.offsets()
            }
            None => vec![context.envelope().identifier().clone()],
        };

        context
            .consumer()
            .commit(&identifiers)
            .await
            .map_err(broker_error("commit"))?;
        debug!(count = identifiers.len(), "Message handled");

        next.run(context).await
    }
}
