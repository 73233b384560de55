//! Retry-or-skip policy for failed messages.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use super::{broker_error, BATCH_SEQUENCE_PREFIX, ERROR_POLICY_SORT_INDEX};
use crate::broker::{BrokerMessageIdentifier, CHUNK_INDEX_HEADER, MESSAGE_ID_HEADER};
use crate::consumer::ConsumerPipelineContext;
use crate::pipeline::{Behavior, Next, Result};
use crate::sequence::Sequence;

/// Catches errors from the rest of the pipeline.
///
/// Below the endpoint's `max_failed_attempts` the message is rolled back
/// for redelivery; once the limit is reached it is committed and skipped.
/// When the failing message completed a sequence, the whole sequence is
/// rolled back or skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorPolicyBehavior;

/// Sequence the envelope may belong to, looked up before it is added.
fn owning_sequence(context: &ConsumerPipelineContext) -> Option<Arc<Sequence>> {
    let envelope = context.envelope();
    let headers = envelope.headers();
    if headers.contains(CHUNK_INDEX_HEADER) {
        let message_id = headers.get(MESSAGE_ID_HEADER)?;
        return context.sequence_store().get(message_id, false);
    }
    if envelope.endpoint().batch().is_some() {
        return context.sequence_store().get(BATCH_SEQUENCE_PREFIX, true);
    }
    None
}

#[async_trait]
impl Behavior<ConsumerPipelineContext> for ErrorPolicyBehavior {
    fn name(&self) -> &'static str {
        "error_policy"
    }

    fn sort_index(&self) -> i32 {
        ERROR_POLICY_SORT_INDEX
    }

    async fn handle(
        &self,
        context: ConsumerPipelineContext,
        next: Next<ConsumerPipelineContext>,
    ) -> Result<()> {
        let envelope = context.envelope().clone();
        let consumer = Arc::clone(context.consumer());
        let sequence = owning_sequence(&context);

        let error = match next.run(context).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let identifier = envelope.identifier();
        let identifiers: Vec<BrokerMessageIdentifier> = match sequence {
            Some(sequence) if sequence.offsets().contains(identifier) => sequence.offsets(),
            _ => vec![identifier.clone()],
        };

        let attempts = consumer.increment_failed_attempts(&envelope);
        let max_attempts = envelope.endpoint().max_failed_attempts();

        if attempts < max_attempts {
            warn!(
                consumer_id = %consumer.id(),
                identifier = %identifier,
                attempts,
                max_attempts,
                error = %error,
                "Message processing failed, rolling back"
            );
            consumer
                .rollback(&identifiers)
                .await
                .map_err(broker_error("rollback"))?;
        } else {
            error!(
                consumer_id = %consumer.id(),
                identifier = %identifier,
                attempts,
                error = %error,
                "Message processing failed too many times, skipping"
            );
            consumer
                .commit(&identifiers)
                .await
                .map_err(broker_error("commit"))?;
        }

        Ok(())
    }
}
