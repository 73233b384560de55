//! Batch grouping.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::BATCH_SEQUENCER_SORT_INDEX;
use crate::broker::BatchSettings;
use crate::consumer::ConsumerPipelineContext;
use crate::pipeline::{Behavior, Next, Result};
use crate::sequence::{Sequence, SequenceError};

/// Prefix of batch sequence ids.
pub const BATCH_SEQUENCE_PREFIX: &str = "batch-";

/// Groups envelopes into batch sequences when the endpoint has batch
/// settings; otherwise passes through.
///
/// The first envelope of a batch spawns the rest of the pipeline with the
/// batch attached to the context, so the subscriber gets the batch stream.
/// The envelope completing the batch waits for that processing.
#[derive(Debug, Default, Clone, Copy)]
pub struct BatchSequencerBehavior;

impl BatchSequencerBehavior {
    fn start_batch(
        context: &ConsumerPipelineContext,
        settings: &BatchSettings,
        next: Next<ConsumerPipelineContext>,
    ) -> Arc<Sequence> {
        let id = format!("{BATCH_SEQUENCE_PREFIX}{}", Uuid::new_v4());
        let backpressure_limit = context.envelope().endpoint().backpressure_limit();
        let sequence = context.sequence_store().add(Sequence::batch(
            id,
            settings.size,
            settings.max_wait(),
            backpressure_limit,
        ));
        sequence.set_context(context.clone());

        let batch_context = context.clone().with_sequence(Arc::clone(&sequence));
        sequence.set_processing_task(tokio::spawn(next.run(batch_context)));

        debug!(sequence_id = %sequence.id(), size = settings.size, "Batch started");
        sequence
    }

    /// Release a batch that ended without an envelope waiting for it
    /// (completed by its timer, or aborted).
    async fn settle(context: &ConsumerPipelineContext, sequence: &Sequence) {
        context.sequence_store().remove(sequence.id());

        if let Err(e) = sequence.processing_completed().await {
            let offsets = sequence.offsets();
            warn!(
                sequence_id = %sequence.id(),
                count = offsets.len(),
                error = %e,
                "Batch processing failed, rolling back"
            );
            if let Err(e) = context.consumer().rollback(&offsets).await {
                warn!(sequence_id = %sequence.id(), error = %e, "Batch rollback failed");
            }
        }
    }
}

#[async_trait]
impl Behavior<ConsumerPipelineContext> for BatchSequencerBehavior {
    fn name(&self) -> &'static str {
        "batch_sequencer"
    }

    fn sort_index(&self) -> i32 {
        BATCH_SEQUENCER_SORT_INDEX
    }

    async fn handle(
        &self,
        context: ConsumerPipelineContext,
        next: Next<ConsumerPipelineContext>,
    ) -> Result<()> {
        let Some(settings) = context.envelope().endpoint().batch().cloned() else {
            return next.run(context).await;
        };

        loop {
            let current = match context.sequence_store().get(BATCH_SEQUENCE_PREFIX, true) {
                Some(sequence) if sequence.is_pending() => Some(sequence),
                Some(sequence) => {
                    Self::settle(&context, &sequence).await;
                    continue;
                }
                None => None,
            };

            let sequence = match current {
                Some(sequence) => sequence,
                None => Self::start_batch(&context, &settings, next.clone()),
            };

            match sequence.add(context.envelope().clone()).await {
                Ok(_) => {
                    if sequence.is_complete() {
                        context.sequence_store().remove(sequence.id());
                        sequence.processing_completed().await?;
                    }
                    return Ok(());
                }
                // Completed by its timer in the meantime: retry with a new batch.
                Err(SequenceError::NotPending { .. }) if sequence.is_complete() => continue,
                Err(e) => {
                    context.sequence_store().remove(sequence.id());
                    return Err(e.into());
                }
            }
        }
    }
}
