//! Reassembly of chunked messages.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use tracing::{debug, warn};

use super::CHUNK_SEQUENCER_SORT_INDEX;
use crate::broker::{
    InboundEnvelope, CHUNKS_COUNT_HEADER, CHUNK_INDEX_HEADER, CHUNK_IS_LAST_HEADER,
    MESSAGE_ID_HEADER,
};
use crate::consumer::ConsumerPipelineContext;
use crate::pipeline::{Behavior, Next, Result};
use crate::sequence::{AbortReason, CompletionRule, Sequence, SequenceError, SequenceStream};

/// Routes chunks into a sequence per message id.
///
/// The first chunk starts a sequence and spawns the rest of the pipeline,
/// which waits for every chunk and continues with a single envelope
/// carrying the concatenated body. Starting a sequence aborts any other
/// chunk sequence still pending in the same store, since chunks of one
/// partition are never interleaved. The chunk completing the sequence
/// waits for that processing and returns its outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkSequencerBehavior;

impl ChunkSequencerBehavior {
    fn start_sequence(
        context: &ConsumerPipelineContext,
        message_id: &str,
        next: Next<ConsumerPipelineContext>,
    ) -> Arc<Sequence> {
        let store = context.sequence_store();

        for pending in store.get_pending_sequences() {
            if *pending.rule() == CompletionRule::Chunks
                && pending.abort(AbortReason::IncompleteSequence)
            {
                warn!(
                    sequence_id = %pending.id(),
                    length = pending.length(),
                    "Incomplete chunk sequence aborted"
                );
                store.remove(pending.id());
            }
        }

        let backpressure_limit = context.envelope().endpoint().backpressure_limit();
        let sequence = store.add(Sequence::chunks(message_id, None, backpressure_limit));
        sequence.set_context(context.clone());

        if let Some(stream) = sequence.take_stream() {
            let context = context.clone().with_sequence(Arc::clone(&sequence));
            sequence.set_processing_task(tokio::spawn(async move {
                let envelope = aggregate(stream).await?;
                next.run(context.with_envelope(envelope)).await
            }));
        }

        debug!(sequence_id = %message_id, "Chunk sequence started");
        sequence
    }
}

/// Read every chunk and merge them into one envelope.
///
/// Headers come from the first chunk without the chunk headers; the
/// identifier is the last chunk's.
async fn aggregate(
    mut stream: SequenceStream,
) -> std::result::Result<InboundEnvelope, SequenceError> {
    let mut body = BytesMut::new();
    let mut first: Option<InboundEnvelope> = None;
    let mut last_identifier = None;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Some(bytes) = chunk.body() {
            body.extend_from_slice(bytes);
        }
        last_identifier = Some(chunk.identifier().clone());
        if first.is_none() {
            first = Some(chunk);
        }
    }

    let (Some(first), Some(identifier)) = (first, last_identifier) else {
        return Err(SequenceError::StreamClosed {
            id: stream.sequence_id().to_string(),
        });
    };

    let mut headers = first.headers().clone();
    headers.remove(CHUNK_INDEX_HEADER);
    headers.remove(CHUNKS_COUNT_HEADER);
    headers.remove(CHUNK_IS_LAST_HEADER);

    let envelope = InboundEnvelope::new(
        Some(body.freeze()),
        headers,
        Arc::clone(first.endpoint()),
        first.actual_endpoint_name(),
        identifier,
    );

    Ok(match first.diagnostics() {
        Some(diagnostics) => envelope.with_diagnostics(diagnostics.clone()),
        None => envelope,
    })
}

#[async_trait]
impl Behavior<ConsumerPipelineContext> for ChunkSequencerBehavior {
    fn name(&self) -> &'static str {
        "chunk_sequencer"
    }

    fn sort_index(&self) -> i32 {
        CHUNK_SEQUENCER_SORT_INDEX
    }

    async fn handle(
        &self,
        context: ConsumerPipelineContext,
        next: Next<ConsumerPipelineContext>,
    ) -> Result<()> {
        let headers = context.envelope().headers();
        let (Some(message_id), Some(index)) = (
            headers.get(MESSAGE_ID_HEADER).map(str::to_string),
            headers.get_as::<usize>(CHUNK_INDEX_HEADER),
        ) else {
            return next.run(context).await;
        };

        let store = Arc::clone(context.sequence_store());
        let sequence = if index == 0 {
            Self::start_sequence(&context, &message_id, next)
        } else {
            match store.get(&message_id, false) {
                Some(sequence) => sequence,
                None => {
                    warn!(
                        message_id = %message_id,
                        index,
                        identifier = %context.envelope().identifier(),
                        "Chunk without a started sequence, ignoring"
                    );
                    return Ok(());
                }
            }
        };

        if let Err(e) = sequence.add(context.envelope().clone()).await {
            store.remove(sequence.id());
            return Err(e.into());
        }

        if sequence.is_complete() {
            store.remove(sequence.id());
            sequence.processing_completed().await?;
        }

        Ok(())
    }
}
