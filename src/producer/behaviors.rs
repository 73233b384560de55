//! Built-in producer behaviors.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use super::ProducerPipelineContext;
use crate::broker::{OutboundEnvelope, CHUNKS_COUNT_HEADER, CHUNK_INDEX_HEADER, MESSAGE_ID_HEADER};
use crate::pipeline::{Behavior, Next, PipelineError, Result};

pub const CHUNKING_SORT_INDEX: i32 = 100;
pub const PRODUCE_STRATEGY_SORT_INDEX: i32 = 1000;

/// Splits bodies larger than the endpoint's chunk size.
///
/// Every chunk carries the same message id plus its index and the chunk
/// count, and goes through the rest of the pipeline in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkingBehavior;

fn split(body: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    (0..body.len())
        .step_by(chunk_size)
        .map(|start| body.slice(start..(start + chunk_size).min(body.len())))
        .collect()
}

#[async_trait]
impl Behavior<ProducerPipelineContext> for ChunkingBehavior {
    fn name(&self) -> &'static str {
        "chunking"
    }

    fn sort_index(&self) -> i32 {
        CHUNKING_SORT_INDEX
    }

    async fn handle(
        &self,
        context: ProducerPipelineContext,
        next: Next<ProducerPipelineContext>,
    ) -> Result<()> {
        let envelope = context.envelope();
        let (Some(chunk_size), Some(body)) = (envelope.endpoint().chunk_size(), envelope.body())
        else {
            return next.run(context).await;
        };
        if body.len() <= chunk_size {
            return next.run(context).await;
        }

        let chunks = split(body, chunk_size);
        let message_id = envelope
            .headers()
            .get(MESSAGE_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!(
            message_id = %message_id,
            chunks = chunks.len(),
            "Splitting message into chunks"
        );

        let count = chunks.len();
        let endpoint = envelope.endpoint().clone();
        let base_headers = envelope.headers().clone();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut headers = base_headers.clone();
            headers.add_or_replace(MESSAGE_ID_HEADER, &message_id);
            headers.add_or_replace(CHUNK_INDEX_HEADER, index);
            headers.add_or_replace(CHUNKS_COUNT_HEADER, count);

            let chunk = OutboundEnvelope::new(Some(chunk), headers, endpoint.clone());
            next.clone().run(context.clone().with_envelope(chunk)).await?;
        }

        Ok(())
    }
}

/// Hands every envelope to the produce strategy.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProduceStrategyBehavior;

#[async_trait]
impl Behavior<ProducerPipelineContext> for ProduceStrategyBehavior {
    fn name(&self) -> &'static str {
        "produce_strategy"
    }

    fn sort_index(&self) -> i32 {
        PRODUCE_STRATEGY_SORT_INDEX
    }

    async fn handle(
        &self,
        context: ProducerPipelineContext,
        next: Next<ProducerPipelineContext>,
    ) -> Result<()> {
        let produced = context
            .strategy()
            .produce(context.envelope().clone())
            .await
            .map_err(|e| PipelineError::Produce(e.to_string()))?;
        context.record(produced);

        next.run(context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_keeps_remainder() {
        let body = Bytes::from_static(b"abcdefgh");
        let chunks = split(&body, 3);
        assert_eq!(
            chunks,
            vec![
                Bytes::from_static(b"abc"),
                Bytes::from_static(b"def"),
                Bytes::from_static(b"gh"),
            ]
        );
    }

    #[test]
    fn test_split_exact_multiple() {
        let body = Bytes::from_static(b"abcdef");
        assert_eq!(split(&body, 2).len(), 3);
    }
}
