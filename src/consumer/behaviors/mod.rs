//! Built-in consumer behaviors.
//!
//! Sorted by index, the default pipeline runs:
//!
//! | index | behavior                  | role                                   |
//! |-------|---------------------------|----------------------------------------|
//! | 100   | [`ErrorPolicyBehavior`]     | rollback or skip failed messages       |
//! | 200   | [`ChunkSequencerBehavior`]  | reassemble chunked messages            |
//! | 300   | [`DeserializerBehavior`]    | decode bodies                          |
//! | 400   | [`BatchSequencerBehavior`]  | group envelopes into batches           |
//! | 1000  | [`SubscriberBehavior`]      | invoke the handler, then commit        |

mod batch;
mod chunks;
mod deserializer;
mod error_policy;
mod subscriber;

pub use batch::{BatchSequencerBehavior, BATCH_SEQUENCE_PREFIX};
pub use chunks::ChunkSequencerBehavior;
pub use deserializer::DeserializerBehavior;
pub use error_policy::ErrorPolicyBehavior;
pub use subscriber::SubscriberBehavior;

use std::sync::Arc;

use super::{ConsumerError, ConsumerPipelineContext};
use crate::pipeline::{Behavior, Pipeline, PipelineError};

pub const ERROR_POLICY_SORT_INDEX: i32 = 100;
pub const CHUNK_SEQUENCER_SORT_INDEX: i32 = 200;
pub const DESERIALIZER_SORT_INDEX: i32 = 300;
pub const BATCH_SEQUENCER_SORT_INDEX: i32 = 400;
pub const SUBSCRIBER_SORT_INDEX: i32 = 1000;

/// The default consumer pipeline.
pub fn consumer_pipeline() -> Pipeline<ConsumerPipelineContext> {
    let behaviors: Vec<Arc<dyn Behavior<ConsumerPipelineContext>>> = vec![
        Arc::new(SubscriberBehavior),
        Arc::new(BatchSequencerBehavior),
        Arc::new(DeserializerBehavior),
        Arc::new(ChunkSequencerBehavior),
        Arc::new(ErrorPolicyBehavior),
    ];
    Pipeline::new(behaviors)
}

fn broker_error(operation: &'static str) -> impl Fn(ConsumerError) -> PipelineError {
    move |e| PipelineError::Broker {
        operation,
        message: e.to_string(),
    }
}
