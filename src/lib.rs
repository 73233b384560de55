//! Switchyard - broker integration layer
//!
//! Connects an application to external message brokers through
//! broker-specific transports, and owns everything around them:
//! consumer lifecycle, behavior pipelines, chunk and batch sequences,
//! failed-attempt bookkeeping, commit and rollback.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod pipeline;
pub mod producer;
pub mod sequence;
pub mod test_utils;
pub mod utils;

pub use broker::{BrokerMessageIdentifier, Endpoint, EndpointConfig, MessageHeaders};
pub use consumer::{Consumer, ConsumerError};
pub use pipeline::{Behavior, Next, Pipeline, PipelineError};
pub use producer::{ProduceError, Producer};
