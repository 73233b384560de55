//! Broker-facing data model.
//!
//! This module contains:
//! - `Endpoint` / `EndpointConfig`: validated topic/queue descriptions
//! - `BrokerMessageIdentifier`: commit/rollback positions
//! - `MessageHeaders`: ordered, duplicate-permitting headers
//! - `InboundEnvelope` / `OutboundEnvelope`: raw messages
//! - `MessageSerializer`: codec collaborator used by the deserializer behavior

mod endpoint;
mod envelope;
mod headers;
mod identifier;
mod serializer;

pub use endpoint::{
    BatchSettings, Endpoint, EndpointConfig, EndpointError, DEFAULT_BACKPRESSURE_LIMIT,
    DEFAULT_MAX_DEGREE_OF_PARALLELISM, DEFAULT_MAX_FAILED_ATTEMPTS,
};
pub use envelope::{InboundEnvelope, OutboundEnvelope, SequenceInfo};
pub use headers::{
    MessageHeader, MessageHeaders, CHUNKS_COUNT_HEADER, CHUNK_INDEX_HEADER,
    CHUNK_IS_LAST_HEADER, FAILED_ATTEMPTS_HEADER, MESSAGE_ID_HEADER,
};
pub use identifier::{BrokerMessageIdentifier, PartitionKey};
pub use serializer::{
    JsonSerializer, MessageSerializer, RawSerializer, SerializerError, SerializerKind,
};
