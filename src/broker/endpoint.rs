//! Endpoint descriptions.
//!
//! An endpoint is the immutable description of a topic/queue together with
//! the settings the consumer and producer need. Settings are validated once,
//! when the endpoint is built, so misconfiguration fails before any
//! connection attempt.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::serializer::{MessageSerializer, SerializerKind};

/// Default number of envelopes buffered in a sequence stream.
pub const DEFAULT_BACKPRESSURE_LIMIT: usize = 50;

/// Default number of partitions processed concurrently.
pub const DEFAULT_MAX_DEGREE_OF_PARALLELISM: usize = 1;

/// Default attempts before the error policy gives up on a message.
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 3;

/// Result type for endpoint configuration.
pub type Result<T> = std::result::Result<T, EndpointError>;

/// Invalid endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("Endpoint name must not be empty")]
    EmptyName,

    #[error("Endpoint '{endpoint}': max_degree_of_parallelism must be at least 1")]
    InvalidParallelism { endpoint: String },

    #[error("Endpoint '{endpoint}': backpressure_limit must be at least 1")]
    InvalidBackpressureLimit { endpoint: String },

    #[error("Endpoint '{endpoint}': batch size must be at least 1")]
    InvalidBatchSize { endpoint: String },

    #[error("Endpoint '{endpoint}': chunk size must be at least 1")]
    InvalidChunkSize { endpoint: String },
}

/// Batch settings for consumers that process messages in groups.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchSettings {
    /// Envelopes per batch.
    pub size: usize,
    /// Maximum time a batch stays open, in milliseconds.
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
}

impl BatchSettings {
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }
}

/// Endpoint configuration as read from config files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Topic or queue name.
    pub name: String,
    /// Serializer codec.
    pub serializer: SerializerKind,
    /// Partitions processed concurrently.
    pub max_degree_of_parallelism: usize,
    /// Envelopes buffered per sequence stream before `add` waits.
    pub backpressure_limit: usize,
    /// Keep one sequence store per partition.
    pub process_partitions_independently: bool,
    /// Group messages into batches.
    pub batch: Option<BatchSettings>,
    /// Split produced bodies larger than this into chunks.
    pub chunk_size: Option<usize>,
    /// Attempts before the error policy skips a message.
    pub max_failed_attempts: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            serializer: SerializerKind::default(),
            max_degree_of_parallelism: DEFAULT_MAX_DEGREE_OF_PARALLELISM,
            backpressure_limit: DEFAULT_BACKPRESSURE_LIMIT,
            process_partitions_independently: true,
            batch: None,
            chunk_size: None,
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
        }
    }
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Validate and build the endpoint.
    pub fn build(&self) -> Result<Endpoint> {
        if self.name.trim().is_empty() {
            return Err(EndpointError::EmptyName);
        }
        if self.max_degree_of_parallelism == 0 {
            return Err(EndpointError::InvalidParallelism {
                endpoint: self.name.clone(),
            });
        }
        if self.backpressure_limit == 0 {
            return Err(EndpointError::InvalidBackpressureLimit {
                endpoint: self.name.clone(),
            });
        }
        if matches!(&self.batch, Some(batch) if batch.size == 0) {
            return Err(EndpointError::InvalidBatchSize {
                endpoint: self.name.clone(),
            });
        }
        if self.chunk_size == Some(0) {
            return Err(EndpointError::InvalidChunkSize {
                endpoint: self.name.clone(),
            });
        }

        Ok(Endpoint {
            name: self.name.clone(),
            serializer: self.serializer.build(),
            max_degree_of_parallelism: self.max_degree_of_parallelism,
            backpressure_limit: self.backpressure_limit,
            process_partitions_independently: self.process_partitions_independently,
            batch: self.batch.clone(),
            chunk_size: self.chunk_size,
            max_failed_attempts: self.max_failed_attempts,
        })
    }
}

/// Immutable, validated endpoint.
#[derive(Clone)]
pub struct Endpoint {
    name: String,
    serializer: Arc<dyn MessageSerializer>,
    max_degree_of_parallelism: usize,
    backpressure_limit: usize,
    process_partitions_independently: bool,
    batch: Option<BatchSettings>,
    chunk_size: Option<usize>,
    max_failed_attempts: u32,
}

impl Endpoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serializer(&self) -> &Arc<dyn MessageSerializer> {
        &self.serializer
    }

    /// Partitions a transport's consume loop delivers concurrently.
    ///
    /// Read by transports; messages of one partition are always delivered
    /// one after another.
    pub fn max_degree_of_parallelism(&self) -> usize {
        self.max_degree_of_parallelism
    }

    pub fn backpressure_limit(&self) -> usize {
        self.backpressure_limit
    }

    pub fn process_partitions_independently(&self) -> bool {
        self.process_partitions_independently
    }

    pub fn batch(&self) -> Option<&BatchSettings> {
        self.batch.as_ref()
    }

    pub fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }

    pub fn max_failed_attempts(&self) -> u32 {
        self.max_failed_attempts
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("serializer", &self.serializer.name())
            .field("max_degree_of_parallelism", &self.max_degree_of_parallelism)
            .field("backpressure_limit", &self.backpressure_limit)
            .field(
                "process_partitions_independently",
                &self.process_partitions_independently,
            )
            .field("batch", &self.batch)
            .field("chunk_size", &self.chunk_size)
            .field("max_failed_attempts", &self.max_failed_attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_defaults() {
        let endpoint = EndpointConfig::new("orders").build().unwrap();
        assert_eq!(endpoint.name(), "orders");
        assert_eq!(endpoint.serializer().name(), "json");
        assert_eq!(endpoint.backpressure_limit(), DEFAULT_BACKPRESSURE_LIMIT);
        assert!(endpoint.process_partitions_independently());
        assert!(endpoint.batch().is_none());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert_eq!(
            EndpointConfig::new("  ").build().unwrap_err(),
            EndpointError::EmptyName
        );
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = EndpointConfig {
            backpressure_limit: 0,
            ..EndpointConfig::new("orders")
        };
        assert!(matches!(
            config.build(),
            Err(EndpointError::InvalidBackpressureLimit { .. })
        ));

        let config = EndpointConfig {
            max_degree_of_parallelism: 0,
            ..EndpointConfig::new("orders")
        };
        assert!(matches!(
            config.build(),
            Err(EndpointError::InvalidParallelism { .. })
        ));

        let config = EndpointConfig {
            batch: Some(BatchSettings {
                size: 0,
                max_wait_ms: None,
            }),
            ..EndpointConfig::new("orders")
        };
        assert!(matches!(
            config.build(),
            Err(EndpointError::InvalidBatchSize { .. })
        ));

        let config = EndpointConfig {
            chunk_size: Some(0),
            ..EndpointConfig::new("orders")
        };
        assert!(matches!(
            config.build(),
            Err(EndpointError::InvalidChunkSize { .. })
        ));
    }

    #[test]
    fn test_batch_max_wait() {
        let batch = BatchSettings {
            size: 10,
            max_wait_ms: Some(250),
        };
        assert_eq!(batch.max_wait(), Some(Duration::from_millis(250)));
    }
}
