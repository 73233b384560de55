//! Broker message identifiers.

use std::fmt;

/// Key identifying a partition, used to keep sequences partition-local.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub topic: String,
    pub partition: i32,
}

/// Opaque position of a message at the broker, used for commit/rollback.
///
/// - `Offset`: log-structured brokers (Kafka). Ordered within a partition.
/// - `Token`: brokers that hand out opaque ids (MQTT packet id, AMQP delivery tag).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BrokerMessageIdentifier {
    Offset {
        topic: String,
        partition: i32,
        offset: i64,
    },
    Token(String),
}

impl BrokerMessageIdentifier {
    pub fn offset(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self::Offset {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    pub fn token(value: impl Into<String>) -> Self {
        Self::Token(value.into())
    }

    /// Partition this identifier belongs to, if the broker has partitions.
    pub fn partition_key(&self) -> Option<PartitionKey> {
        match self {
            Self::Offset {
                topic, partition, ..
            } => Some(PartitionKey {
                topic: topic.clone(),
                partition: *partition,
            }),
            Self::Token(_) => None,
        }
    }

    /// Compare positions. Only offsets of the same partition are comparable.
    pub fn compare(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (
                Self::Offset {
                    topic: t1,
                    partition: p1,
                    offset: o1,
                },
                Self::Offset {
                    topic: t2,
                    partition: p2,
                    offset: o2,
                },
            ) if t1 == t2 && p1 == p2 => Some(o1.cmp(o2)),
            _ => None,
        }
    }
}

impl fmt::Display for BrokerMessageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offset {
                topic,
                partition,
                offset,
            } => write!(f, "{}[{}]@{}", topic, partition, offset),
            Self::Token(value) => f.write_str(value),
        }
    }
}
