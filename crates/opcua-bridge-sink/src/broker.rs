//! Broker boundary.

use crate::topic::TopicConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One keyed record bound for a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Topic name
    pub topic: String,
    /// Target partition
    pub partition: u32,
    /// Encoded key
    pub key: Vec<u8>,
    /// Encoded value
    pub value: Vec<u8>,
}

/// Where and when the broker stored a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Topic name
    pub topic: String,
    /// Partition
    pub partition: u32,
    /// Offset within the partition
    pub offset: u64,
    /// Time the broker accepted the record
    pub timestamp: DateTime<Utc>,
    /// Size of the encoded key
    pub serialized_key_size: usize,
    /// Size of the encoded value
    pub serialized_value_size: usize,
}

impl RecordMetadata {
    /// Metadata for `record` stored at `offset` now.
    #[must_use]
    pub fn for_record(record: &Record, offset: u64) -> Self {
        Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset,
            timestamp: Utc::now(),
            serialized_key_size: record.key.len(),
            serialized_value_size: record.value.len(),
        }
    }
}

/// A message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Make sure `topic` exists with the given settings.
    ///
    /// # Errors
    ///
    /// Returns error if the topic cannot be created.
    async fn ensure_topic(&self, topic: &TopicConfig) -> Result<(), BrokerError>;

    /// Send one record.
    ///
    /// # Errors
    ///
    /// Returns error if the broker does not accept the record.
    async fn send(&self, record: Record) -> Result<RecordMetadata, BrokerError>;

    /// Wait until every accepted record is acknowledged.
    ///
    /// # Errors
    ///
    /// Returns error if outstanding records cannot be confirmed.
    async fn flush(&self) -> Result<(), BrokerError>;
}

/// Errors reported by a broker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Invalid broker address
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Topic does not exist
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    /// Partition out of range
    #[error("partition {partition} out of range for topic {topic}")]
    InvalidPartition {
        /// Topic name
        topic: String,
        /// Requested partition
        partition: u32,
    },
    /// Send failed
    #[error("send error: {0}")]
    Send(String),
    /// Flush failed
    #[error("flush error: {0}")]
    Flush(String),
}
