//! In-process broker.
//!
//! Keeps every record in memory, partitioned like a real log. Used for dry
//! runs and tests.

use crate::broker::{Broker, BrokerError, Record, RecordMetadata};
use crate::topic::TopicConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A record stored by [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Partition
    pub partition: u32,
    /// Offset within the partition
    pub offset: u64,
    /// Encoded key
    pub key: Vec<u8>,
    /// Encoded value
    pub value: Vec<u8>,
    /// Time the record was stored
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct TopicLog {
    config: TopicConfig,
    partitions: Vec<Vec<StoredRecord>>,
}

/// Broker keeping records in memory.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, TopicLog>>,
    fail_sends: AtomicBool,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every subsequent send.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Settings of an existing topic.
    #[must_use]
    pub fn topic(&self, name: &str) -> Option<TopicConfig> {
        self.topics().get(name).map(|log| log.config.clone())
    }

    /// Every record of a topic, ordered by partition then offset.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        self.topics()
            .get(topic)
            .map(|log| log.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicLog>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_topic(&self, topic: &TopicConfig) -> Result<(), BrokerError> {
        let mut topics = self.topics();
        if topics.contains_key(&topic.name) {
            tracing::debug!(topic = %topic.name, "Topic already exists");
        } else {
            topics.insert(
                topic.name.clone(),
                TopicLog {
                    config: topic.clone(),
                    partitions: vec![Vec::new(); topic.partitions as usize],
                },
            );
            tracing::info!(
                topic = %topic.name,
                partitions = topic.partitions,
                replication_factor = topic.replication_factor,
                "Topic created"
            );
        }
        Ok(())
    }

    async fn send(&self, record: Record) -> Result<RecordMetadata, BrokerError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BrokerError::Send("broker unavailable".to_string()));
        }

        let mut topics = self.topics();
        let log = topics
            .get_mut(&record.topic)
            .ok_or_else(|| BrokerError::UnknownTopic(record.topic.clone()))?;
        let partition = log
            .partitions
            .get_mut(record.partition as usize)
            .ok_or_else(|| BrokerError::InvalidPartition {
                topic: record.topic.clone(),
                partition: record.partition,
            })?;

        let metadata = RecordMetadata::for_record(&record, partition.len() as u64);
        partition.push(StoredRecord {
            partition: record.partition,
            offset: metadata.offset,
            key: record.key,
            value: record.value,
            timestamp: metadata.timestamp,
        });
        Ok(metadata)
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
