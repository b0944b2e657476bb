//! # OPC UA Bridge Sink
//!
//! Publish side of the bridge:
//!
//! - Broker trait with MQTT and in-memory implementations
//! - Record keys carried in the MQTT topic
//! - Topic settings and stable key partitioning
//! - Non-blocking publish sink with flush-on-shutdown
//! - Final pipeline stage feeding the sink

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod inflight;
pub mod memory;
pub mod mqtt;
pub mod pipe;
pub mod sink;
pub mod topic;

pub use broker::{Broker, BrokerError, Record, RecordMetadata};
pub use memory::{MemoryBroker, StoredRecord};
pub use mqtt::{record_topic, topic_key, MqttBroker, MqttBrokerConfig};
pub use pipe::PublishPipe;
pub use sink::{PublishSink, SinkError};
pub use topic::TopicConfig;
