//! Publish sink.

use crate::broker::{Broker, Record};
use crate::inflight::InFlight;
use crate::topic::TopicConfig;
use opcua_bridge_core::{DomainMessage, PayloadFormat};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Sends domain messages to a broker without blocking the caller.
///
/// Each [`send`](Self::send) spawns the broker call and logs its outcome.
/// Failed sends are not retried.
pub struct PublishSink {
    broker: Arc<dyn Broker>,
    topic: TopicConfig,
    format: PayloadFormat,
    runtime: Handle,
    in_flight: Arc<InFlight>,
}

impl PublishSink {
    /// Create a sink publishing to `topic`.
    ///
    /// Must be called from within a tokio runtime; sends are spawned onto it.
    pub fn new(broker: Arc<dyn Broker>, topic: TopicConfig, format: PayloadFormat) -> Self {
        Self::with_handle(broker, topic, format, Handle::current())
    }

    /// Create a sink spawning sends onto `runtime`.
    pub fn with_handle(
        broker: Arc<dyn Broker>,
        topic: TopicConfig,
        format: PayloadFormat,
        runtime: Handle,
    ) -> Self {
        Self {
            broker,
            topic,
            format,
            runtime,
            in_flight: Arc::new(InFlight::new()),
        }
    }

    /// Topic settings.
    #[must_use]
    pub fn topic(&self) -> &TopicConfig {
        &self.topic
    }

    /// Number of sends not yet completed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Ask the broker to create the topic if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the broker cannot create the topic.
    pub async fn ensure_topic(&self) -> Result<(), SinkError> {
        self.broker
            .ensure_topic(&self.topic)
            .await
            .map_err(|e| SinkError::Topic(format!("{}: {e}", self.topic.name)))
    }

    /// Publish `message`, keyed and partitioned by its node id.
    pub fn send(&self, message: &DomainMessage) {
        let record = match self.record(message) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    node_id = %message.payload.node_id,
                    trace_id = %message.metadata.trace_id,
                    error = %e,
                    "Failed to encode message"
                );
                return;
            }
        };

        let guard = self.in_flight.track();
        let broker = Arc::clone(&self.broker);
        let trace_id = message.metadata.trace_id.clone();

        self.runtime.spawn(async move {
            let _guard = guard;
            match broker.send(record).await {
                Ok(metadata) => tracing::info!(
                    topic = %metadata.topic,
                    partition = metadata.partition,
                    offset = metadata.offset,
                    trace_id = %trace_id,
                    "Message published"
                ),
                Err(e) => tracing::error!(trace_id = %trace_id, error = %e, "Failed to publish message"),
            }
        });
    }

    /// Wait for every in-flight send to complete, then for the broker to
    /// acknowledge every outstanding record.
    ///
    /// # Errors
    ///
    /// Returns error if the broker flush fails.
    pub async fn flush(&self) -> Result<(), SinkError> {
        tracing::info!(in_flight = self.in_flight.count(), "Flushing publish sink");
        self.in_flight.wait_idle().await;
        self.broker
            .flush()
            .await
            .map_err(|e| SinkError::Flush(e.to_string()))?;
        tracing::info!("Publish sink flushed");
        Ok(())
    }

    fn record(&self, message: &DomainMessage) -> Result<Record, SinkError> {
        let key = message.key();
        Ok(Record {
            topic: self.topic.name.clone(),
            partition: self.topic.partition_for(&key.node_id),
            key: key
                .encode(self.format)
                .map_err(|e| SinkError::Encode(e.to_string()))?,
            value: message
                .encode(self.format)
                .map_err(|e| SinkError::Encode(e.to_string()))?,
        })
    }
}

/// Errors for publish sink operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    /// Topic could not be ensured
    #[error("topic error: {0}")]
    Topic(String),
    /// Message could not be encoded
    #[error("encode error: {0}")]
    Encode(String),
    /// Flush failed
    #[error("flush error: {0}")]
    Flush(String),
}
