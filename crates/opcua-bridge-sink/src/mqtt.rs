//! MQTT broker.
//!
//! Records are published with QoS 1 to `<topic>/<partition>/<key>`, where
//! `<key>` is the encoded record key in URL-safe base64 without padding.
//! Subscribers use `<topic>/#` or `<topic>/<partition>/+`. Offsets are
//! counted locally per partition. A record is outstanding from publish until its
//! PUBACK arrives; [`Broker::flush`] waits for all of them.

use crate::broker::{Broker, BrokerError, Record, RecordMetadata};
use crate::inflight::InFlight;
use crate::topic::TopicConfig;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

/// Connection settings for [`MqttBroker`].
#[derive(Debug, Clone)]
pub struct MqttBrokerConfig {
    /// Broker URL, e.g. `tcp://localhost:1883`
    pub url: String,
    /// MQTT client id
    pub client_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
}

impl Default for MqttBrokerConfig {
    fn default() -> Self {
        Self {
            url: "tcp://localhost:1883".to_string(),
            client_id: "opcua-bridge".to_string(),
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Broker publishing over MQTT.
pub struct MqttBroker {
    client: AsyncClient,
    offsets: Mutex<HashMap<(String, u32), u64>>,
    unacked: Arc<InFlight>,
    eventloop: JoinHandle<()>,
}

impl MqttBroker {
    /// Create the client and start driving its event loop.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(config: &MqttBrokerConfig) -> Result<Self, BrokerError> {
        let (host, port) = parse_mqtt_url(&config.url)?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(config.keep_alive);

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let unacked = Arc::new(InFlight::new());
        let eventloop = tokio::spawn(drive(eventloop, Arc::clone(&unacked)));

        Ok(Self {
            client,
            offsets: Mutex::new(HashMap::new()),
            unacked,
            eventloop,
        })
    }

    fn next_offset(&self, topic: &str, partition: u32) -> u64 {
        let mut offsets = self.offsets.lock().unwrap_or_else(PoisonError::into_inner);
        let next = offsets.entry((topic.to_string(), partition)).or_insert(0);
        let offset = *next;
        *next += 1;
        offset
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.eventloop.abort();
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn ensure_topic(&self, topic: &TopicConfig) -> Result<(), BrokerError> {
        // MQTT topics exist implicitly
        tracing::debug!(
            topic = %topic.name,
            partitions = topic.partitions,
            "Using MQTT topic tree"
        );
        Ok(())
    }

    async fn send(&self, record: Record) -> Result<RecordMetadata, BrokerError> {
        let topic = record_topic(&record);

        tracing::debug!(
            topic,
            payload_len = record.value.len(),
            "Publishing record"
        );

        self.unacked.begin();
        if let Err(e) = self
            .client
            .publish(&topic, QoS::AtLeastOnce, false, record.value.clone())
            .await
        {
            self.unacked.end();
            return Err(BrokerError::Send(e.to_string()));
        }

        let offset = self.next_offset(&record.topic, record.partition);
        Ok(RecordMetadata::for_record(&record, offset))
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        if self.eventloop.is_finished() && self.unacked.count() > 0 {
            return Err(BrokerError::Flush(format!(
                "event loop stopped with {} unacknowledged records",
                self.unacked.count()
            )));
        }
        self.unacked.wait_idle().await;
        Ok(())
    }
}

async fn drive(mut eventloop: EventLoop, unacked: Arc<InFlight>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                tracing::trace!(pkid = ack.pkid, "Publish acknowledged");
                unacked.end();
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("Connected to MQTT broker");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "MQTT error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Topic a partition is published to.
#[must_use]
pub fn partition_topic(topic: &str, partition: u32) -> String {
    format!("{topic}/{partition}")
}

/// Topic a record is published to, carrying its key as the last level.
#[must_use]
pub fn record_topic(record: &Record) -> String {
    format!(
        "{}/{}",
        partition_topic(&record.topic, record.partition),
        URL_SAFE_NO_PAD.encode(&record.key)
    )
}

/// Encoded record key carried by a topic built with [`record_topic`].
///
/// Returns `None` if the last level is not valid base64.
#[must_use]
pub fn topic_key(topic: &str) -> Option<Vec<u8>> {
    let segment = topic.rsplit('/').next()?;
    URL_SAFE_NO_PAD.decode(segment).ok()
}

/// Parse MQTT URL into host and port.
fn parse_mqtt_url(input: &str) -> Result<(String, u16), BrokerError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| BrokerError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(BrokerError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| BrokerError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BrokerError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port.parse().map_err(|_| {
            BrokerError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(BrokerError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}
