//! Bridge configuration.

use anyhow::{bail, Context, Result};
use opcua_bridge_core::PayloadFormat;
use std::str::FromStr;
use std::time::Duration;

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// OPC UA source configuration
    pub source: SourceConfig,

    /// Polling configuration
    pub polling: PollingConfig,

    /// Broker configuration
    pub broker: BrokerConfig,

    /// Aggregate id stamped on every message
    pub aggregate_id: String,

    /// Upper bound for the shutdown flush
    pub flush_timeout: Duration,
}

/// OPC UA source configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Endpoint address
    pub server_url: String,

    /// Nodes monitored for value changes
    pub nodes: Vec<String>,
}

/// Polling configuration.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Polling enabled
    pub enabled: bool,

    /// Polling interval
    pub interval: Duration,

    /// Nodes read on every tick
    pub nodes: Vec<String>,
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker implementation
    pub broker_type: BrokerType,

    /// Broker address
    pub bootstrap_servers: String,

    /// Schema registry address, passed through untouched
    pub schema_registry: Option<String>,

    /// Topic name
    pub topic: String,

    /// Topic partition count
    pub partitions: u32,

    /// Topic replication factor
    pub replication_factor: u16,

    /// Key and value encoding
    pub payload_format: PayloadFormat,
}

/// Broker implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerType {
    /// MQTT broker
    Mqtt,
    /// In-process broker
    Memory,
}

impl FromStr for BrokerType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(Self::Mqtt),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown broker type '{other}', expected 'mqtt' or 'memory'"),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig {
                server_url: "opc.tcp://localhost:4840".to_string(),
                nodes: Vec::new(),
            },
            polling: PollingConfig {
                enabled: false,
                interval: Duration::from_millis(1000),
                nodes: Vec::new(),
            },
            broker: BrokerConfig {
                broker_type: BrokerType::Mqtt,
                bootstrap_servers: "tcp://localhost:1883".to_string(),
                schema_registry: None,
                topic: "opcua-events".to_string(),
                partitions: 1,
                replication_factor: 1,
                payload_format: PayloadFormat::Json,
            },
            aggregate_id: "opcua-bridge".to_string(),
            flush_timeout: Duration::from_secs(30),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `OPCUA_BRIDGE_SERVER`: OPC UA endpoint address
    /// - `OPCUA_BRIDGE_NODES`: comma-separated monitored nodes
    /// - `OPCUA_BRIDGE_POLLING_ENABLED`: enable polling
    /// - `OPCUA_BRIDGE_POLLING_CYCLE_MS`: polling interval in milliseconds
    /// - `OPCUA_BRIDGE_POLLING_NODES`: comma-separated polled nodes
    /// - `OPCUA_BRIDGE_BROKER_TYPE`: "mqtt" or "memory"
    /// - `OPCUA_BRIDGE_BOOTSTRAP_SERVERS`: broker address
    /// - `OPCUA_BRIDGE_SCHEMA_REGISTRY`: schema registry address
    /// - `OPCUA_BRIDGE_TOPIC`: topic name
    /// - `OPCUA_BRIDGE_TOPIC_PARTITIONS`: topic partition count
    /// - `OPCUA_BRIDGE_TOPIC_REPLICATION`: topic replication factor
    /// - `OPCUA_BRIDGE_PAYLOAD_FORMAT`: "json" or "cbor"
    /// - `OPCUA_BRIDGE_AGGREGATE_ID`: aggregate id
    /// - `OPCUA_BRIDGE_FLUSH_TIMEOUT_SECS`: shutdown flush bound in seconds
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a value does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("OPCUA_BRIDGE_SERVER") {
            config.source.server_url = url;
        }

        if let Some(nodes) = lookup("OPCUA_BRIDGE_NODES") {
            config.source.nodes = parse_node_ids(&nodes);
        }

        if let Some(enabled) = lookup("OPCUA_BRIDGE_POLLING_ENABLED") {
            config.polling.enabled =
                parse_flag(&enabled).context("Invalid OPCUA_BRIDGE_POLLING_ENABLED")?;
        }

        if let Some(cycle) = lookup("OPCUA_BRIDGE_POLLING_CYCLE_MS") {
            let millis: u64 = cycle
                .trim()
                .parse()
                .context("Invalid OPCUA_BRIDGE_POLLING_CYCLE_MS")?;
            if millis == 0 {
                bail!("Invalid OPCUA_BRIDGE_POLLING_CYCLE_MS: must be positive");
            }
            config.polling.interval = Duration::from_millis(millis);
        }

        if let Some(nodes) = lookup("OPCUA_BRIDGE_POLLING_NODES") {
            config.polling.nodes = parse_node_ids(&nodes);
        }

        if let Some(broker_type) = lookup("OPCUA_BRIDGE_BROKER_TYPE") {
            config.broker.broker_type = broker_type
                .parse::<BrokerType>()
                .context("Invalid OPCUA_BRIDGE_BROKER_TYPE")?;
        }

        if let Some(servers) = lookup("OPCUA_BRIDGE_BOOTSTRAP_SERVERS") {
            config.broker.bootstrap_servers = servers;
        }

        if let Some(registry) = lookup("OPCUA_BRIDGE_SCHEMA_REGISTRY") {
            config.broker.schema_registry = Some(registry);
        }

        if let Some(topic) = lookup("OPCUA_BRIDGE_TOPIC") {
            config.broker.topic = topic;
        }

        if let Some(partitions) = lookup("OPCUA_BRIDGE_TOPIC_PARTITIONS") {
            config.broker.partitions = partitions
                .trim()
                .parse::<u32>()
                .context("Invalid OPCUA_BRIDGE_TOPIC_PARTITIONS")?;
        }

        if let Some(replication) = lookup("OPCUA_BRIDGE_TOPIC_REPLICATION") {
            config.broker.replication_factor = replication
                .trim()
                .parse::<u16>()
                .context("Invalid OPCUA_BRIDGE_TOPIC_REPLICATION")?;
        }

        if let Some(format) = lookup("OPCUA_BRIDGE_PAYLOAD_FORMAT") {
            config.broker.payload_format =
                format
                .parse::<PayloadFormat>()
                .context("Invalid OPCUA_BRIDGE_PAYLOAD_FORMAT")?;
        }

        if let Some(aggregate_id) = lookup("OPCUA_BRIDGE_AGGREGATE_ID") {
            config.aggregate_id = aggregate_id;
        }

        if let Some(timeout) = lookup("OPCUA_BRIDGE_FLUSH_TIMEOUT_SECS") {
            config.flush_timeout = Duration::from_secs(
                timeout
                    .trim()
                    .parse::<u64>()
                    .context("Invalid OPCUA_BRIDGE_FLUSH_TIMEOUT_SECS")?,
            );
        }

        Ok(config)
    }
}

/// Split a comma-separated node list, dropping blank entries.
#[must_use]
pub fn parse_node_ids(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.source.server_url, "opc.tcp://localhost:4840");
        assert!(config.source.nodes.is_empty());
        assert!(!config.polling.enabled);
        assert_eq!(config.polling.interval, Duration::from_secs(1));
        assert_eq!(config.broker.broker_type, BrokerType::Mqtt);
        assert_eq!(config.broker.topic, "opcua-events");
        assert_eq!(config.broker.payload_format, PayloadFormat::Json);
        assert_eq!(config.aggregate_id, "opcua-bridge");
        assert_eq!(config.flush_timeout, Duration::from_secs(30));
    }

    #[test]
    fn overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("OPCUA_BRIDGE_SERVER", "opc.tcp://plc:4840"),
            ("OPCUA_BRIDGE_NODES", "ns=2;s=A, ns=2;s=B"),
            ("OPCUA_BRIDGE_POLLING_ENABLED", "TRUE"),
            ("OPCUA_BRIDGE_POLLING_CYCLE_MS", "250"),
            ("OPCUA_BRIDGE_POLLING_NODES", "i=2258"),
            ("OPCUA_BRIDGE_BROKER_TYPE", "memory"),
            ("OPCUA_BRIDGE_SCHEMA_REGISTRY", "http://registry:8081"),
            ("OPCUA_BRIDGE_TOPIC_PARTITIONS", "6"),
            ("OPCUA_BRIDGE_TOPIC_REPLICATION", "3"),
            ("OPCUA_BRIDGE_PAYLOAD_FORMAT", "cbor"),
            ("OPCUA_BRIDGE_AGGREGATE_ID", "plant-7"),
        ]))
        .unwrap();

        assert_eq!(config.source.server_url, "opc.tcp://plc:4840");
        assert_eq!(config.source.nodes, vec!["ns=2;s=A", "ns=2;s=B"]);
        assert!(config.polling.enabled);
        assert_eq!(config.polling.interval, Duration::from_millis(250));
        assert_eq!(config.polling.nodes, vec!["i=2258"]);
        assert_eq!(config.broker.broker_type, BrokerType::Memory);
        assert_eq!(
            config.broker.schema_registry.as_deref(),
            Some("http://registry:8081")
        );
        assert_eq!(config.broker.partitions, 6);
        assert_eq!(config.broker.replication_factor, 3);
        assert_eq!(config.broker.payload_format, PayloadFormat::Cbor);
        assert_eq!(config.aggregate_id, "plant-7");
    }

    #[test]
    fn invalid_values_are_reported() {
        for (key, value) in [
            ("OPCUA_BRIDGE_POLLING_ENABLED", "maybe"),
            ("OPCUA_BRIDGE_POLLING_CYCLE_MS", "fast"),
            ("OPCUA_BRIDGE_POLLING_CYCLE_MS", "0"),
            ("OPCUA_BRIDGE_BROKER_TYPE", "kafka"),
            ("OPCUA_BRIDGE_TOPIC_PARTITIONS", "-1"),
            ("OPCUA_BRIDGE_PAYLOAD_FORMAT", "avro"),
        ] {
            let err = BridgeConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert!(err.to_string().contains(key), "{key}: {err}");
        }
    }

    #[test]
    fn node_list_parsing() {
        assert_eq!(
            parse_node_ids(" ns=2;s=A ,,ns=2;s=B, "),
            vec!["ns=2;s=A", "ns=2;s=B"]
        );
        assert!(parse_node_ids("").is_empty());
    }
}
