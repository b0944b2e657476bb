//! # OPC UA Bridge
//!
//! Publishes OPC UA value changes and polled values to a message broker.

use anyhow::Result;
use opcua_bridge_agent::{init_tracing, Bridge, BridgeConfig};
use opcua_bridge_source::{OpcUaClientConfig, OpcUaTransport};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting OPC UA bridge agent"
    );

    let config = BridgeConfig::from_env()?;
    let transport = OpcUaTransport::new(OpcUaClientConfig {
        application_uri: format!("urn:{}", config.aggregate_id),
        ..OpcUaClientConfig::default()
    });

    let bridge = Bridge::new(config, Arc::new(transport))?;
    bridge.run().await?;

    Ok(())
}
