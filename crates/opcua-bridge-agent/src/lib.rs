//! # OPC UA Bridge Agent
//!
//! Wires the source, pipeline and sink into a running bridge:
//!
//! - Environment configuration
//! - Startup and orderly shutdown with a bounded sink flush
//! - Tracing setup
//!
//! The `opcua-bridge` binary needs the `opcua` feature.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod runtime;

pub use config::{BridgeConfig, BrokerConfig, BrokerType, PollingConfig, SourceConfig};
pub use runtime::Bridge;

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`.
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
}
