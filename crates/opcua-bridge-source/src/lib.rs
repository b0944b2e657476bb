//! # OPC UA Bridge Source
//!
//! Observation side of the bridge:
//!
//! - Transport traits separating the bridge from the OPC UA protocol stack
//! - Connection lifecycle with endpoint selection
//! - Batched attribute reads
//! - Value-change monitoring on one shared subscription
//! - Fixed-rate polling
//!
//! Enable the `mock` feature for an in-process transport and the `opcua`
//! feature for a transport talking to real servers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod node_id;
pub mod poller;
pub mod reader;
pub mod subscription;
pub mod transport;
#[cfg(feature = "opcua")]
pub mod ua_client;

pub use connection::{Connection, ConnectionManager};
pub use node_id::{Identifier, NodeId, NodeIdError};
pub use poller::PollScheduler;
pub use reader::{AttributeReader, ReadError};
pub use subscription::SubscriptionCoordinator;
pub use transport::{
    DataChangeCallback, DataValue, EndpointDescription, MonitorRequest, MonitoredItemId,
    MonitoredItemResult, MonitoringMode, ReadValueId, SecurityMode, StatusCode, SubscriptionId,
    TransportError, UaSession, UaTransport,
};
#[cfg(feature = "opcua")]
pub use ua_client::{OpcUaClientConfig, OpcUaSession, OpcUaTransport};
