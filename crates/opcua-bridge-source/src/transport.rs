//! OPC UA transport boundary.
//!
//! The bridge never speaks the OPC UA binary protocol itself. A transport
//! discovers endpoints and opens sessions; a session reads attributes and
//! manages subscriptions. Everything protocol-specific (secure channels,
//! framing, publish requests) lives behind these traits.

use crate::node_id::NodeId;
use async_trait::async_trait;
use opcua_bridge_core::{AttributeId, RawValue};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Publishing interval requested for the shared subscription.
pub const PUBLISHING_INTERVAL: Duration = Duration::from_millis(100);

/// Sampling interval requested for every monitored item.
pub const SAMPLING_INTERVAL: Duration = Duration::from_millis(100);

/// Message security mode of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityMode {
    /// No security
    None,
    /// Messages are signed
    Sign,
    /// Messages are signed and encrypted
    SignAndEncrypt,
}

/// An endpoint returned by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescription {
    /// Endpoint URL
    pub url: String,
    /// Security mode
    pub security_mode: SecurityMode,
    /// Security policy URI
    pub security_policy_uri: String,
}

impl EndpointDescription {
    /// Unsecured endpoint at `url`.
    #[must_use]
    pub fn unsecured(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            security_mode: SecurityMode::None,
            security_policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#None".to_string(),
        }
    }
}

/// OPC UA status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u32);

impl StatusCode {
    /// `Good`
    pub const GOOD: Self = Self(0);
    /// `BadNodeIdUnknown`
    pub const BAD_NODE_ID_UNKNOWN: Self = Self(0x8034_0000);
    /// `BadAttributeIdInvalid`
    pub const BAD_ATTRIBUTE_ID_INVALID: Self = Self(0x8035_0000);
    /// `BadMonitoredItemIdInvalid`
    pub const BAD_MONITORED_ITEM_ID_INVALID: Self = Self(0x8042_0000);

    /// Severity is good.
    #[must_use]
    pub fn is_good(self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    /// Severity is bad.
    #[must_use]
    pub fn is_bad(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// One value returned by a read or a data-change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DataValue {
    /// The value, absent when the status is bad
    pub value: Option<RawValue>,
    /// Status of this value
    pub status: StatusCode,
}

impl DataValue {
    /// Good value.
    #[must_use]
    pub fn good(value: RawValue) -> Self {
        Self {
            value: Some(value),
            status: StatusCode::GOOD,
        }
    }

    /// Value-less result with the given status.
    #[must_use]
    pub fn bad(status: StatusCode) -> Self {
        Self {
            value: None,
            status,
        }
    }
}

/// One entry of a batched read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadValueId {
    /// Node to read
    pub node_id: NodeId,
    /// Attribute to read
    pub attribute_id: AttributeId,
}

/// Server-assigned subscription id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u32);

/// Server-assigned monitored item id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitoredItemId(pub u32);

/// Monitoring mode of a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringMode {
    /// Sample and report
    Reporting,
    /// Sample only
    Sampling,
    /// Disabled
    Disabled,
}

/// Parameters of one monitored item to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRequest {
    /// Node to monitor
    pub node_id: NodeId,
    /// Attribute to monitor
    pub attribute_id: AttributeId,
    /// Monitoring mode
    pub mode: MonitoringMode,
    /// Client-assigned handle
    pub client_handle: u32,
    /// Sampling interval
    pub sampling_interval: Duration,
    /// Server-side queue size
    pub queue_size: u32,
    /// Drop the oldest queued notification on overflow
    pub discard_oldest: bool,
}

impl MonitorRequest {
    /// Report value changes of `node_id`.
    #[must_use]
    pub fn value(node_id: NodeId, client_handle: u32) -> Self {
        Self {
            node_id,
            attribute_id: AttributeId::Value,
            mode: MonitoringMode::Reporting,
            client_handle,
            sampling_interval: SAMPLING_INTERVAL,
            queue_size: 1,
            discard_oldest: true,
        }
    }
}

/// Outcome of one monitored item creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredItemResult {
    /// Node of the request
    pub node_id: NodeId,
    /// Server id of the created item
    pub item_id: MonitoredItemId,
    /// Creation status
    pub status: StatusCode,
}

/// Value-change callback.
///
/// Invoked from the transport's own I/O threads, possibly outside any
/// async runtime.
pub type DataChangeCallback = Arc<dyn Fn(&NodeId, DataValue) + Send + Sync>;

/// Entry point to an OPC UA server.
#[async_trait]
pub trait UaTransport: Send + Sync {
    /// List the endpoints offered at `url`.
    ///
    /// # Errors
    ///
    /// Returns error if discovery fails.
    async fn discover_endpoints(&self, url: &str)
        -> Result<Vec<EndpointDescription>, TransportError>;

    /// Open a session on `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be established.
    async fn connect(
        &self,
        endpoint: &EndpointDescription,
    ) -> Result<Arc<dyn UaSession>, TransportError>;
}

/// An established session.
#[async_trait]
pub trait UaSession: Send + Sync {
    /// Read a batch of attributes. Results are positional.
    ///
    /// # Errors
    ///
    /// Returns error if the whole request fails.
    async fn read(&self, nodes: &[ReadValueId]) -> Result<Vec<DataValue>, TransportError>;

    /// Create a subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the server rejects the subscription.
    async fn create_subscription(
        &self,
        publishing_interval: Duration,
    ) -> Result<SubscriptionId, TransportError>;

    /// Create monitored items on `subscription`. `on_change` is invoked for
    /// every value change of every created item.
    ///
    /// # Errors
    ///
    /// Returns error if the whole request fails.
    async fn create_monitored_items(
        &self,
        subscription: SubscriptionId,
        requests: Vec<MonitorRequest>,
        on_change: DataChangeCallback,
    ) -> Result<Vec<MonitoredItemResult>, TransportError>;

    /// Delete monitored items.
    ///
    /// # Errors
    ///
    /// Returns error if the whole request fails.
    async fn delete_monitored_items(
        &self,
        subscription: SubscriptionId,
        items: &[MonitoredItemId],
    ) -> Result<Vec<StatusCode>, TransportError>;

    /// Delete a subscription and its monitored items.
    ///
    /// # Errors
    ///
    /// Returns error if the server rejects the request.
    async fn delete_subscription(&self, subscription: SubscriptionId)
        -> Result<(), TransportError>;

    /// Subscriptions currently open on this session.
    fn subscriptions(&self) -> Vec<SubscriptionId>;

    /// Close the session.
    ///
    /// # Errors
    ///
    /// Returns error if closing fails.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Errors reported by a transport or session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Endpoint discovery failed
    #[error("discovery error: {0}")]
    Discovery(String),
    /// No endpoint with security mode None
    #[error("no unsecured endpoint offered by {0}")]
    NoSuitableEndpoint(String),
    /// Session could not be established
    #[error("connect error: {0}")]
    Connect(String),
    /// A service call failed
    #[error("service error: {0}")]
    Service(String),
    /// The session is closed
    #[error("session closed")]
    Closed,
}
