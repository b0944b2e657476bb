//! Connection lifecycle.
//!
//! At most one session is live at a time. Every other component asks the
//! manager for the current [`Connection`] on each operation and turns into
//! a no-op when there is none.

use crate::node_id::NodeId;
use crate::transport::{
    EndpointDescription, MonitoredItemId, SecurityMode, SubscriptionId, TransportError,
    UaSession, UaTransport,
};
use arc_swap::ArcSwapOption;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

/// A monitored node, keyed by its parsed id.
#[derive(Debug, Clone)]
pub(crate) struct MonitoredNode {
    /// The id as the caller wrote it
    pub(crate) input: String,
    pub(crate) item: MonitoredItemId,
}

/// One live session and the resources hanging off it.
pub struct Connection {
    session: Arc<dyn UaSession>,
    endpoint: EndpointDescription,
    pub(crate) subscription: OnceCell<SubscriptionId>,
    pub(crate) monitored: Mutex<HashMap<NodeId, MonitoredNode>>,
    /// Nodes whose monitored items are being created
    pub(crate) pending: std::sync::Mutex<HashSet<NodeId>>,
}

impl Connection {
    fn new(session: Arc<dyn UaSession>, endpoint: EndpointDescription) -> Self {
        Self {
            session,
            endpoint,
            subscription: OnceCell::new(),
            monitored: Mutex::new(HashMap::new()),
            pending: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// The session.
    #[must_use]
    pub fn session(&self) -> &Arc<dyn UaSession> {
        &self.session
    }

    /// The endpoint this session was opened on.
    #[must_use]
    pub fn endpoint(&self) -> &EndpointDescription {
        &self.endpoint
    }

    /// The shared subscription, if it was created.
    #[must_use]
    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription.get().copied()
    }
}

/// Owns the connection to one OPC UA server.
pub struct ConnectionManager {
    transport: Arc<dyn UaTransport>,
    current: ArcSwapOption<Connection>,
    lifecycle: Mutex<()>,
}

impl ConnectionManager {
    /// Create a disconnected manager.
    pub fn new(transport: Arc<dyn UaTransport>) -> Self {
        Self {
            transport,
            current: ArcSwapOption::empty(),
            lifecycle: Mutex::new(()),
        }
    }

    /// Connect to the server at `url`.
    ///
    /// Discovers the server's endpoints and opens a session on the first
    /// one without message security. An existing connection is closed
    /// first. Failures are logged and leave the manager disconnected.
    ///
    /// Returns `true` when connected.
    pub async fn connect(&self, url: &str) -> bool {
        let _guard = self.lifecycle.lock().await;
        self.close_current().await;

        match self.establish(url).await {
            Ok(connection) => {
                tracing::info!(
                    url,
                    endpoint = %connection.endpoint.url,
                    "Connected to OPC UA server"
                );
                self.current.store(Some(Arc::new(connection)));
                true
            }
            Err(e) => {
                tracing::error!(url, error = %e, "Failed to connect to OPC UA server");
                false
            }
        }
    }

    /// Delete every subscription on the connection and close it.
    ///
    /// Does nothing when already disconnected.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.close_current().await;
    }

    /// `true` while a session is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current.load().is_some()
    }

    /// The current connection.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.current.load_full()
    }

    async fn establish(&self, url: &str) -> Result<Connection, TransportError> {
        let endpoints = self.transport.discover_endpoints(url).await?;
        tracing::debug!(url, count = endpoints.len(), "Discovered endpoints");

        let endpoint = endpoints
            .into_iter()
            .find(|e| e.security_mode == SecurityMode::None)
            .ok_or_else(|| TransportError::NoSuitableEndpoint(url.to_string()))?;

        let session = self.transport.connect(&endpoint).await?;
        Ok(Connection::new(session, endpoint))
    }

    async fn close_current(&self) {
        let Some(connection) = self.current.swap(None) else {
            return;
        };

        for subscription in connection.session.subscriptions() {
            if let Err(e) = connection.session.delete_subscription(subscription).await {
                tracing::warn!(
                    subscription_id = subscription.0,
                    error = %e,
                    "Failed to delete subscription"
                );
            }
        }

        match connection.session.disconnect().await {
            Ok(()) => tracing::info!(endpoint = %connection.endpoint.url, "Disconnected"),
            Err(e) => tracing::warn!(error = %e, "Error while closing session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::PUBLISHING_INTERVAL;

    #[tokio::test]
    async fn selects_unsecured_endpoint() {
        let transport = Arc::new(MockTransport::with_endpoints(vec![
            EndpointDescription {
                url: "opc.tcp://plc:4840/secure".to_string(),
                security_mode: SecurityMode::SignAndEncrypt,
                security_policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
                    .to_string(),
            },
            EndpointDescription::unsecured("opc.tcp://plc:4840/open"),
        ]));
        let manager = ConnectionManager::new(transport.clone());

        assert!(manager.connect("opc.tcp://plc:4840").await);
        assert!(manager.is_connected());
        let connection = manager.connection().unwrap();
        assert_eq!(connection.endpoint().url, "opc.tcp://plc:4840/open");
        assert_eq!(transport.connected_endpoints(), vec!["opc.tcp://plc:4840/open"]);
    }

    #[tokio::test]
    async fn no_unsecured_endpoint_stays_disconnected() {
        let transport = Arc::new(MockTransport::with_endpoints(vec![EndpointDescription {
            url: "opc.tcp://plc:4840".to_string(),
            security_mode: SecurityMode::Sign,
            security_policy_uri: String::new(),
        }]));
        let manager = ConnectionManager::new(transport.clone());

        assert!(!manager.connect("opc.tcp://plc:4840").await);
        assert!(!manager.is_connected());
        assert!(transport.connected_endpoints().is_empty());
    }

    #[tokio::test]
    async fn failed_connect_stays_disconnected() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_connect(true);
        let manager = ConnectionManager::new(transport);

        assert!(!manager.connect("opc.tcp://plc:4840").await);
        assert!(manager.connection().is_none());
    }

    #[tokio::test]
    async fn failed_discovery_stays_disconnected() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_discovery(true);
        let manager = ConnectionManager::new(transport);

        assert!(!manager.connect("opc.tcp://plc:4840").await);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn disconnect_deletes_subscriptions_and_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let session = transport.session();
        let manager = ConnectionManager::new(transport);

        assert!(manager.connect("opc.tcp://plc:4840").await);
        session
            .create_subscription(PUBLISHING_INTERVAL)
            .await
            .unwrap();
        assert_eq!(session.subscriptions().len(), 1);

        manager.disconnect().await;
        assert!(!manager.is_connected());
        assert!(session.subscriptions().is_empty());
        assert_eq!(session.disconnect_calls(), 1);

        manager.disconnect().await;
        assert_eq!(session.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn reconnect_closes_previous_session() {
        let transport = Arc::new(MockTransport::new());
        let session = transport.session();
        let manager = ConnectionManager::new(transport.clone());

        assert!(manager.connect("opc.tcp://plc:4840").await);
        assert!(manager.connect("opc.tcp://plc:4840").await);

        assert_eq!(session.disconnect_calls(), 1);
        assert_eq!(transport.connected_endpoints().len(), 2);
        assert!(manager.is_connected());
    }
}
