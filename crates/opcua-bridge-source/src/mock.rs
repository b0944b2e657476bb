//! In-process OPC UA transport.
//!
//! Serves attribute values from a table, records every call and lets tests
//! fire value changes on monitored items. Available to other crates with
//! the `mock` feature.

use crate::node_id::NodeId;
use crate::transport::{
    DataChangeCallback, DataValue, EndpointDescription, MonitorRequest, MonitoredItemId,
    MonitoredItemResult, ReadValueId, StatusCode, SubscriptionId, TransportError, UaSession,
    UaTransport,
};
use async_trait::async_trait;
use opcua_bridge_core::{AttributeId, RawValue};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(node_id: &str) -> NodeId {
    node_id
        .parse()
        .unwrap_or_else(|_| NodeId::string(0, node_id))
}

/// Mock transport handing out a single shared [`MockSession`].
pub struct MockTransport {
    endpoints: Vec<EndpointDescription>,
    session: Arc<MockSession>,
    fail_discovery: AtomicBool,
    fail_connect: AtomicBool,
    connected: Mutex<Vec<String>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Transport offering one unsecured endpoint.
    #[must_use]
    pub fn new() -> Self {
        Self::with_endpoints(vec![EndpointDescription::unsecured("opc.tcp://mock:4840")])
    }

    /// Transport offering `endpoints`.
    #[must_use]
    pub fn with_endpoints(endpoints: Vec<EndpointDescription>) -> Self {
        Self {
            endpoints,
            session: Arc::new(MockSession::default()),
            fail_discovery: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            connected: Mutex::new(Vec::new()),
        }
    }

    /// The session returned by every successful connect.
    #[must_use]
    pub fn session(&self) -> Arc<MockSession> {
        Arc::clone(&self.session)
    }

    /// Make discovery fail.
    pub fn fail_discovery(&self, fail: bool) {
        self.fail_discovery.store(fail, Ordering::SeqCst);
    }

    /// Make connect fail.
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// URLs of every endpoint a session was opened on.
    #[must_use]
    pub fn connected_endpoints(&self) -> Vec<String> {
        lock(&self.connected).clone()
    }
}

#[async_trait]
impl UaTransport for MockTransport {
    async fn discover_endpoints(
        &self,
        url: &str,
    ) -> Result<Vec<EndpointDescription>, TransportError> {
        if self.fail_discovery.load(Ordering::SeqCst) {
            return Err(TransportError::Discovery(format!("{url}: unreachable")));
        }
        Ok(self.endpoints.clone())
    }

    async fn connect(
        &self,
        endpoint: &EndpointDescription,
    ) -> Result<Arc<dyn UaSession>, TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{}: refused", endpoint.url)));
        }
        lock(&self.connected).push(endpoint.url.clone());
        self.session.closed.store(false, Ordering::SeqCst);
        let session: Arc<dyn UaSession> = self.session.clone();
        Ok(session)
    }
}

struct Item {
    subscription: SubscriptionId,
    node_id: NodeId,
    on_change: DataChangeCallback,
}

/// Mock session backed by an attribute table.
#[derive(Default)]
pub struct MockSession {
    values: Mutex<HashMap<(NodeId, AttributeId), DataValue>>,
    rejected: Mutex<HashSet<NodeId>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    items: Mutex<HashMap<MonitoredItemId, Item>>,
    last_requests: Mutex<Vec<MonitorRequest>>,
    subscription_delay: Mutex<Duration>,
    next_id: AtomicU32,
    fail_reads: AtomicBool,
    closed: AtomicBool,
    read_calls: AtomicUsize,
    subscription_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
}

impl MockSession {
    /// Set one attribute of a node.
    pub fn set_value(&self, node_id: &str, attribute: AttributeId, value: RawValue) {
        lock(&self.values).insert((key(node_id), attribute), DataValue::good(value));
    }

    /// Make one attribute of a node report `status` without a value.
    pub fn set_status(&self, node_id: &str, attribute: AttributeId, status: StatusCode) {
        lock(&self.values).insert((key(node_id), attribute), DataValue::bad(status));
    }

    /// Set the descriptive attributes and the value of a node.
    pub fn set_node(
        &self,
        node_id: &str,
        browse_name: &str,
        display_name: &str,
        description: &str,
        value: RawValue,
    ) {
        let id = key(node_id);
        self.set_value(
            node_id,
            AttributeId::BrowseName,
            RawValue::QualifiedName {
                namespace_index: id.namespace,
                name: browse_name.to_string(),
            },
        );
        self.set_value(
            node_id,
            AttributeId::DisplayName,
            RawValue::LocalizedText {
                locale: Some("en".to_string()),
                text: display_name.to_string(),
            },
        );
        self.set_value(
            node_id,
            AttributeId::Description,
            RawValue::LocalizedText {
                locale: Some("en".to_string()),
                text: description.to_string(),
            },
        );
        self.set_value(node_id, AttributeId::Value, value);
    }

    /// Make every read fail as a whole.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Reject monitored item creation for a node.
    pub fn reject_monitoring(&self, node_id: &str) {
        lock(&self.rejected).insert(key(node_id));
    }

    /// Accept monitored item creation for a node again.
    pub fn allow_monitoring(&self, node_id: &str) {
        lock(&self.rejected).remove(&key(node_id));
    }

    /// Delay subscription creation.
    pub fn set_subscription_delay(&self, delay: Duration) {
        *lock(&self.subscription_delay) = delay;
    }

    /// Fire a value change on every monitored item of `node_id`.
    ///
    /// Returns the number of callbacks invoked.
    pub fn fire_value_change(&self, node_id: &str, value: RawValue) -> usize {
        let id = key(node_id);
        let callbacks: Vec<(NodeId, DataChangeCallback)> = lock(&self.items)
            .values()
            .filter(|item| item.node_id == id)
            .map(|item| (item.node_id.clone(), Arc::clone(&item.on_change)))
            .collect();

        for (node, callback) in &callbacks {
            callback(node, DataValue::good(value.clone()));
        }
        callbacks.len()
    }

    /// Number of live monitored items.
    #[must_use]
    pub fn monitored_item_count(&self) -> usize {
        lock(&self.items).len()
    }

    /// Monitor requests of the most recent creation call.
    #[must_use]
    pub fn last_monitor_requests(&self) -> Vec<MonitorRequest> {
        lock(&self.last_requests).clone()
    }

    /// Number of read calls.
    #[must_use]
    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Number of subscription creation calls.
    #[must_use]
    pub fn subscription_calls(&self) -> usize {
        self.subscription_calls.load(Ordering::SeqCst)
    }

    /// Number of disconnect calls.
    #[must_use]
    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl UaSession for MockSession {
    async fn read(&self, nodes: &[ReadValueId]) -> Result<Vec<DataValue>, TransportError> {
        self.ensure_open()?;
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TransportError::Service("read failed".to_string()));
        }

        let values = lock(&self.values);
        Ok(nodes
            .iter()
            .map(|n| {
                values
                    .get(&(n.node_id.clone(), n.attribute_id))
                    .cloned()
                    .unwrap_or_else(|| DataValue::bad(StatusCode::BAD_NODE_ID_UNKNOWN))
            })
            .collect())
    }

    async fn create_subscription(
        &self,
        _publishing_interval: Duration,
    ) -> Result<SubscriptionId, TransportError> {
        self.ensure_open()?;
        self.subscription_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.subscription_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let id = SubscriptionId(self.next_id());
        lock(&self.subscriptions).push(id);
        Ok(id)
    }

    async fn create_monitored_items(
        &self,
        subscription: SubscriptionId,
        requests: Vec<MonitorRequest>,
        on_change: DataChangeCallback,
    ) -> Result<Vec<MonitoredItemResult>, TransportError> {
        self.ensure_open()?;
        *lock(&self.last_requests) = requests.clone();
        let rejected = lock(&self.rejected).clone();

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let item_id = MonitoredItemId(self.next_id());
            let status = if rejected.contains(&request.node_id) {
                StatusCode::BAD_NODE_ID_UNKNOWN
            } else {
                lock(&self.items).insert(
                    item_id,
                    Item {
                        subscription,
                        node_id: request.node_id.clone(),
                        on_change: Arc::clone(&on_change),
                    },
                );
                StatusCode::GOOD
            };
            results.push(MonitoredItemResult {
                node_id: request.node_id,
                item_id,
                status,
            });
        }
        Ok(results)
    }

    async fn delete_monitored_items(
        &self,
        _subscription: SubscriptionId,
        items: &[MonitoredItemId],
    ) -> Result<Vec<StatusCode>, TransportError> {
        self.ensure_open()?;
        let mut live = lock(&self.items);
        Ok(items
            .iter()
            .map(|id| match live.remove(id) {
                Some(_) => StatusCode::GOOD,
                None => StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
            })
            .collect())
    }

    async fn delete_subscription(
        &self,
        subscription: SubscriptionId,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.subscriptions).retain(|s| *s != subscription);
        lock(&self.items).retain(|_, item| item.subscription != subscription);
        Ok(())
    }

    fn subscriptions(&self) -> Vec<SubscriptionId> {
        lock(&self.subscriptions).clone()
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
