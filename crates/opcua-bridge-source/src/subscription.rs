//! Value-change monitoring.
//!
//! All monitored items of a connection share one subscription, created on
//! the first monitor request. Each value change triggers a re-read of the
//! node's descriptive attributes; the combined event goes to every
//! registered listener.

use crate::connection::{Connection, ConnectionManager, MonitoredNode};
use crate::node_id::NodeId;
use crate::reader::AttributeReader;
use crate::transport::{
    DataChangeCallback, DataValue, MonitorRequest, SubscriptionId, TransportError,
    PUBLISHING_INTERVAL,
};
use opcua_bridge_core::{Attribute, AttributeSet, ListenerRegistry};
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Nodes claimed by one `monitor_nodes` call until it has recorded its
/// results.
struct Reservation<'a> {
    pending: &'a Mutex<HashSet<NodeId>>,
    ids: Vec<NodeId>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut pending = lock(self.pending);
        for id in &self.ids {
            pending.remove(id);
        }
    }
}

/// Manages monitored items on the shared subscription.
pub struct SubscriptionCoordinator {
    connections: Arc<ConnectionManager>,
    reader: AttributeReader,
    listeners: Arc<ListenerRegistry>,
    client_handles: AtomicU32,
}

impl SubscriptionCoordinator {
    /// Create a coordinator delivering to `listeners`.
    pub fn new(
        connections: Arc<ConnectionManager>,
        reader: AttributeReader,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            connections,
            reader,
            listeners,
            client_handles: AtomicU32::new(1),
        }
    }

    /// Start monitoring the `Value` attribute of `node_ids`.
    ///
    /// Ids that do not parse or are already monitored are skipped. Does
    /// nothing while disconnected.
    pub async fn monitor_nodes(&self, node_ids: &[String]) {
        let Some(connection) = self.connections.connection() else {
            tracing::debug!("Not connected, skipping monitor request");
            return;
        };

        let mut inputs: HashMap<NodeId, String> = HashMap::new();
        let _reservation = {
            let monitored = connection.monitored.lock().await;
            let mut pending = lock(&connection.pending);
            for input in node_ids {
                match input.parse::<NodeId>() {
                    Ok(id) if monitored.contains_key(&id) || pending.contains(&id) => {
                        tracing::debug!(node_id = %input, "Node already monitored");
                    }
                    Ok(id) => {
                        inputs.entry(id).or_insert_with(|| input.clone());
                    }
                    Err(e) => {
                        tracing::warn!(node_id = %input, error = %e, "Skipping invalid node id");
                    }
                }
            }
            pending.extend(inputs.keys().cloned());
            Reservation {
                pending: &connection.pending,
                ids: inputs.keys().cloned().collect(),
            }
        };
        if inputs.is_empty() {
            return;
        }

        let subscription = match shared_subscription(&connection).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create subscription");
                return;
            }
        };

        let requests: Vec<MonitorRequest> = inputs
            .keys()
            .map(|id| {
                MonitorRequest::value(id.clone(), self.client_handles.fetch_add(1, Ordering::Relaxed))
            })
            .collect();

        let on_change = self.value_change_callback(inputs.clone());
        let results = match connection
            .session()
            .create_monitored_items(subscription, requests, on_change)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create monitored items");
                return;
            }
        };

        let mut monitored = connection.monitored.lock().await;
        for result in results {
            let input = inputs
                .get(&result.node_id)
                .cloned()
                .unwrap_or_else(|| result.node_id.to_string());
            if result.status.is_good() {
                tracing::info!(
                    node_id = %input,
                    item_id = result.item_id.0,
                    "Monitored item created"
                );
                monitored.insert(
                    result.node_id,
                    MonitoredNode {
                        input,
                        item: result.item_id,
                    },
                );
            } else {
                tracing::warn!(
                    node_id = %input,
                    status = %result.status,
                    "Failed to create monitored item"
                );
            }
        }
    }

    /// Stop monitoring `node_ids`.
    ///
    /// Ids that are not currently monitored are ignored.
    pub async fn unmonitor_nodes(&self, node_ids: &[String]) {
        let Some(connection) = self.connections.connection() else {
            return;
        };
        let Some(subscription) = connection.subscription() else {
            return;
        };

        let mut monitored = connection.monitored.lock().await;
        let targets: Vec<(NodeId, MonitoredNode)> = node_ids
            .iter()
            .filter_map(|input| input.parse::<NodeId>().ok())
            .filter_map(|id| monitored.get(&id).cloned().map(|node| (id, node)))
            .collect();
        if targets.is_empty() {
            return;
        }

        let items: Vec<_> = targets.iter().map(|(_, node)| node.item).collect();
        match connection
            .session()
            .delete_monitored_items(subscription, &items)
            .await
        {
            Ok(statuses) => {
                for ((id, node), status) in targets.into_iter().zip(statuses) {
                    if !status.is_good() {
                        tracing::warn!(
                            node_id = %node.input,
                            status = %status,
                            "Server reported failure deleting monitored item"
                        );
                    }
                    tracing::info!(node_id = %node.input, "Monitored item deleted");
                    monitored.remove(&id);
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to delete monitored items"),
        }
    }

    /// Ids of the currently monitored nodes, as passed to
    /// [`monitor_nodes`](Self::monitor_nodes).
    pub async fn monitored_nodes(&self) -> Vec<String> {
        let Some(connection) = self.connections.connection() else {
            return Vec::new();
        };
        let mut nodes: Vec<String> = connection
            .monitored
            .lock()
            .await
            .values()
            .map(|node| node.input.clone())
            .collect();
        nodes.sort();
        nodes
    }

    fn value_change_callback(&self, inputs: HashMap<NodeId, String>) -> DataChangeCallback {
        let runtime = Handle::current();
        let reader = self.reader.clone();
        let listeners = Arc::clone(&self.listeners);

        Arc::new(move |node_id: &NodeId, value: DataValue| {
            let input = inputs
                .get(node_id)
                .cloned()
                .unwrap_or_else(|| node_id.to_string());
            let reader = reader.clone();
            let listeners = Arc::clone(&listeners);

            runtime.spawn(async move {
                let event = changed_event(&reader, &input, &value).await;
                listeners.deliver(&event);
            });
        })
    }
}

async fn shared_subscription(connection: &Connection) -> Result<SubscriptionId, TransportError> {
    connection
        .subscription
        .get_or_try_init(|| async {
            let id = connection
                .session()
                .create_subscription(PUBLISHING_INTERVAL)
                .await?;
            tracing::info!(subscription_id = id.0, "Subscription created");
            Ok::<_, TransportError>(id)
        })
        .await
        .copied()
}

async fn changed_event(reader: &AttributeReader, node_id: &str, value: &DataValue) -> AttributeSet {
    let mut event = AttributeSet::new().with(Attribute::NodeId, node_id);
    event.merge(
        reader
            .read_attributes(node_id, &Attribute::DESCRIPTIVE)
            .await,
    );

    match (&value.value, value.status.is_good()) {
        (Some(raw), true) => event.insert(Attribute::Value, Attribute::Value.format(raw)),
        _ => tracing::warn!(node_id, status = %value.status, "Value change without a good value"),
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockSession, MockTransport};
    use crate::transport::UaSession;
    use opcua_bridge_core::RawValue;
    use std::time::Duration;

    struct Fixture {
        session: Arc<MockSession>,
        connections: Arc<ConnectionManager>,
        coordinator: Arc<SubscriptionCoordinator>,
        events: Arc<Mutex<Vec<AttributeSet>>>,
    }

    async fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let session = transport.session();
        let connections = Arc::new(ConnectionManager::new(transport));
        assert!(connections.connect("opc.tcp://plc:4840").await);

        let listeners = Arc::new(ListenerRegistry::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        listeners.add(Arc::new(move |event: &AttributeSet| {
            sink.lock().unwrap().push(event.clone());
        }));

        let coordinator = Arc::new(SubscriptionCoordinator::new(
            connections.clone(),
            AttributeReader::new(connections.clone()),
            listeners,
        ));
        Fixture {
            session,
            connections,
            coordinator,
            events,
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn monitors_value_with_expected_parameters() {
        let f = fixture().await;
        f.coordinator
            .monitor_nodes(&ids(&["ns=2;s=Temp", "ns=2;s=Pressure"]))
            .await;

        assert_eq!(f.session.subscription_calls(), 1);
        assert_eq!(f.session.monitored_item_count(), 2);
        let requests = f.session.last_monitor_requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.queue_size == 1 && r.discard_oldest));
        assert_eq!(
            f.coordinator.monitored_nodes().await,
            ids(&["ns=2;s=Pressure", "ns=2;s=Temp"])
        );
    }

    #[tokio::test]
    async fn subscription_is_reused() {
        let f = fixture().await;
        f.coordinator.monitor_nodes(&ids(&["ns=2;s=A"])).await;
        f.coordinator.monitor_nodes(&ids(&["ns=2;s=B"])).await;

        assert_eq!(f.session.subscription_calls(), 1);
        assert_eq!(f.session.monitored_item_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_first_monitors_create_one_subscription() {
        let f = fixture().await;
        f.session.set_subscription_delay(Duration::from_millis(20));

        let a = Arc::clone(&f.coordinator);
        let b = Arc::clone(&f.coordinator);
        let first = tokio::spawn(async move { a.monitor_nodes(&ids(&["ns=2;s=A"])).await });
        let second = tokio::spawn(async move { b.monitor_nodes(&ids(&["ns=2;s=B"])).await });
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(f.session.subscription_calls(), 1);
        assert_eq!(f.session.subscriptions().len(), 1);
        assert_eq!(f.session.monitored_item_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_monitors_of_one_node_create_one_item() {
        let f = fixture().await;
        f.session.set_subscription_delay(Duration::from_millis(20));

        let a = Arc::clone(&f.coordinator);
        let b = Arc::clone(&f.coordinator);
        let first = tokio::spawn(async move { a.monitor_nodes(&ids(&["ns=2;s=A"])).await });
        let second = tokio::spawn(async move { b.monitor_nodes(&ids(&["ns=2;s=A"])).await });
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(f.session.monitored_item_count(), 1);
        assert_eq!(f.coordinator.monitored_nodes().await, ids(&["ns=2;s=A"]));

        f.coordinator.unmonitor_nodes(&ids(&["ns=2;s=A"])).await;
        assert!(f.coordinator.monitored_nodes().await.is_empty());
        assert_eq!(f.session.monitored_item_count(), 0);
        assert_eq!(f.session.fire_value_change("ns=2;s=A", RawValue::Int(1)), 0);
    }

    #[tokio::test]
    async fn failed_creation_releases_reserved_nodes() {
        let f = fixture().await;
        f.session.reject_monitoring("ns=2;s=A");
        f.coordinator.monitor_nodes(&ids(&["ns=2;s=A"])).await;
        assert!(f.coordinator.monitored_nodes().await.is_empty());

        f.session.allow_monitoring("ns=2;s=A");
        f.coordinator.monitor_nodes(&ids(&["ns=2;s=A"])).await;
        assert_eq!(f.coordinator.monitored_nodes().await, ids(&["ns=2;s=A"]));
    }

    #[tokio::test]
    async fn invalid_and_rejected_nodes_do_not_affect_siblings() {
        let f = fixture().await;
        f.session.reject_monitoring("ns=2;s=Missing");

        f.coordinator
            .monitor_nodes(&ids(&["not a node", "ns=2;s=Missing", "ns=2;s=Temp"]))
            .await;

        assert_eq!(f.coordinator.monitored_nodes().await, ids(&["ns=2;s=Temp"]));
        assert_eq!(f.session.last_monitor_requests().len(), 2);
    }

    #[tokio::test]
    async fn value_change_emits_combined_event() {
        let f = fixture().await;
        f.session.set_node(
            "ns=2;s=Temp",
            "Temp",
            "Temperature",
            "Room sensor",
            RawValue::Double(20.0),
        );
        f.coordinator.monitor_nodes(&ids(&["ns=2;s=Temp"])).await;

        assert_eq!(f.session.fire_value_change("ns=2;s=Temp", RawValue::Double(21.5)), 1);
        settle().await;

        let events = f.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.get(Attribute::NodeId), Some("ns=2;s=Temp"));
        assert_eq!(event.get(Attribute::BrowseName), Some("Temp"));
        assert_eq!(event.get(Attribute::DisplayName), Some("Temperature"));
        assert_eq!(event.get(Attribute::Description), Some("Room sensor"));
        assert_eq!(event.get(Attribute::Value), Some("21.5"));
    }

    #[tokio::test]
    async fn unmonitor_removes_only_known_nodes() {
        let f = fixture().await;
        f.coordinator
            .monitor_nodes(&ids(&["ns=2;s=A", "ns=2;s=B"]))
            .await;

        f.coordinator
            .unmonitor_nodes(&ids(&["ns=2;s=A", "ns=2;s=Never"]))
            .await;

        assert_eq!(f.coordinator.monitored_nodes().await, ids(&["ns=2;s=B"]));
        assert_eq!(f.session.monitored_item_count(), 1);
        assert_eq!(f.session.fire_value_change("ns=2;s=A", RawValue::Int(1)), 0);
    }

    #[tokio::test]
    async fn unmonitor_unknown_leaves_set_unchanged() {
        let f = fixture().await;
        f.coordinator.monitor_nodes(&ids(&["ns=2;s=A"])).await;

        f.coordinator
            .unmonitor_nodes(&ids(&["ns=2;s=Never", "garbage"]))
            .await;

        assert_eq!(f.coordinator.monitored_nodes().await, ids(&["ns=2;s=A"]));
        assert_eq!(f.session.monitored_item_count(), 1);
    }

    #[tokio::test]
    async fn unmonitor_everything_keeps_subscription() {
        let f = fixture().await;
        f.coordinator.monitor_nodes(&ids(&["ns=2;s=A"])).await;
        f.coordinator.unmonitor_nodes(&ids(&["ns=2;s=A"])).await;

        assert!(f.coordinator.monitored_nodes().await.is_empty());
        assert_eq!(f.session.subscriptions().len(), 1);

        f.coordinator.monitor_nodes(&ids(&["ns=2;s=A"])).await;
        assert_eq!(f.session.subscription_calls(), 1);
    }

    #[tokio::test]
    async fn disconnected_monitor_is_noop() {
        let f = fixture().await;
        f.connections.disconnect().await;

        f.coordinator.monitor_nodes(&ids(&["ns=2;s=A"])).await;
        f.coordinator.unmonitor_nodes(&ids(&["ns=2;s=A"])).await;

        assert_eq!(f.session.subscription_calls(), 0);
        assert!(f.coordinator.monitored_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn reconnect_starts_with_fresh_subscription() {
        let f = fixture().await;
        f.coordinator.monitor_nodes(&ids(&["ns=2;s=A"])).await;

        assert!(f.connections.connect("opc.tcp://plc:4840").await);
        assert!(f.coordinator.monitored_nodes().await.is_empty());

        f.coordinator.monitor_nodes(&ids(&["ns=2;s=A"])).await;
        assert_eq!(f.session.subscription_calls(), 2);
        assert_eq!(f.session.subscriptions().len(), 1);
    }
}
