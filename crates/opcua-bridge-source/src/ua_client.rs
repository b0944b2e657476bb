//! Transport over the `opcua` client stack.
//!
//! The `opcua` session API is blocking, so every service call runs on the
//! blocking pool. A session's publish loop runs on its own thread from
//! connect until disconnect. One data-change callback per subscription
//! routes notifications to the callback registered for the item's node.

use crate::node_id::{Identifier, NodeId};
use crate::transport::{
    DataChangeCallback, DataValue, EndpointDescription, MonitorRequest, MonitoredItemId,
    MonitoredItemResult, MonitoringMode, ReadValueId, SecurityMode, StatusCode, SubscriptionId,
    TransportError, UaSession, UaTransport,
};
use async_trait::async_trait;
use opcua::client::prelude::DataChangeCallback as UaDataChangeCallback;
use opcua::client::prelude::*;
use opcua::sync::RwLock as OpcUaRwLock;
use opcua::types as ua;
use opcua_bridge_core::RawValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

const LIFETIME_COUNT: u32 = 30;
const KEEP_ALIVE_COUNT: u32 = 10;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn blocking<T, F>(call: F) -> Result<T, TransportError>
where
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| TransportError::Service(format!("blocking call aborted: {e}")))?
}

/// Client settings for [`OpcUaTransport`].
#[derive(Debug, Clone)]
pub struct OpcUaClientConfig {
    /// Application name announced to the server
    pub application_name: String,
    /// Application URI announced to the server
    pub application_uri: String,
    /// Reconnect attempts made by the session
    pub session_retry_limit: i32,
}

impl Default for OpcUaClientConfig {
    fn default() -> Self {
        Self {
            application_name: "opcua-bridge".to_string(),
            application_uri: "urn:opcua-bridge".to_string(),
            session_retry_limit: 3,
        }
    }
}

/// [`UaTransport`] backed by the `opcua` crate.
pub struct OpcUaTransport {
    config: OpcUaClientConfig,
    discovered: Arc<Mutex<Vec<ua::EndpointDescription>>>,
}

impl OpcUaTransport {
    /// Create a transport with `config`.
    #[must_use]
    pub fn new(config: OpcUaClientConfig) -> Self {
        Self {
            config,
            discovered: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

fn build_client(config: &OpcUaClientConfig) -> Result<Client, String> {
    ClientBuilder::new()
        .application_name(config.application_name.as_str())
        .application_uri(config.application_uri.as_str())
        .create_sample_keypair(true)
        .trust_server_certs(true)
        .session_retry_limit(config.session_retry_limit)
        .client()
        .ok_or_else(|| "invalid client configuration".to_string())
}

#[async_trait]
impl UaTransport for OpcUaTransport {
    async fn discover_endpoints(
        &self,
        url: &str,
    ) -> Result<Vec<EndpointDescription>, TransportError> {
        let config = self.config.clone();
        let discovered = Arc::clone(&self.discovered);
        let url = url.to_string();
        blocking(move || {
            let client = build_client(&config).map_err(TransportError::Discovery)?;
            let endpoints = client
                .get_server_endpoints_from_url(url.as_str())
                .map_err(|e| TransportError::Discovery(format!("{url}: {e}")))?;
            let described = endpoints.iter().filter_map(from_ua_endpoint).collect();
            *lock(&discovered) = endpoints;
            Ok(described)
        })
        .await
    }

    async fn connect(
        &self,
        endpoint: &EndpointDescription,
    ) -> Result<Arc<dyn UaSession>, TransportError> {
        let matching = lock(&self.discovered)
            .iter()
            .find(|candidate| from_ua_endpoint(candidate).as_ref() == Some(endpoint))
            .cloned()
            .ok_or_else(|| {
                TransportError::Connect(format!("{} was not discovered", endpoint.url))
            })?;
        let config = self.config.clone();

        let session = blocking(move || {
            let mut client = build_client(&config).map_err(TransportError::Connect)?;
            let session = client
                .connect_to_endpoint(matching, IdentityToken::Anonymous)
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let stop = Session::run_async(Arc::clone(&session));
            Ok(OpcUaSession::new(session, stop))
        })
        .await?;

        tracing::debug!(url = %endpoint.url, "Opened OPC UA session");
        Ok(Arc::new(session))
    }
}

type Routes = Arc<Mutex<HashMap<NodeId, DataChangeCallback>>>;

/// Session opened by [`OpcUaTransport`].
pub struct OpcUaSession {
    session: Arc<OpcUaRwLock<Session>>,
    stop: Mutex<Option<oneshot::Sender<SessionCommand>>>,
    routes: Routes,
    items: Mutex<HashMap<(SubscriptionId, MonitoredItemId), NodeId>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl OpcUaSession {
    fn new(session: Arc<OpcUaRwLock<Session>>, stop: oneshot::Sender<SessionCommand>) -> Self {
        Self {
            session,
            stop: Mutex::new(Some(stop)),
            routes: Arc::new(Mutex::new(HashMap::new())),
            items: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn forget_items(&self, subscription: SubscriptionId, ids: &[MonitoredItemId]) {
        let mut items = lock(&self.items);
        let mut routes = lock(&self.routes);
        for id in ids {
            if let Some(node_id) = items.remove(&(subscription, *id)) {
                routes.remove(&node_id);
            }
        }
    }
}

fn service_error(e: ua::StatusCode) -> TransportError {
    TransportError::Service(e.to_string())
}

#[async_trait]
impl UaSession for OpcUaSession {
    async fn read(&self, nodes: &[ReadValueId]) -> Result<Vec<DataValue>, TransportError> {
        let session = Arc::clone(&self.session);
        let request: Vec<ua::ReadValueId> = nodes
            .iter()
            .map(|node| to_ua_read_value_id(&node.node_id, node.attribute_id.uid()))
            .collect();
        blocking(move || {
            let values = session
                .read()
                .read(&request, ua::TimestampsToReturn::Both, 0.0)
                .map_err(service_error)?;
            Ok(values.iter().map(from_ua_data_value).collect())
        })
        .await
    }

    async fn create_subscription(
        &self,
        publishing_interval: Duration,
    ) -> Result<SubscriptionId, TransportError> {
        let session = Arc::clone(&self.session);
        let routes = Arc::clone(&self.routes);
        let id = blocking(move || {
            let on_change = UaDataChangeCallback::new(move |changed: &[&MonitoredItem]| {
                for item in changed {
                    let node_id = from_ua_node_id(&item.item_to_monitor().node_id);
                    let route = lock(&routes).get(&node_id).cloned();
                    if let Some(route) = route {
                        route(&node_id, from_ua_data_value(item.last_value()));
                    }
                }
            });
            session
                .read()
                .create_subscription(
                    publishing_interval.as_secs_f64() * 1000.0,
                    LIFETIME_COUNT,
                    KEEP_ALIVE_COUNT,
                    0,
                    0,
                    true,
                    on_change,
                )
                .map_err(service_error)
        })
        .await?;

        let id = SubscriptionId(id);
        lock(&self.subscriptions).push(id);
        Ok(id)
    }

    async fn create_monitored_items(
        &self,
        subscription: SubscriptionId,
        requests: Vec<MonitorRequest>,
        on_change: DataChangeCallback,
    ) -> Result<Vec<MonitoredItemResult>, TransportError> {
        let node_ids: Vec<NodeId> = requests.iter().map(|r| r.node_id.clone()).collect();
        {
            let mut routes = lock(&self.routes);
            for node_id in &node_ids {
                routes.insert(node_id.clone(), Arc::clone(&on_change));
            }
        }

        let session = Arc::clone(&self.session);
        let to_create: Vec<ua::MonitoredItemCreateRequest> =
            requests.iter().map(to_ua_monitor_request).collect();
        let created = blocking(move || {
            session
                .read()
                .create_monitored_items(subscription.0, ua::TimestampsToReturn::Both, &to_create)
                .map_err(service_error)
        })
        .await;

        let created = match created {
            Ok(created) => created,
            Err(e) => {
                let mut routes = lock(&self.routes);
                for node_id in &node_ids {
                    routes.remove(node_id);
                }
                return Err(e);
            }
        };

        let mut results = Vec::with_capacity(node_ids.len());
        let mut items = lock(&self.items);
        let mut routes = lock(&self.routes);
        for (node_id, result) in node_ids.into_iter().zip(created) {
            let status = StatusCode(result.status_code.bits());
            let item_id = MonitoredItemId(result.monitored_item_id);
            if status.is_good() {
                items.insert((subscription, item_id), node_id.clone());
            } else {
                routes.remove(&node_id);
            }
            results.push(MonitoredItemResult {
                node_id,
                item_id,
                status,
            });
        }
        Ok(results)
    }

    async fn delete_monitored_items(
        &self,
        subscription: SubscriptionId,
        items: &[MonitoredItemId],
    ) -> Result<Vec<StatusCode>, TransportError> {
        let session = Arc::clone(&self.session);
        let ids: Vec<u32> = items.iter().map(|id| id.0).collect();
        let statuses = blocking(move || {
            session
                .read()
                .delete_monitored_items(subscription.0, &ids)
                .map_err(service_error)
        })
        .await?;

        self.forget_items(subscription, items);
        Ok(statuses
            .into_iter()
            .map(|status| StatusCode(status.bits()))
            .collect())
    }

    async fn delete_subscription(
        &self,
        subscription: SubscriptionId,
    ) -> Result<(), TransportError> {
        let session = Arc::clone(&self.session);
        blocking(move || {
            session
                .read()
                .delete_subscription(subscription.0)
                .map_err(service_error)
        })
        .await?;

        let owned: Vec<MonitoredItemId> = lock(&self.items)
            .keys()
            .filter(|(sub, _)| *sub == subscription)
            .map(|(_, item)| *item)
            .collect();
        self.forget_items(subscription, &owned);
        lock(&self.subscriptions).retain(|id| *id != subscription);
        Ok(())
    }

    fn subscriptions(&self) -> Vec<SubscriptionId> {
        lock(&self.subscriptions).clone()
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(stop) = lock(&self.stop).take() else {
            return Err(TransportError::Closed);
        };
        // The publish loop may already have exited.
        let _ = stop.send(SessionCommand::Stop);

        let session = Arc::clone(&self.session);
        blocking(move || {
            session.read().disconnect();
            Ok(())
        })
        .await?;

        lock(&self.routes).clear();
        lock(&self.items).clear();
        lock(&self.subscriptions).clear();
        Ok(())
    }
}

fn from_ua_endpoint(endpoint: &ua::EndpointDescription) -> Option<EndpointDescription> {
    let security_mode = match endpoint.security_mode {
        ua::MessageSecurityMode::None => SecurityMode::None,
        ua::MessageSecurityMode::Sign => SecurityMode::Sign,
        ua::MessageSecurityMode::SignAndEncrypt => SecurityMode::SignAndEncrypt,
        ua::MessageSecurityMode::Invalid => return None,
    };
    Some(EndpointDescription {
        url: endpoint.endpoint_url.as_ref().to_string(),
        security_mode,
        security_policy_uri: endpoint.security_policy_uri.as_ref().to_string(),
    })
}

fn to_ua_node_id(node_id: &NodeId) -> ua::NodeId {
    match &node_id.identifier {
        Identifier::Numeric(v) => ua::NodeId::new(node_id.namespace, *v),
        Identifier::String(v) => ua::NodeId::new(node_id.namespace, v.clone()),
        Identifier::Guid(v) => ua::NodeId::new(node_id.namespace, ua::Guid::from(*v)),
        Identifier::Opaque(v) => {
            ua::NodeId::new(node_id.namespace, ua::ByteString::from(v.as_slice()))
        }
    }
}

fn from_ua_node_id(node_id: &ua::NodeId) -> NodeId {
    let identifier = match &node_id.identifier {
        ua::Identifier::Numeric(v) => Identifier::Numeric(*v),
        ua::Identifier::String(v) => Identifier::String(v.as_ref().to_string()),
        ua::Identifier::Guid(v) => Identifier::Guid(uuid::Uuid::from_bytes(*v.as_bytes())),
        ua::Identifier::ByteString(v) => Identifier::Opaque(v.value.clone().unwrap_or_default()),
    };
    NodeId {
        namespace: node_id.namespace,
        identifier,
    }
}

fn to_ua_read_value_id(node_id: &NodeId, attribute_id: u32) -> ua::ReadValueId {
    ua::ReadValueId {
        node_id: to_ua_node_id(node_id),
        attribute_id,
        index_range: ua::UAString::null(),
        data_encoding: ua::QualifiedName::null(),
    }
}

fn to_ua_monitor_request(request: &MonitorRequest) -> ua::MonitoredItemCreateRequest {
    let monitoring_mode = match request.mode {
        MonitoringMode::Disabled => ua::MonitoringMode::Disabled,
        MonitoringMode::Sampling => ua::MonitoringMode::Sampling,
        MonitoringMode::Reporting => ua::MonitoringMode::Reporting,
    };
    ua::MonitoredItemCreateRequest {
        item_to_monitor: to_ua_read_value_id(&request.node_id, request.attribute_id.uid()),
        monitoring_mode,
        requested_parameters: ua::MonitoringParameters {
            client_handle: request.client_handle,
            sampling_interval: request.sampling_interval.as_secs_f64() * 1000.0,
            filter: ua::ExtensionObject::null(),
            queue_size: request.queue_size,
            discard_oldest: request.discard_oldest,
        },
    }
}

fn from_ua_data_value(value: &ua::DataValue) -> DataValue {
    DataValue {
        value: value.value.as_ref().map(from_ua_variant),
        status: value
            .status
            .map_or(StatusCode::GOOD, |status| StatusCode(status.bits())),
    }
}

fn text(value: &ua::UAString) -> String {
    value.as_ref().to_string()
}

fn from_ua_variant(variant: &ua::Variant) -> RawValue {
    match variant {
        ua::Variant::Empty => RawValue::Null,
        ua::Variant::Boolean(v) => RawValue::Boolean(*v),
        ua::Variant::SByte(v) => RawValue::Int(i64::from(*v)),
        ua::Variant::Int16(v) => RawValue::Int(i64::from(*v)),
        ua::Variant::Int32(v) => RawValue::Int(i64::from(*v)),
        ua::Variant::Int64(v) => RawValue::Int(*v),
        ua::Variant::Byte(v) => RawValue::UInt(u64::from(*v)),
        ua::Variant::UInt16(v) => RawValue::UInt(u64::from(*v)),
        ua::Variant::UInt32(v) => RawValue::UInt(u64::from(*v)),
        ua::Variant::UInt64(v) => RawValue::UInt(*v),
        ua::Variant::Float(v) => RawValue::Float(*v),
        ua::Variant::Double(v) => RawValue::Double(*v),
        ua::Variant::String(v) => RawValue::String(text(v)),
        ua::Variant::DateTime(v) => RawValue::DateTime(v.as_chrono()),
        ua::Variant::Guid(v) => RawValue::Guid(uuid::Uuid::from_bytes(*v.as_bytes())),
        ua::Variant::ByteString(v) => RawValue::ByteString(v.value.clone().unwrap_or_default()),
        ua::Variant::QualifiedName(v) => RawValue::QualifiedName {
            namespace_index: v.namespace_index,
            name: text(&v.name),
        },
        ua::Variant::LocalizedText(v) => RawValue::LocalizedText {
            locale: (!v.locale.is_null()).then(|| text(&v.locale)),
            text: text(&v.text),
        },
        ua::Variant::Array(v) => RawValue::Array(v.values.iter().map(from_ua_variant).collect()),
        other => RawValue::String(format!("{other:?}")),
    }
}
