//! Batched attribute reads.

use crate::connection::ConnectionManager;
use crate::node_id::NodeId;
use crate::transport::ReadValueId;
use chrono::{SecondsFormat, Utc};
use opcua_bridge_core::{Attribute, AttributeSet};
use std::sync::Arc;

/// Reads a set of catalog attributes of one node in one request.
#[derive(Clone)]
pub struct AttributeReader {
    connections: Arc<ConnectionManager>,
}

impl AttributeReader {
    /// Create a reader on top of `connections`.
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Read `attributes` of `node_id`.
    ///
    /// Returns an empty set when the read fails as a whole. Attributes the
    /// server reports with a bad status are left out. `NodeId` is always
    /// present in a non-empty result and carries `node_id` verbatim.
    pub async fn read_attributes(&self, node_id: &str, attributes: &[Attribute]) -> AttributeSet {
        match self.try_read_attributes(node_id, attributes).await {
            Ok(event) => event,
            Err(ReadError::NotConnected) => AttributeSet::new(),
            Err(e) => {
                tracing::warn!(node_id, error = %e, "Attribute read failed");
                AttributeSet::new()
            }
        }
    }

    /// Like [`read_attributes`](Self::read_attributes) but reports why a
    /// read failed.
    ///
    /// # Errors
    ///
    /// Returns error if not connected, if `node_id` does not parse or if the
    /// read request fails.
    pub async fn try_read_attributes(
        &self,
        node_id: &str,
        attributes: &[Attribute],
    ) -> Result<AttributeSet, ReadError> {
        let connection = self.connections.connection().ok_or(ReadError::NotConnected)?;
        let parsed: NodeId = node_id
            .parse()
            .map_err(|e| ReadError::InvalidNodeId(format!("{node_id}: {e}")))?;

        let requested: Vec<(Attribute, ReadValueId)> = attributes
            .iter()
            .filter_map(|attribute| {
                attribute.attribute_id().map(|attribute_id| {
                    (
                        *attribute,
                        ReadValueId {
                            node_id: parsed.clone(),
                            attribute_id,
                        },
                    )
                })
            })
            .collect();

        let mut event = AttributeSet::new();

        if !requested.is_empty() {
            let request: Vec<ReadValueId> = requested.iter().map(|(_, r)| r.clone()).collect();
            let values = connection
                .session()
                .read(&request)
                .await
                .map_err(|e| ReadError::Transport(e.to_string()))?;

            if values.len() != requested.len() {
                tracing::warn!(
                    node_id,
                    requested = requested.len(),
                    returned = values.len(),
                    "Read returned an unexpected number of results"
                );
            }

            for ((attribute, _), value) in requested.iter().zip(values) {
                if !value.status.is_good() {
                    tracing::debug!(
                        node_id,
                        attribute = %attribute,
                        status = %value.status,
                        "Dropping attribute with bad status"
                    );
                    continue;
                }
                if let Some(raw) = value.value {
                    event.insert(*attribute, attribute.format(&raw));
                }
            }
        }

        if attributes.contains(&Attribute::Timestamp) {
            event.insert(
                Attribute::Timestamp,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        }
        event.insert(Attribute::NodeId, node_id);

        Ok(event)
    }
}

/// Errors for attribute reads.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReadError {
    /// No live connection
    #[error("not connected")]
    NotConnected,
    /// Node id does not parse
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
    /// The read request failed
    #[error("transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::StatusCode;
    use opcua_bridge_core::{AttributeId, RawValue};

    async fn connected() -> (Arc<MockTransport>, Arc<ConnectionManager>, AttributeReader) {
        let transport = Arc::new(MockTransport::new());
        let connections = Arc::new(ConnectionManager::new(transport.clone()));
        assert!(connections.connect("opc.tcp://plc:4840").await);
        let reader = AttributeReader::new(connections.clone());
        (transport, connections, reader)
    }

    #[tokio::test]
    async fn reads_and_formats_polled_attributes() {
        let (transport, _, reader) = connected().await;
        transport
            .session()
            .set_node("ns=2;s=Temp", "Temp", "Temperature", "Room sensor", RawValue::Double(21.5));

        let event = reader
            .read_attributes("ns=2;s=Temp", &Attribute::POLLED)
            .await;

        assert_eq!(event.get(Attribute::NodeId), Some("ns=2;s=Temp"));
        assert_eq!(event.get(Attribute::BrowseName), Some("Temp"));
        assert_eq!(event.get(Attribute::DisplayName), Some("Temperature"));
        assert_eq!(event.get(Attribute::Description), Some("Room sensor"));
        assert_eq!(event.get(Attribute::Value), Some("21.5"));
        assert_eq!(transport.session().read_calls(), 1);
    }

    #[tokio::test]
    async fn bad_attributes_are_dropped_individually() {
        let (transport, _, reader) = connected().await;
        let session = transport.session();
        session.set_node("ns=2;s=Temp", "Temp", "Temperature", "Room sensor", RawValue::Double(21.5));
        session.set_status("ns=2;s=Temp", AttributeId::Description, StatusCode::BAD_ATTRIBUTE_ID_INVALID);
        session.set_status("ns=2;s=Temp", AttributeId::DisplayName, StatusCode(0x4000_0000));

        let event = reader
            .read_attributes("ns=2;s=Temp", &Attribute::POLLED)
            .await;

        assert_eq!(event.len(), 3);
        assert_eq!(event.get(Attribute::NodeId), Some("ns=2;s=Temp"));
        assert_eq!(event.get(Attribute::BrowseName), Some("Temp"));
        assert_eq!(event.get(Attribute::Value), Some("21.5"));
        assert_eq!(event.get(Attribute::Description), None);
    }

    #[tokio::test]
    async fn node_id_is_injected_from_input() {
        let (transport, _, reader) = connected().await;
        transport
            .session()
            .set_value("i=2258", AttributeId::NodeId, RawValue::String("other".to_string()));

        let event = reader
            .read_attributes("i=2258", &[Attribute::NodeId])
            .await;
        assert_eq!(event.get(Attribute::NodeId), Some("i=2258"));
    }

    #[tokio::test]
    async fn timestamp_is_synthetic() {
        let (transport, _, reader) = connected().await;
        let event = reader
            .read_attributes("ns=1;i=5", &[Attribute::Timestamp])
            .await;

        assert_eq!(transport.session().read_calls(), 0);
        let stamp = event.get(Attribute::Timestamp).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[tokio::test]
    async fn whole_failure_is_empty() {
        let (transport, _, reader) = connected().await;
        transport.session().fail_reads(true);

        let event = reader
            .read_attributes("ns=2;s=Temp", &Attribute::POLLED)
            .await;
        assert!(event.is_empty());

        let err = reader
            .try_read_attributes("ns=2;s=Temp", &Attribute::POLLED)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::Transport(_)));
    }

    #[tokio::test]
    async fn unparseable_node_is_empty() {
        let (transport, _, reader) = connected().await;
        let event = reader.read_attributes("Temperature", &Attribute::POLLED).await;
        assert!(event.is_empty());
        assert_eq!(transport.session().read_calls(), 0);
    }

    #[tokio::test]
    async fn disconnected_reads_do_nothing() {
        let (transport, connections, reader) = connected().await;
        connections.disconnect().await;

        let event = reader
            .read_attributes("ns=2;s=Temp", &Attribute::POLLED)
            .await;
        assert!(event.is_empty());
        assert_eq!(transport.session().read_calls(), 0);
        assert!(matches!(
            reader.try_read_attributes("ns=2;s=Temp", &Attribute::POLLED).await,
            Err(ReadError::NotConnected)
        ));
    }
}
