//! Domain messages published by the bridge.
//!
//! ## Schema
//!
//! - key: `{nodeId}`
//! - value: `{metadata: {aggregateId, traceId, timestamp}, payload: {nodeId, browseName, displayName, description, value}}`

use crate::attribute::Attribute;
use crate::event::AttributeSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Message metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Deployment-wide identifier of the source system
    pub aggregate_id: String,
    /// Unique id of this message
    pub trace_id: String,
    /// Generation time
    pub timestamp: DateTime<Utc>,
}

impl Metadata {
    /// Fresh metadata with a new trace id and the current time.
    #[must_use]
    pub fn new(aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            trace_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Observed node data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Node identifier
    pub node_id: String,
    /// Browse name
    pub browse_name: String,
    /// Display name
    pub display_name: String,
    /// Description
    pub description: String,
    /// Formatted value
    pub value: String,
}

impl From<&AttributeSet> for Payload {
    fn from(event: &AttributeSet) -> Self {
        Self {
            node_id: event.get_or_empty(Attribute::NodeId).to_string(),
            browse_name: event.get_or_empty(Attribute::BrowseName).to_string(),
            display_name: event.get_or_empty(Attribute::DisplayName).to_string(),
            description: event.get_or_empty(Attribute::Description).to_string(),
            value: event.get_or_empty(Attribute::Value).to_string(),
        }
    }
}

/// A canonical record built from one attribute-set event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMessage {
    /// Message metadata
    pub metadata: Metadata,
    /// Node data
    pub payload: Payload,
}

impl DomainMessage {
    /// Build a message from an event.
    ///
    /// Returns `None` for an empty event.
    #[must_use]
    pub fn from_attributes(event: &AttributeSet, aggregate_id: &str) -> Option<Self> {
        if event.is_empty() {
            return None;
        }
        Some(Self {
            metadata: Metadata::new(aggregate_id),
            payload: Payload::from(event),
        })
    }

    /// The partitioning key of this message.
    #[must_use]
    pub fn key(&self) -> MessageKey {
        MessageKey {
            node_id: self.payload.node_id.clone(),
        }
    }

    /// Encode in the given format.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn encode(&self, format: PayloadFormat) -> Result<Vec<u8>, MessageError> {
        format.encode(self)
    }

    /// Decode from the given format.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn decode(bytes: &[u8], format: PayloadFormat) -> Result<Self, MessageError> {
        format.decode(bytes)
    }
}

/// Record key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Node identifier
    pub node_id: String,
}

impl MessageKey {
    /// Encode in the given format.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn encode(&self, format: PayloadFormat) -> Result<Vec<u8>, MessageError> {
        format.encode(self)
    }
}

/// Wire encoding for keys and values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// JSON with camelCase field names
    #[default]
    Json,
    /// CBOR
    Cbor,
}

impl PayloadFormat {
    fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, MessageError> {
        match self {
            Self::Json => {
                serde_json::to_vec(value).map_err(|e| MessageError::Serialize(e.to_string()))
            }
            Self::Cbor => {
                let mut bytes = Vec::new();
                ciborium::into_writer(value, &mut bytes)
                    .map_err(|e| MessageError::Serialize(e.to_string()))?;
                Ok(bytes)
            }
        }
    }

    fn decode<T: for<'de> Deserialize<'de>>(self, bytes: &[u8]) -> Result<T, MessageError> {
        match self {
            Self::Json => {
                serde_json::from_slice(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
            }
            Self::Cbor => {
                ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
            }
        }
    }
}

impl FromStr for PayloadFormat {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            other => Err(MessageError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Cbor => f.write_str("cbor"),
        }
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// Unknown payload format name
    #[error("unknown payload format: {0}")]
    UnknownFormat(String),
}
