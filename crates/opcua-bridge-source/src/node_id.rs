//! OPC UA node identifiers.
//!
//! Textual form: `[ns=<index>;]<type>=<value>` where `<type>` is one of
//! `i` (numeric), `s` (string), `g` (GUID) or `b` (base64 opaque bytes).
//! Without the `ns=` prefix the namespace index is 0.

use base64::Engine;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier part of a node id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// `i=`
    Numeric(u32),
    /// `s=`
    String(String),
    /// `g=`
    Guid(Uuid),
    /// `b=`
    Opaque(Vec<u8>),
}

/// A parsed node id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    /// Namespace index
    pub namespace: u16,
    /// Identifier within the namespace
    pub identifier: Identifier,
}

impl NodeId {
    /// Numeric node id.
    #[must_use]
    pub fn numeric(namespace: u16, value: u32) -> Self {
        Self {
            namespace,
            identifier: Identifier::Numeric(value),
        }
    }

    /// String node id.
    #[must_use]
    pub fn string(namespace: u16, value: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: Identifier::String(value.into()),
        }
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let (namespace, rest) = match trimmed.strip_prefix("ns=") {
            Some(after) => {
                let (ns, rest) = after
                    .split_once(';')
                    .ok_or_else(|| NodeIdError::Malformed(input.to_string()))?;
                let ns = ns
                    .parse::<u16>()
                    .map_err(|_| NodeIdError::InvalidNamespace(ns.to_string()))?;
                (ns, rest)
            }
            None => (0, trimmed),
        };

        let (kind, value) = rest
            .split_once('=')
            .ok_or_else(|| NodeIdError::Malformed(input.to_string()))?;

        let identifier = match kind {
            "i" => Identifier::Numeric(
                value
                    .parse()
                    .map_err(|_| NodeIdError::InvalidIdentifier(value.to_string()))?,
            ),
            "s" => Identifier::String(value.to_string()),
            "g" => Identifier::Guid(
                Uuid::parse_str(value)
                    .map_err(|_| NodeIdError::InvalidIdentifier(value.to_string()))?,
            ),
            "b" => Identifier::Opaque(
                base64::engine::general_purpose::STANDARD
                    .decode(value)
                    .map_err(|_| NodeIdError::InvalidIdentifier(value.to_string()))?,
            ),
            other => return Err(NodeIdError::UnknownType(other.to_string())),
        };

        Ok(Self {
            namespace,
            identifier,
        })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != 0 {
            write!(f, "ns={};", self.namespace)?;
        }
        match &self.identifier {
            Identifier::Numeric(v) => write!(f, "i={v}"),
            Identifier::String(v) => write!(f, "s={v}"),
            Identifier::Guid(v) => write!(f, "g={v}"),
            Identifier::Opaque(v) => write!(
                f,
                "b={}",
                base64::engine::general_purpose::STANDARD.encode(v)
            ),
        }
    }
}

/// Errors for node id parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeIdError {
    /// Not of the form `[ns=<index>;]<type>=<value>`
    #[error("malformed node id: {0}")]
    Malformed(String),
    /// Namespace index is not a u16
    #[error("invalid namespace index: {0}")]
    InvalidNamespace(String),
    /// Identifier type is not one of `i`, `s`, `g`, `b`
    #[error("unknown identifier type: {0}")]
    UnknownType(String),
    /// Identifier does not match its type
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}
