//! Attribute catalog.
//!
//! The bridge reads a fixed set of node attributes. Each [`Attribute`] has a
//! stable key used in published events, the OPC UA attribute id used to
//! address it on the wire (absent for synthetic attributes), and a formatter
//! turning the raw protocol value into its canonical string form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// OPC UA attribute identifiers (Part 6, `AttributeId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum AttributeId {
    /// `NodeId` attribute
    NodeId = 1,
    /// `BrowseName` attribute
    BrowseName = 3,
    /// `DisplayName` attribute
    DisplayName = 4,
    /// `Description` attribute
    Description = 5,
    /// `Value` attribute
    Value = 13,
}

impl AttributeId {
    /// Numeric id sent on the wire.
    #[must_use]
    pub fn uid(self) -> u32 {
        self as u32
    }
}

/// A raw attribute value as delivered by the protocol layer.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Boolean value
    Boolean(bool),
    /// Signed integer of any width
    Int(i64),
    /// Unsigned integer of any width
    UInt(u64),
    /// 32-bit float
    Float(f32),
    /// 64-bit double
    Double(f64),
    /// String value
    String(String),
    /// Date/time value
    DateTime(chrono::DateTime<chrono::Utc>),
    /// GUID value
    Guid(uuid::Uuid),
    /// Byte string
    ByteString(Vec<u8>),
    /// Qualified name (namespace-scoped browse name)
    QualifiedName {
        /// Namespace index
        namespace_index: u16,
        /// Name part
        name: String,
    },
    /// Localized text
    LocalizedText {
        /// Locale, e.g. `en`
        locale: Option<String>,
        /// Text part
        text: String,
    },
    /// Array of values
    Array(Vec<RawValue>),
    /// Empty variant
    Null,
}

fn write_non_finite(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    if v.is_nan() {
        f.write_str("NaN")
    } else if v > 0.0 {
        f.write_str("Infinity")
    } else {
        f.write_str("-Infinity")
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) if v.is_finite() => write!(f, "{v:?}"),
            Self::Double(v) if v.is_finite() => write!(f, "{v:?}"),
            Self::Float(v) => write_non_finite(f, f64::from(*v)),
            Self::Double(v) => write_non_finite(f, *v),
            Self::String(v) => f.write_str(v),
            Self::DateTime(v) => f.write_str(&v.to_rfc3339()),
            Self::Guid(v) => write!(f, "{v}"),
            Self::ByteString(v) => write!(f, "<{} bytes>", v.len()),
            Self::QualifiedName {
                namespace_index,
                name,
            } => write!(f, "{namespace_index}:{name}"),
            Self::LocalizedText { text, .. } => f.write_str(text),
            Self::Array(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
            Self::Null => f.write_str("null"),
        }
    }
}

/// The attributes the bridge knows how to read and publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Attribute {
    /// Node identity
    NodeId,
    /// Browse name
    BrowseName,
    /// Display name
    DisplayName,
    /// Description
    Description,
    /// Live value
    Value,
    /// Observation time (synthetic, never read from the server)
    Timestamp,
}

impl Attribute {
    /// Every catalog entry.
    pub const ALL: [Attribute; 6] = [
        Attribute::NodeId,
        Attribute::BrowseName,
        Attribute::DisplayName,
        Attribute::Description,
        Attribute::Value,
        Attribute::Timestamp,
    ];

    /// Attributes read when a node is polled.
    pub const POLLED: [Attribute; 4] = [
        Attribute::BrowseName,
        Attribute::Value,
        Attribute::DisplayName,
        Attribute::Description,
    ];

    /// Descriptive attributes re-read when a monitored value changes.
    pub const DESCRIPTIVE: [Attribute; 3] = [
        Attribute::BrowseName,
        Attribute::Description,
        Attribute::DisplayName,
    ];

    /// Stable key used in events and logs.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::NodeId => "NodeId",
            Self::BrowseName => "BrowseName",
            Self::DisplayName => "DisplayName",
            Self::Description => "Description",
            Self::Value => "Value",
            Self::Timestamp => "Timestamp",
        }
    }

    /// Look up an attribute by its key.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.key() == key)
    }

    /// Protocol attribute id, `None` for synthetic attributes.
    #[must_use]
    pub fn attribute_id(self) -> Option<AttributeId> {
        match self {
            Self::NodeId => Some(AttributeId::NodeId),
            Self::BrowseName => Some(AttributeId::BrowseName),
            Self::DisplayName => Some(AttributeId::DisplayName),
            Self::Description => Some(AttributeId::Description),
            Self::Value => Some(AttributeId::Value),
            Self::Timestamp => None,
        }
    }

    /// Format a raw protocol value into its canonical string.
    ///
    /// Naming attributes only accept their matching protocol type and
    /// format anything else as an empty string.
    #[must_use]
    pub fn format(self, value: &RawValue) -> String {
        match self {
            Self::BrowseName => match value {
                RawValue::QualifiedName { name, .. } => name.clone(),
                _ => String::new(),
            },
            Self::DisplayName | Self::Description => match value {
                RawValue::LocalizedText { text, .. } => text.clone(),
                _ => String::new(),
            },
            Self::NodeId | Self::Value | Self::Timestamp => value.to_string(),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
