//! Attribute-set events.

use crate::attribute::Attribute;
use std::collections::HashMap;

/// Formatted attribute values observed for one node in one read or
/// notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSet {
    values: HashMap<Attribute, String>,
}

impl AttributeSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, attribute: Attribute, value: impl Into<String>) {
        self.values.insert(attribute, value.into());
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, attribute: Attribute, value: impl Into<String>) -> Self {
        self.insert(attribute, value);
        self
    }

    /// Get a value.
    #[must_use]
    pub fn get(&self, attribute: Attribute) -> Option<&str> {
        self.values.get(&attribute).map(String::as_str)
    }

    /// Value or the empty string.
    #[must_use]
    pub fn get_or_empty(&self, attribute: Attribute) -> &str {
        self.get(attribute).unwrap_or_default()
    }

    /// The node this event belongs to, if known.
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        self.get(Attribute::NodeId)
    }

    /// Copy every value of `other` into this set, overwriting on conflict.
    pub fn merge(&mut self, other: AttributeSet) {
        self.values.extend(other.values);
    }

    /// `true` if no attribute is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of attributes present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Iterate over attribute/value pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (Attribute, &str)> {
        self.values.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

impl FromIterator<(Attribute, String)> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = (Attribute, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
