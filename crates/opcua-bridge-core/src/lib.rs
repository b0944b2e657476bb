//! # OPC UA Bridge Core
//!
//! Shared data model of the OPC UA bridge:
//!
//! - Attribute catalog and value formatting
//! - Attribute-set events produced by subscriptions and polling
//! - Domain messages and their JSON/CBOR encodings
//! - Listener registry fanning events out to consumers
//! - Message pipeline stages

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attribute;
pub mod event;
pub mod listener;
pub mod message;
pub mod pipe;

pub use attribute::{Attribute, AttributeId, RawValue};
pub use event::AttributeSet;
pub use listener::{AttributeListener, ListenerId, ListenerRegistry, LoggingListener};
pub use message::{DomainMessage, MessageError, MessageKey, Metadata, Payload, PayloadFormat};
pub use pipe::{CreateMessagePipe, MessagePipe};
