//! Final pipeline stage.

use crate::sink::PublishSink;
use opcua_bridge_core::{DomainMessage, MessagePipe};
use std::sync::Arc;

/// Hands every message to the [`PublishSink`] unchanged.
pub struct PublishPipe {
    sink: Arc<PublishSink>,
}

impl PublishPipe {
    /// Create the stage.
    pub fn new(sink: Arc<PublishSink>) -> Self {
        Self { sink }
    }
}

impl MessagePipe<DomainMessage> for PublishPipe {
    fn pipe(&self, item: DomainMessage) {
        self.sink.send(&item);
    }
}
