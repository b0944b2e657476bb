//! Message pipeline stages.
//!
//! A stage receives one item, does its work and decides whether to hand
//! something to the next stage. Stages hold the next stage as a trait
//! object, so chains of any length can be assembled at startup.

use crate::event::AttributeSet;
use crate::listener::AttributeListener;
use crate::message::DomainMessage;
use std::sync::Arc;

/// One stage of the message pipeline.
pub trait MessagePipe<T>: Send + Sync {
    /// Process one item.
    fn pipe(&self, item: T);
}

/// First stage: turns attribute-set events into domain messages.
///
/// Empty or absent events are dropped. Every other event produces exactly
/// one message for the next stage.
pub struct CreateMessagePipe {
    next: Arc<dyn MessagePipe<DomainMessage>>,
    aggregate_id: String,
}

impl CreateMessagePipe {
    /// Create the stage in front of `next`.
    pub fn new(next: Arc<dyn MessagePipe<DomainMessage>>, aggregate_id: impl Into<String>) -> Self {
        Self {
            next,
            aggregate_id: aggregate_id.into(),
        }
    }

    /// Aggregate id stamped on every message.
    #[must_use]
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    fn create(&self, event: &AttributeSet) {
        let Some(message) = DomainMessage::from_attributes(event, &self.aggregate_id) else {
            tracing::debug!("Dropping empty event");
            return;
        };
        tracing::debug!(
            node_id = %message.payload.node_id,
            trace_id = %message.metadata.trace_id,
            "Created domain message"
        );
        self.next.pipe(message);
    }
}

impl MessagePipe<AttributeSet> for CreateMessagePipe {
    fn pipe(&self, item: AttributeSet) {
        self.create(&item);
    }
}

impl MessagePipe<Option<AttributeSet>> for CreateMessagePipe {
    fn pipe(&self, item: Option<AttributeSet>) {
        match item {
            Some(event) => self.create(&event),
            None => tracing::debug!("Dropping absent event"),
        }
    }
}

impl AttributeListener for CreateMessagePipe {
    fn on_attributes(&self, event: &AttributeSet) {
        self.create(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<DomainMessage>>);

    impl MessagePipe<DomainMessage> for Capture {
        fn pipe(&self, item: DomainMessage) {
            self.0.lock().unwrap().push(item);
        }
    }

    fn stage() -> (Arc<Capture>, CreateMessagePipe) {
        let capture = Arc::new(Capture::default());
        let stage = CreateMessagePipe::new(capture.clone(), "plant-7");
        (capture, stage)
    }

    #[test]
    fn empty_event_is_dropped() {
        let (capture, stage) = stage();
        stage.pipe(AttributeSet::new());
        assert!(capture.0.lock().unwrap().is_empty());
    }

    #[test]
    fn absent_event_is_dropped() {
        let (capture, stage) = stage();
        stage.pipe(None::<AttributeSet>);
        assert!(capture.0.lock().unwrap().is_empty());
    }

    #[test]
    fn one_event_yields_one_message() {
        let (capture, stage) = stage();
        let event = AttributeSet::new()
            .with(Attribute::NodeId, "ns=2;s=Temp")
            .with(Attribute::Value, "21.5");

        stage.pipe(Some(event));

        let messages = capture.0.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].metadata.aggregate_id, "plant-7");
        assert_eq!(messages[0].payload.node_id, "ns=2;s=Temp");
        assert_eq!(messages[0].payload.value, "21.5");
        assert_eq!(messages[0].payload.display_name, "");
    }

    #[test]
    fn trace_ids_are_unique() {
        let (capture, stage) = stage();
        let event = AttributeSet::new().with(Attribute::NodeId, "n1");
        for _ in 0..3 {
            stage.on_attributes(&event);
        }

        let messages = capture.0.lock().unwrap();
        let mut ids: Vec<_> = messages.iter().map(|m| m.metadata.trace_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }
}
