//! Listener registry feeding a message pipeline.

use opcua_bridge_core::{
    Attribute, AttributeSet, CreateMessagePipe, DomainMessage, ListenerRegistry, LoggingListener,
    MessagePipe,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Collect(Mutex<Vec<DomainMessage>>);

impl MessagePipe<DomainMessage> for Collect {
    fn pipe(&self, item: DomainMessage) {
        self.0.lock().unwrap().push(item);
    }
}

#[test]
fn registry_drives_pipeline() {
    let collect = Arc::new(Collect::default());
    let registry = ListenerRegistry::new();
    registry.add(Arc::new(CreateMessagePipe::new(collect.clone(), "line-1")));
    registry.add(Arc::new(LoggingListener));

    registry.deliver(&AttributeSet::new());
    registry.deliver(
        &AttributeSet::new()
            .with(Attribute::NodeId, "ns=3;i=1001")
            .with(Attribute::BrowseName, "Pressure")
            .with(Attribute::Value, "4.2"),
    );

    let messages = collect.0.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload.browse_name, "Pressure");
    assert_eq!(messages[0].key().node_id, "ns=3;i=1001");
}

#[test]
fn removed_pipeline_stops_receiving() {
    let collect = Arc::new(Collect::default());
    let registry = ListenerRegistry::new();
    let id = registry.add(Arc::new(CreateMessagePipe::new(collect.clone(), "line-1")));

    let event = AttributeSet::new().with(Attribute::NodeId, "n1");
    registry.deliver(&event);
    assert!(registry.remove(id));
    registry.deliver(&event);

    assert_eq!(collect.0.lock().unwrap().len(), 1);
}
