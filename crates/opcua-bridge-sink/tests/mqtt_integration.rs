use opcua_bridge_core::{Attribute, AttributeSet, DomainMessage, PayloadFormat};
use opcua_bridge_sink::{topic_key, MqttBroker, MqttBrokerConfig, PublishSink, TopicConfig};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

fn parse_mqtt_url(url: &str) -> (String, u16) {
    let url = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);

    let parts: Vec<&str> = url.split(':').collect();

    let host = parts.first().copied().unwrap_or("localhost").to_string();
    let port = parts.get(1).and_then(|p| p.parse().ok()).unwrap_or(1883);

    (host, port)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_reaches_subscriber() {
    if std::env::var("OPCUA_BRIDGE_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set OPCUA_BRIDGE_INTEGRATION=1 to run");
        return;
    }

    let url = std::env::var("OPCUA_BRIDGE_BOOTSTRAP_SERVERS")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let (host, port) = parse_mqtt_url(&url);
    let suffix = std::process::id();
    let topic = TopicConfig::new(format!("opcua-bridge-it-{suffix}"), 1, 1);

    let mut sub_opts = MqttOptions::new(format!("sub-{suffix}"), host, port);
    sub_opts.set_keep_alive(Duration::from_secs(5));
    let (sub_client, mut sub_eventloop) = AsyncClient::new(sub_opts, 10);
    sub_client
        .subscribe(format!("{}/#", topic.name), QoS::AtLeastOnce)
        .await
        .unwrap();

    let (subscribed_tx, subscribed_rx) = oneshot::channel();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut subscribed_tx = Some(subscribed_tx);
        loop {
            match sub_eventloop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    if let Some(ready) = subscribed_tx.take() {
                        let _ = ready.send(());
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = tx.send((publish.topic.clone(), publish.payload.to_vec()));
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
    timeout(Duration::from_secs(5), subscribed_rx)
        .await
        .expect("subscription timed out")
        .unwrap();

    let broker = MqttBroker::new(&MqttBrokerConfig {
        url,
        client_id: format!("pub-{suffix}"),
        keep_alive: Duration::from_secs(5),
    })
    .unwrap();
    let sink = PublishSink::new(Arc::new(broker), topic.clone(), PayloadFormat::Json);
    sink.ensure_topic().await.unwrap();

    let event = AttributeSet::new()
        .with(Attribute::NodeId, "ns=2;s=Temp")
        .with(Attribute::Value, "21.5");
    let message = DomainMessage::from_attributes(&event, "integration").unwrap();
    sink.send(&message);
    timeout(Duration::from_secs(10), sink.flush())
        .await
        .expect("flush timed out")
        .unwrap();

    let (received_topic, payload) = timeout(Duration::from_secs(5), rx)
        .await
        .expect("no message received")
        .unwrap();
    assert!(received_topic.starts_with(&format!("{}/0/", topic.name)));
    let key: serde_json::Value =
        serde_json::from_slice(&topic_key(&received_topic).unwrap()).unwrap();
    assert_eq!(key, serde_json::json!({ "nodeId": "ns=2;s=Temp" }));
    let decoded = DomainMessage::decode(&payload, PayloadFormat::Json).unwrap();
    assert_eq!(decoded, message);
}
