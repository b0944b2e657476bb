//! Bridge runtime orchestration.
//!
//! Startup order: topic, connection, listeners, monitored items, poller.
//! Shutdown runs the other way round and ends with the sink flush.

use crate::config::{BridgeConfig, BrokerType};
use anyhow::{Context, Result};
use opcua_bridge_core::{CreateMessagePipe, ListenerId, ListenerRegistry, LoggingListener};
use opcua_bridge_sink::{
    Broker, MemoryBroker, MqttBroker, MqttBrokerConfig, PublishPipe, PublishSink, TopicConfig,
};
use opcua_bridge_source::{
    AttributeReader, ConnectionManager, PollScheduler, SubscriptionCoordinator, UaTransport,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// The running bridge.
pub struct Bridge {
    config: BridgeConfig,
    connections: Arc<ConnectionManager>,
    listeners: Arc<ListenerRegistry>,
    coordinator: SubscriptionCoordinator,
    poller: PollScheduler,
    sink: Arc<PublishSink>,
    pipeline: Arc<CreateMessagePipe>,
    registered: Mutex<Vec<ListenerId>>,
}

impl Bridge {
    /// Create a bridge publishing to the broker named in `config`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the broker cannot be created.
    pub fn new(config: BridgeConfig, transport: Arc<dyn UaTransport>) -> Result<Self> {
        let broker: Arc<dyn Broker> = match config.broker.broker_type {
            BrokerType::Mqtt => Arc::new(
                MqttBroker::new(&MqttBrokerConfig {
                    url: config.broker.bootstrap_servers.clone(),
                    client_id: config.aggregate_id.clone(),
                    keep_alive: Duration::from_secs(30),
                })
                .context("Failed to create MQTT broker")?,
            ),
            BrokerType::Memory => Arc::new(MemoryBroker::new()),
        };
        Ok(Self::with_broker(config, transport, broker))
    }

    /// Create a bridge publishing to `broker`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_broker(
        config: BridgeConfig,
        transport: Arc<dyn UaTransport>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let topic = TopicConfig::new(
            config.broker.topic.clone(),
            config.broker.partitions,
            config.broker.replication_factor,
        );
        let sink = Arc::new(PublishSink::new(
            broker,
            topic,
            config.broker.payload_format,
        ));
        let pipeline = Arc::new(CreateMessagePipe::new(
            Arc::new(PublishPipe::new(Arc::clone(&sink))),
            config.aggregate_id.clone(),
        ));

        let connections = Arc::new(ConnectionManager::new(transport));
        let listeners = Arc::new(ListenerRegistry::new());
        let reader = AttributeReader::new(Arc::clone(&connections));
        let coordinator = SubscriptionCoordinator::new(
            Arc::clone(&connections),
            reader.clone(),
            Arc::clone(&listeners),
        );
        let poller = PollScheduler::new(reader, Arc::clone(&listeners));

        Self {
            config,
            connections,
            listeners,
            coordinator,
            poller,
            sink,
            pipeline,
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Connect and start both producers.
    ///
    /// A failed connection is logged and leaves the bridge running
    /// disconnected.
    ///
    /// # Errors
    ///
    /// Returns error if the topic cannot be ensured.
    pub async fn start(&self) -> Result<()> {
        tracing::info!(
            server = %self.config.source.server_url,
            broker = %self.config.broker.bootstrap_servers,
            schema_registry = ?self.config.broker.schema_registry,
            topic = %self.config.broker.topic,
            format = %self.config.broker.payload_format,
            "Starting OPC UA bridge"
        );

        self.sink
            .ensure_topic()
            .await
            .context("Failed to ensure topic")?;

        if !self.connections.connect(&self.config.source.server_url).await {
            tracing::warn!("Continuing without an OPC UA connection");
        }

        {
            let mut registered = self
                .registered
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if registered.is_empty() {
                registered.push(self.listeners.add(self.pipeline.clone()));
                registered.push(self.listeners.add(Arc::new(LoggingListener)));
            }
        }

        self.coordinator
            .monitor_nodes(&self.config.source.nodes)
            .await;

        if self.config.polling.enabled {
            self.poller
                .start(self.config.polling.nodes.clone(), self.config.polling.interval);
        }

        tracing::info!("OPC UA bridge running");
        Ok(())
    }

    /// Stop polling, disconnect and flush the sink.
    ///
    /// # Errors
    ///
    /// Returns error if the flush fails or does not finish within the
    /// configured timeout.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down OPC UA bridge");

        self.poller.stop();
        self.connections.disconnect().await;

        tokio::time::timeout(self.config.flush_timeout, self.sink.flush())
            .await
            .with_context(|| {
                format!(
                    "Flush did not complete within {}s",
                    self.config.flush_timeout.as_secs()
                )
            })?
            .context("Failed to flush publish sink")?;

        let registered = std::mem::take(
            &mut *self
                .registered
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for id in registered {
            self.listeners.remove(id);
        }

        tracing::info!("OPC UA bridge stopped");
        Ok(())
    }

    /// Start, wait for Ctrl+C, then shut down.
    ///
    /// # Errors
    ///
    /// Returns error if startup or shutdown fails.
    pub async fn run(self) -> Result<()> {
        self.start().await?;

        tracing::info!("Press Ctrl+C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;

        self.shutdown().await
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Connection manager.
    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Listener registry fed by both producers.
    #[must_use]
    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    /// Subscription coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &SubscriptionCoordinator {
        &self.coordinator
    }

    /// Poll scheduler.
    #[must_use]
    pub fn poller(&self) -> &PollScheduler {
        &self.poller
    }

    /// Publish sink.
    #[must_use]
    pub fn sink(&self) -> &Arc<PublishSink> {
        &self.sink
    }
}
