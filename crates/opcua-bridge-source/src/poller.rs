//! Fixed-rate polling.

use crate::reader::{AttributeReader, ReadError};
use opcua_bridge_core::{Attribute, ListenerRegistry};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Reads a node list on a timer and delivers each result to the listeners.
///
/// Every tick spawns one read per node and moves on without waiting for
/// them, so slow reads from one tick may overlap with the next.
pub struct PollScheduler {
    reader: AttributeReader,
    listeners: Arc<ListenerRegistry>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PollScheduler {
    /// Create a stopped scheduler.
    pub fn new(reader: AttributeReader, listeners: Arc<ListenerRegistry>) -> Self {
        Self {
            reader,
            listeners,
            timer: Mutex::new(None),
        }
    }

    /// Poll `node_ids` every `interval`, starting immediately.
    ///
    /// Replaces any running timer. Must be called from within a tokio
    /// runtime.
    pub fn start(&self, node_ids: Vec<String>, interval: Duration) {
        let mut timer = self.timer();
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        if interval.is_zero() {
            tracing::warn!("Polling interval is zero, polling not started");
            return;
        }

        let nodes: Arc<[String]> = node_ids.into();
        tracing::info!(
            nodes = nodes.len(),
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "Starting poller"
        );

        let reader = self.reader.clone();
        let listeners = Arc::clone(&self.listeners);
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                ticker.tick().await;
                for node_id in nodes.iter() {
                    tokio::spawn(poll_node(
                        reader.clone(),
                        Arc::clone(&listeners),
                        node_id.clone(),
                    ));
                }
            }
        }));
    }

    /// Cancel future ticks. Reads already issued run to completion.
    pub fn stop(&self) {
        if let Some(timer) = self.timer().take() {
            timer.abort();
            tracing::info!("Poller stopped");
        }
    }

    /// `true` while a timer is installed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.timer().as_ref().is_some_and(|t| !t.is_finished())
    }

    fn timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.timer().take() {
            timer.abort();
        }
    }
}

async fn poll_node(reader: AttributeReader, listeners: Arc<ListenerRegistry>, node_id: String) {
    match reader.try_read_attributes(&node_id, &Attribute::POLLED).await {
        Ok(event) if !event.is_empty() => listeners.deliver(&event),
        Ok(_) => {}
        Err(ReadError::NotConnected) => {
            tracing::debug!(node_id, "Not connected, skipping poll");
        }
        Err(e) => tracing::warn!(node_id, error = %e, "Poll read failed"),
    }
}
