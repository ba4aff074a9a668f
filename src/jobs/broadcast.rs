//! Live fan-out of job events to whoever is watching.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// One message on the live stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMessage {
    /// `job:<id>`.
    pub channel: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait StreamBroadcaster: Send + Sync {
    async fn broadcast(&self, channel: &str, event_type: &str, payload: serde_json::Value);
}

/// Channel name for a job's stream.
pub fn job_channel(job_id: uuid::Uuid) -> String {
    format!("job:{job_id}")
}

/// Broadcaster backed by a tokio broadcast channel.
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<StreamMessage>,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamBroadcaster for ChannelBroadcaster {
    async fn broadcast(&self, channel: &str, event_type: &str, payload: serde_json::Value) {
        // Ok if no receivers are listening.
        let _ = self.tx.send(StreamMessage {
            channel: channel.to_string(),
            event_type: event_type.to_string(),
            payload,
        });
    }
}

/// Drops everything.
pub struct NoopBroadcaster;

#[async_trait]
impl StreamBroadcaster for NoopBroadcaster {
    async fn broadcast(&self, _channel: &str, _event_type: &str, _payload: serde_json::Value) {}
}
