use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::store::{JobRecordStore, JobStatus, JobUpdate};

pub const PROGRESS_EVENT: &str = "transcode:progress";
pub const STATUS_EVENT: &str = "transcode:status";

pub fn job_topic(job_id: &str) -> String {
    format!("job:{job_id}")
}

/// Outbound side of the real-time channel. Delivery is best-effort: a
/// subscriber that is not connected simply misses the event, and the durable
/// job record remains the source of truth.
pub trait RealtimeChannel: Send + Sync {
    fn publish(&self, topic: &str, event: &str, payload: Value);
}

#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

/// In-process fan-out over a tokio broadcast channel. Messages sent while no
/// subscriber is attached are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    sender: broadcast::Sender<ChannelMessage>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(256)
    }
}

impl RealtimeChannel for BroadcastChannel {
    fn publish(&self, topic: &str, event: &str, payload: Value) {
        let message = ChannelMessage {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        };
        if self.sender.send(message).is_err() {
            debug!(topic, event, "no live subscribers for event");
        }
    }
}

/// Channel that discards every event; used when no real-time transport is
/// wired in.
#[derive(Debug, Default)]
pub struct NullChannel;

impl RealtimeChannel for NullChannel {
    fn publish(&self, _topic: &str, _event: &str, _payload: Value) {}
}

/// Pairs every real-time emission with a durable write to the job record
/// store, so polling clients never lose information even when the broadcast
/// is missed.
pub struct StatusPublisher {
    store: Arc<dyn JobRecordStore>,
    channel: Arc<dyn RealtimeChannel>,
}

impl StatusPublisher {
    pub fn new(store: Arc<dyn JobRecordStore>, channel: Arc<dyn RealtimeChannel>) -> Self {
        Self { store, channel }
    }

    pub fn publish_progress(&self, job_id: &str, percent: u8, stage: &str, extra: Option<Value>) {
        let update = JobUpdate::default().progress(percent).stage(stage);
        if let Err(error) = self.store.update(job_id, &update) {
            warn!(job_id, %error, "failed to persist progress update");
        }
        let mut payload = json!({
            "job_id": job_id,
            "progress": percent,
            "stage": stage,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let (Some(object), Some(Value::Object(extra))) = (payload.as_object_mut(), extra) {
            for (key, value) in extra {
                object.entry(key).or_insert(value);
            }
        }
        self.channel.publish(&job_topic(job_id), PROGRESS_EVENT, payload);
    }

    pub fn publish_status(&self, job_id: &str, status: JobStatus) {
        let update = JobUpdate::default().status(status).stage(status.as_str());
        if let Err(error) = self.store.update(job_id, &update) {
            warn!(job_id, %error, "failed to persist status update");
        }
        let payload = json!({
            "job_id": job_id,
            "status": status.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.channel.publish(&job_topic(job_id), STATUS_EVENT, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_roundtrip() {
        let channel = BroadcastChannel::new(8);
        let mut receiver = channel.subscribe();
        channel.publish(&job_topic("abc"), PROGRESS_EVENT, json!({"progress": 40}));
        let message = receiver.try_recv().expect("message should be delivered");
        assert_eq!(message.topic, "job:abc");
        assert_eq!(message.event, PROGRESS_EVENT);
        assert_eq!(message.payload["progress"], 40);
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let channel = BroadcastChannel::new(8);
        channel.publish(&job_topic("abc"), STATUS_EVENT, json!({}));
        let mut late = channel.subscribe();
        assert!(late.try_recv().is_err());
    }
}
