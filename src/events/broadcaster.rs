//! Event broadcaster: best-effort fan-out of typed events to live subscribers.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// Wildcard channel matching every event.
pub const ALL_CHANNELS: &str = "*";

/// Kinds of events announced to dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "worker:connected")]
    WorkerConnected,
    #[serde(rename = "worker:disconnected")]
    WorkerDisconnected,
    #[serde(rename = "worker:spawned")]
    WorkerSpawned,
    #[serde(rename = "worker:exited")]
    WorkerExited,
    #[serde(rename = "task:queued")]
    TaskQueued,
    #[serde(rename = "task:assigned")]
    TaskAssigned,
    #[serde(rename = "task:processing")]
    TaskProcessing,
    #[serde(rename = "task:progress")]
    TaskProgress,
    #[serde(rename = "task:completed")]
    TaskCompleted,
    #[serde(rename = "task:failed")]
    TaskFailed,
    #[serde(rename = "hub:status")]
    HubStatus,
    #[serde(rename = "token:revoked")]
    TokenRevoked,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerConnected => "worker:connected",
            Self::WorkerDisconnected => "worker:disconnected",
            Self::WorkerSpawned => "worker:spawned",
            Self::WorkerExited => "worker:exited",
            Self::TaskQueued => "task:queued",
            Self::TaskAssigned => "task:assigned",
            Self::TaskProcessing => "task:processing",
            Self::TaskProgress => "task:progress",
            Self::TaskCompleted => "task:completed",
            Self::TaskFailed => "task:failed",
            Self::HubStatus => "hub:status",
            Self::TokenRevoked => "token:revoked",
        }
    }

    /// Channel the event is published on (`task`, `worker`, ...).
    pub fn channel(&self) -> &'static str {
        let s = self.as_str();
        s.split_once(':').map(|(prefix, _)| prefix).unwrap_or(s)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed event with a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl OrchestratorEvent {
    pub fn new(kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Set of channels a subscriber is interested in.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    channels: HashSet<String>,
}

impl ChannelFilter {
    /// A filter that accepts every event.
    pub fn all() -> Self {
        let mut filter = Self::default();
        filter.subscribe([ALL_CHANNELS.to_string()]);
        filter
    }

    pub fn subscribe(&mut self, channels: impl IntoIterator<Item = String>) {
        self.channels.extend(channels);
    }

    pub fn unsubscribe(&mut self, channels: &[String]) {
        for channel in channels {
            self.channels.remove(channel);
        }
    }

    /// Accepts the wildcard, an event's channel prefix, or its exact kind.
    pub fn matches(&self, event: &OrchestratorEvent) -> bool {
        self.channels.contains(ALL_CHANNELS)
            || self.channels.contains(event.kind.channel())
            || self.channels.contains(event.kind.as_str())
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.iter().cloned().collect();
        channels.sort();
        channels
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Fan-out of orchestrator events. Cheap to clone; all clones share one channel.
///
/// Events sent from one task are observed by every subscriber in send order, so
/// transitions emitted while the owning component holds its lock arrive in the
/// order they happened.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to every subsequent event. Missed events are never replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Stream of events matching `filter`; lagged gaps are skipped silently.
    pub fn stream(
        &self,
        filter: ChannelFilter,
    ) -> impl tokio_stream::Stream<Item = OrchestratorEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|result| result.ok())
            .filter(move |event| filter.matches(event))
    }

    /// Broadcast an event. Ok if nobody is listening.
    pub fn emit(&self, kind: EventKind, data: serde_json::Value) {
        self.publish(OrchestratorEvent::new(kind, data));
    }

    pub fn publish(&self, event: OrchestratorEvent) {
        debug!(event = %event.kind, "Broadcasting event");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_with_colon_name() {
        let event = OrchestratorEvent::new(
            EventKind::TaskAssigned,
            serde_json::json!({"taskId": "t1"}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task:assigned");
        assert_eq!(json["data"]["taskId"], "t1");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn filter_matches_prefix_exact_and_wildcard() {
        let event = OrchestratorEvent::new(EventKind::WorkerSpawned, serde_json::Value::Null);

        let mut filter = ChannelFilter::default();
        assert!(!filter.matches(&event));

        filter.subscribe(["worker".to_string()]);
        assert!(filter.matches(&event));

        let mut exact = ChannelFilter::default();
        exact.subscribe(["worker:exited".to_string()]);
        assert!(!exact.matches(&event));

        assert!(ChannelFilter::all().matches(&event));

        filter.unsubscribe(&["worker".to_string()]);
        assert!(filter.is_empty());
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let events = EventBroadcaster::default();
        let mut rx = events.subscribe();

        events.emit(EventKind::TaskQueued, serde_json::json!({"taskId": "a"}));
        events.emit(EventKind::TaskAssigned, serde_json::json!({"taskId": "a"}));
        events.emit(EventKind::TaskCompleted, serde_json::json!({"taskId": "a"}));

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::TaskQueued);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::TaskAssigned);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::TaskCompleted);
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_ok() {
        let events = EventBroadcaster::new(4);
        events.emit(EventKind::HubStatus, serde_json::Value::Null);
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn stream_applies_filter() {
        use tokio_stream::StreamExt;

        let events = EventBroadcaster::default();
        let mut filter = ChannelFilter::default();
        filter.subscribe(["task".to_string()]);
        let stream = events.stream(filter);
        tokio::pin!(stream);

        events.emit(EventKind::WorkerConnected, serde_json::Value::Null);
        events.emit(EventKind::TaskFailed, serde_json::Value::Null);

        let next = stream.next().await.unwrap();
        assert_eq!(next.kind, EventKind::TaskFailed);
    }
}
