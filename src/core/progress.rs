//! Progress Bus
//!
//! Fan-out of ingestion progress to subscribers keyed by an opaque client
//! identifier. A client may hold several connections (sinks); publishes are
//! non-blocking and a sink whose receiver has gone away is dropped on the
//! next send. Per-sink delivery order is publish order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ============================================================================
// Events
// ============================================================================

/// A typed event pushed to progress subscribers.
///
/// Serializes to the wire envelope consumed by the WebSocket framing layer:
/// `{"type": "progress" | "error" | "complete", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        kb_id: i64,
        stage: String,
        progress: f32,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file: Option<String>,
    },
    Error {
        kb_id: i64,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Complete {
        kb_id: i64,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunk_count: Option<usize>,
    },
}

impl ProgressEvent {
    pub fn progress(kb_id: i64, stage: &str, progress: f32, message: impl Into<String>) -> Self {
        Self::Progress {
            kb_id,
            stage: stage.to_string(),
            progress,
            message: message.into(),
            file: None,
        }
    }

    pub fn error(kb_id: i64, error: impl Into<String>, detail: Option<String>) -> Self {
        Self::Error {
            kb_id,
            error: error.into(),
            detail,
        }
    }

    pub fn complete(
        kb_id: i64,
        message: impl Into<String>,
        file_id: Option<i64>,
        chunk_count: Option<usize>,
    ) -> Self {
        Self::Complete {
            kb_id,
            message: message.into(),
            file_id,
            chunk_count,
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Handle returned by [`ProgressBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(u64);

struct Sink {
    id: SinkId,
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

/// Process-wide registry of progress subscribers.
#[derive(Default)]
pub struct ProgressBus {
    subscribers: Mutex<HashMap<String, Vec<Sink>>>,
    next_id: AtomicU64,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new sink for `client_id`. Events published to that client
    /// arrive on the returned receiver in publish order.
    pub fn subscribe(&self, client_id: &str) -> (SinkId, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut subs = self.subscribers.lock().expect("progress bus lock poisoned");
        subs.entry(client_id.to_string())
            .or_default()
            .push(Sink { id, tx });

        tracing::debug!(client_id, "progress subscriber connected");
        (id, rx)
    }

    /// Remove one sink of a client. Removing an unknown sink is a no-op.
    pub fn unsubscribe(&self, client_id: &str, sink_id: SinkId) {
        let mut subs = self.subscribers.lock().expect("progress bus lock poisoned");
        if let Some(sinks) = subs.get_mut(client_id) {
            sinks.retain(|s| s.id != sink_id);
            if sinks.is_empty() {
                subs.remove(client_id);
            }
        }
    }

    /// Send an event to every sink of a client. Sinks whose receiver is gone
    /// are removed; delivery to other clients is unaffected.
    pub fn publish(&self, client_id: &str, event: ProgressEvent) {
        let mut subs = self.subscribers.lock().expect("progress bus lock poisoned");
        let Some(sinks) = subs.get_mut(client_id) else {
            tracing::debug!(client_id, "no subscribers for progress event");
            return;
        };

        sinks.retain(|sink| sink.tx.send(event.clone()).is_ok());
        if sinks.is_empty() {
            subs.remove(client_id);
        }
    }

    /// Send an event to every connected sink of every client.
    pub fn broadcast(&self, event: ProgressEvent) {
        let mut subs = self.subscribers.lock().expect("progress bus lock poisoned");
        for sinks in subs.values_mut() {
            sinks.retain(|sink| sink.tx.send(event.clone()).is_ok());
        }
        subs.retain(|_, sinks| !sinks.is_empty());
    }

    /// Total number of live sinks.
    pub fn connection_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("progress bus lock poisoned")
            .values()
            .map(|s| s.len())
            .sum()
    }

    /// Number of distinct clients with at least one sink.
    pub fn client_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("progress bus lock poisoned")
            .len()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.subscribers
            .lock()
            .expect("progress bus lock poisoned")
            .get(client_id)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber_in_order() {
        let bus = ProgressBus::new();
        let (_id, mut rx) = bus.subscribe("client-1");

        for pct in [10.0, 30.0, 50.0] {
            bus.publish("client-1", ProgressEvent::progress(1, "parsing", pct, "working"));
        }

        for expected in [10.0f32, 30.0, 50.0] {
            match rx.recv().await.unwrap() {
                ProgressEvent::Progress { progress, .. } => assert_eq!(progress, expected),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_to_unknown_client_is_noop() {
        let bus = ProgressBus::new();
        bus.publish("ghost", ProgressEvent::complete(1, "done", None, None));
        assert_eq!(bus.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_sink_is_removed() {
        let bus = ProgressBus::new();
        let (_id, rx) = bus.subscribe("client-1");
        drop(rx);

        bus.publish("client-1", ProgressEvent::complete(1, "done", None, None));
        assert!(!bus.is_connected("client-1"));
    }

    #[tokio::test]
    async fn test_multiple_sinks_per_client() {
        let bus = ProgressBus::new();
        let (_a, mut rx_a) = bus.subscribe("client-1");
        let (_b, mut rx_b) = bus.subscribe("client-1");

        bus.publish("client-1", ProgressEvent::complete(7, "done", Some(3), Some(2)));

        assert!(matches!(rx_a.recv().await.unwrap(), ProgressEvent::Complete { kb_id: 7, .. }));
        assert!(matches!(rx_b.recv().await.unwrap(), ProgressEvent::Complete { kb_id: 7, .. }));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = ProgressBus::new();
        let (id, _rx) = bus.subscribe("client-1");
        assert_eq!(bus.client_count(), 1);

        bus.unsubscribe("client-1", id);
        assert_eq!(bus.client_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast() {
        let bus = ProgressBus::new();
        let (_a, mut rx_a) = bus.subscribe("alpha");
        let (_b, mut rx_b) = bus.subscribe("beta");

        bus.broadcast(ProgressEvent::error(2, "store down", None));

        assert!(matches!(rx_a.recv().await.unwrap(), ProgressEvent::Error { kb_id: 2, .. }));
        assert!(matches!(rx_b.recv().await.unwrap(), ProgressEvent::Error { kb_id: 2, .. }));
    }

    #[test]
    fn test_event_wire_format() {
        let event = ProgressEvent::progress(3, "embedding", 50.0, "encoding chunks");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["kb_id"], 3);
        assert_eq!(json["stage"], "embedding");

        let event = ProgressEvent::complete(3, "file processed", Some(9), Some(12));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["file_id"], 9);
        assert_eq!(json["chunk_count"], 12);
    }
}
