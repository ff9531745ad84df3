use crate::models::{ProgressEvent, Stage, UploadResult};
use crate::services::error::PipelineError;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Frame delivered to a progress subscriber, serialized as JSON text
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    Progress {
        stage: Stage,
        percent: u8,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Box<UploadResult>>,
    },
    Error {
        kind: String,
        message: String,
    },
}

impl ChannelMessage {
    /// Whether the subscriber stream ends after this frame
    pub fn is_final(&self) -> bool {
        match self {
            ChannelMessage::Progress { result, .. } => result.is_some(),
            ChannelMessage::Error { .. } => true,
        }
    }
}

impl From<ProgressEvent> for ChannelMessage {
    fn from(event: ProgressEvent) -> Self {
        ChannelMessage::Progress {
            stage: event.stage,
            percent: event.percent,
            message: event.message,
            result: None,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

/// Per-token fan-out of progress events to at most one listener.
///
/// Publishing never blocks and never queues for absent listeners; events
/// published before anyone subscribes are dropped.
#[derive(Default)]
pub struct ProgressHub {
    subscribers: DashMap<String, Subscriber>,
    next_id: AtomicU64,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the listener for `token`, replacing (and ending) any
    /// previous one. Returns the subscriber id to pass to `unsubscribe`.
    pub fn subscribe(&self, token: &str) -> (u64, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self
            .subscribers
            .insert(token.to_string(), Subscriber { id, tx })
            .is_some()
        {
            tracing::info!("🔁 Progress listener replaced for session {}", token);
        }
        (id, rx)
    }

    pub fn publish(&self, token: &str, event: ProgressEvent) {
        let Some(subscriber) = self.subscribers.get(token) else {
            return;
        };
        if subscriber.tx.send(event.into()).is_err() {
            tracing::debug!("Progress listener for {} has gone away", token);
        }
    }

    /// Sends the final frame for `token` and releases the channel
    pub fn close(&self, token: &str, outcome: Result<&UploadResult, &PipelineError>) {
        let Some((_, subscriber)) = self.subscribers.remove(token) else {
            return;
        };
        let message = match outcome {
            Ok(result) => ChannelMessage::Progress {
                stage: Stage::Complete,
                percent: 100,
                message: "Upload complete".to_string(),
                result: Some(Box::new(result.clone())),
            },
            Err(err) => ChannelMessage::Error {
                kind: err.kind().to_string(),
                message: err.public_message(),
            },
        };
        let _ = subscriber.tx.send(message);
    }

    /// Removes the listener only if it is still the one identified by `id`
    pub fn unsubscribe(&self, token: &str, id: u64) {
        self.subscribers.remove_if(token, |_, s| s.id == id);
    }

    pub fn has_subscriber(&self, token: &str) -> bool {
        self.subscribers.contains_key(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(percent: u8) -> ProgressEvent {
        ProgressEvent::new(Stage::Hashing, percent, format!("{}%", percent))
    }

    #[test]
    fn test_publish_without_subscriber_is_noop() {
        let hub = ProgressHub::new();
        hub.publish("nobody", event(10));
        assert!(!hub.has_subscriber("nobody"));

        // Late subscribers do not see earlier events
        let (_, mut rx) = hub.subscribe("nobody");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_events_arrive_in_order() {
        let hub = ProgressHub::new();
        let (_, mut rx) = hub.subscribe("t");
        for p in [20, 30, 55, 80, 90] {
            hub.publish("t", event(p));
        }
        let mut seen = Vec::new();
        while let Ok(ChannelMessage::Progress { percent, .. }) = rx.try_recv() {
            seen.push(percent);
        }
        assert_eq!(seen, vec![20, 30, 55, 80, 90]);
    }

    #[test]
    fn test_new_subscriber_replaces_old() {
        let hub = ProgressHub::new();
        let (old_id, mut old_rx) = hub.subscribe("t");
        let (_, mut new_rx) = hub.subscribe("t");

        hub.publish("t", event(20));
        assert!(new_rx.try_recv().is_ok());
        // Old sender was dropped on replacement
        assert!(matches!(
            old_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        // A stale unsubscribe must not remove the replacement
        hub.unsubscribe("t", old_id);
        assert!(hub.has_subscriber("t"));
    }

    #[test]
    fn test_close_sends_final_error_and_ends_stream() {
        let hub = ProgressHub::new();
        let (_, mut rx) = hub.subscribe("t");
        hub.close("t", Err(&PipelineError::Blocked("Eicar".into())));

        let msg = rx.try_recv().unwrap();
        assert!(msg.is_final());
        match msg {
            ChannelMessage::Error { kind, message } => {
                assert_eq!(kind, "blocked");
                assert!(message.contains("Eicar"));
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(!hub.has_subscriber("t"));
    }

    #[test]
    fn test_error_frame_hides_storage_cause() {
        let hub = ProgressHub::new();
        let (_, mut rx) = hub.subscribe("t");
        hub.close(
            "t",
            Err(&PipelineError::StorageUnavailable("bucket: AccessDenied".into())),
        );
        match rx.try_recv().unwrap() {
            ChannelMessage::Error { kind, message } => {
                assert_eq!(kind, "storage_unavailable");
                assert!(!message.contains("AccessDenied"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_progress_frame_shape() {
        let json = serde_json::to_value(ChannelMessage::from(event(30))).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["stage"], "hashing");
        assert_eq!(json["percent"], 30);
        assert!(json.get("result").is_none());
    }
}
