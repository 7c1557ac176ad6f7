//! Notifications published to the UI collaborator
//!
//! A broadcast channel: publishing never blocks and never fails, even when
//! nobody is subscribed. Slow subscribers lose the oldest notifications.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Log-safe reference to a pooled credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialRef {
    pub slot: usize,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
    Info,
    Warning,
    Error,
}

impl ToastKind {
    /// How long the UI should show a toast of this kind.
    pub fn default_duration_ms(&self) -> u64 {
        match self {
            ToastKind::Info => 3_000,
            ToastKind::Warning => 5_000,
            ToastKind::Error => 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Notification {
    /// A pooled key was marked exhausted. `new` is the key selected in its place.
    CredentialExhausted {
        old: CredentialRef,
        new: Option<CredentialRef>,
        any_available: bool,
    },
    ConnectionStatusChanged { connected: bool, mode: String },
    Toast {
        message: String,
        kind: ToastKind,
        duration_ms: u64,
    },
    InboxAutoDeleted {
        inbox_id: String,
        email_address: Option<String>,
    },
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::CredentialExhausted { .. } => "credential-exhausted",
            Notification::ConnectionStatusChanged { .. } => "connection-status-changed",
            Notification::Toast { .. } => "toast",
            Notification::InboxAutoDeleted { .. } => "inbox-auto-deleted",
        }
    }
}

/// Cloneable publishing handle.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<Notification>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: Notification) {
        let name = notification.name();
        let receivers = self.tx.send(notification).unwrap_or(0);
        debug!(notification = name, receivers, "published notification");
    }

    pub fn toast(&self, kind: ToastKind, message: impl Into<String>) {
        self.publish(Notification::Toast {
            message: message.into(),
            kind,
            duration_ms: kind.default_duration_ms(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_notification_wire_format() {
        let n = Notification::CredentialExhausted {
            old: CredentialRef {
                slot: 0,
                fingerprint: "abcdefgh...".into(),
            },
            new: None,
            any_available: false,
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "credential-exhausted");
        assert_eq!(json["old"]["slot"], 0);
        assert_eq!(json["new"], serde_json::Value::Null);
        assert_eq!(json["anyAvailable"], false);
    }

    #[test]
    fn toast_wire_format() {
        let n = Notification::Toast {
            message: "rotated".into(),
            kind: ToastKind::Warning,
            duration_ms: 5_000,
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "toast");
        assert_eq!(json["kind"], "warning");
        assert_eq!(json["durationMs"], 5000);
    }

    #[tokio::test]
    async fn subscribers_receive_published_notifications() {
        let sink = EventSink::default();
        let mut rx = sink.subscribe();
        sink.toast(ToastKind::Error, "all keys exhausted");

        match rx.recv().await.unwrap() {
            Notification::Toast {
                kind, duration_ms, ..
            } => {
                assert_eq!(kind, ToastKind::Error);
                assert_eq!(duration_ms, 10_000);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        EventSink::new(4).toast(ToastKind::Info, "nobody listening");
    }
}
