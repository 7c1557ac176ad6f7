//! Notification log
//!
//! Subscribes to the pool's event sink, logs every notification at a level
//! matching its severity, and keeps the most recent ones for
//! `GET /notifications`.

use std::collections::VecDeque;
use std::sync::Arc;

use key_pool::{Clock, EventSink, Notification, ToastKind};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const NOTIFICATION_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recorded {
    pub received_at: u64,
    #[serde(flatten)]
    pub notification: Notification,
}

#[derive(Clone)]
pub struct NotificationLog {
    entries: Arc<Mutex<VecDeque<Recorded>>>,
    capacity: usize,
}

impl Default for NotificationLog {
    fn default() -> Self {
        Self::new(NOTIFICATION_LOG_CAPACITY)
    }
}

impl NotificationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub async fn push(&self, entry: Recorded) {
        let mut entries = self.entries.lock().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Oldest first.
    pub async fn recent(&self) -> Vec<Recorded> {
        self.entries.lock().await.iter().cloned().collect()
    }
}

fn log_notification(notification: &Notification) {
    match notification {
        Notification::CredentialExhausted {
            old,
            new: Some(new),
            ..
        } => info!(
            old_slot = old.slot,
            old_key = %old.fingerprint,
            new_slot = new.slot,
            new_key = %new.fingerprint,
            "pool key exhausted, rotated"
        ),
        Notification::CredentialExhausted {
            old, new: None, ..
        } => error!(
            old_slot = old.slot,
            old_key = %old.fingerprint,
            "pool key exhausted, no replacement available"
        ),
        Notification::ConnectionStatusChanged { connected, mode } => {
            if *connected {
                info!(mode = %mode, "upstream connected");
            } else {
                warn!(mode = %mode, "upstream unreachable");
            }
        }
        Notification::Toast { message, kind, .. } => match kind {
            ToastKind::Info => info!(message = %message, "toast"),
            ToastKind::Warning => warn!(message = %message, "toast"),
            ToastKind::Error => error!(message = %message, "toast"),
        },
        Notification::InboxAutoDeleted {
            inbox_id,
            email_address,
        } => info!(
            inbox_id = %inbox_id,
            email_address = email_address.as_deref().unwrap_or(""),
            "temporary inbox deleted"
        ),
    }
}

/// Spawn the task that drains `events` into `log` until the sink is dropped.
pub fn spawn_notification_logger(
    events: &EventSink,
    log: NotificationLog,
    clock: Arc<dyn Clock>,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    log_notification(&notification);
                    log.push(Recorded {
                        received_at: clock.now_millis(),
                        notification,
                    })
                    .await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification logger fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use key_pool::ManualClock;
    use std::time::Duration;

    fn toast(n: usize) -> Recorded {
        Recorded {
            received_at: n as u64,
            notification: Notification::Toast {
                message: format!("toast {n}"),
                kind: ToastKind::Info,
                duration_ms: 3_000,
            },
        }
    }

    #[tokio::test]
    async fn log_keeps_most_recent_entries() {
        let log = NotificationLog::new(3);
        for n in 0..5 {
            log.push(toast(n)).await;
        }
        let recent = log.recent().await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].received_at, 2);
        assert_eq!(recent[2].received_at, 4);
    }

    #[tokio::test]
    async fn logger_records_published_notifications() {
        let events = EventSink::new(16);
        let log = NotificationLog::default();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let task = spawn_notification_logger(&events, log.clone(), clock);

        events.toast(ToastKind::Warning, "Using personal API key.");
        events.publish(Notification::ConnectionStatusChanged {
            connected: true,
            mode: "combined".into(),
        });

        let mut recent = Vec::new();
        for _ in 0..50 {
            recent = log.recent().await;
            if recent.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        assert_eq!(recent.len(), 2);
        let json = serde_json::to_value(&recent[0]).unwrap();
        assert_eq!(json["type"], "toast");
        assert_eq!(json["kind"], "warning");
        assert_eq!(json["receivedAt"], 1_700_000_000_000u64);
        assert_eq!(recent[1].notification.name(), "connection-status-changed");
    }
}
