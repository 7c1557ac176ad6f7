//! Scheduled inbox deletion
//!
//! Inboxes created on shared pool keys are temporary. Each one gets a
//! timer task; deleting the inbox by hand cancels its timer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

type Pending = Arc<Mutex<HashMap<String, (u64, JoinHandle<()>)>>>;

#[derive(Default)]
pub struct InboxReaper {
    pending: Pending,
    generation: AtomicU64,
}

impl InboxReaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `deletion` for `inbox_id` after `lifetime`, replacing any timer
    /// already scheduled for it.
    pub async fn schedule<F>(&self, inbox_id: &str, lifetime: Duration, deletion: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();
        let id = inbox_id.to_string();

        // Held across the spawn so the task cannot finish before its entry exists
        let mut map = self.pending.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            {
                let mut map = pending.lock().await;
                if map.get(&id).is_some_and(|(g, _)| *g == generation) {
                    map.remove(&id);
                }
            }
            deletion.await;
        });
        if let Some((_, previous)) = map.insert(inbox_id.to_string(), (generation, handle)) {
            previous.abort();
        }
        debug!(inbox_id, lifetime_secs = lifetime.as_secs(), "inbox deletion scheduled");
    }

    /// Cancel the timer for `inbox_id`. Returns whether one was pending.
    pub async fn cancel(&self, inbox_id: &str) -> bool {
        match self.pending.lock().await.remove(inbox_id) {
            Some((_, handle)) => {
                handle.abort();
                debug!(inbox_id, "scheduled inbox deletion cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn is_scheduled(&self, inbox_id: &str) -> bool {
        self.pending.lock().await.contains_key(inbox_id)
    }

    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Abort every timer.
    pub async fn shutdown(&self) {
        for (_, (_, handle)) in self.pending.lock().await.drain() {
            handle.abort();
        }
    }
}
