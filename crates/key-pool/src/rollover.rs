//! Periodic accounting-window rollover
//!
//! Spawns a task that calls `KeyPool::rollover_check()` on a fixed interval
//! (hourly in production). The pool already rolls over on load, so the
//! immediate first tick is skipped.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::pool::KeyPool;

/// Returns the `JoinHandle` of the spawned task; abort it to stop.
pub fn spawn_rollover_task(pool: Arc<KeyPool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let rolled = pool.rollover_check().await;
            debug!(rolled, "periodic rollover check");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventSink;
    use crate::pool::{PoolPolicy, PoolState};
    use crate::repository::MemoryRepository;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);
    const START: u64 = 1_700_000_000_000;

    #[tokio::test(start_paused = true)]
    async fn rolls_over_once_the_window_passes() {
        let mut persisted = PoolState::seeded(["rollover-key-0000"], START);
        persisted.records[0].usage_count = 50;
        persisted.records[0].exhausted = true;
        persisted.records[0].last_used_at = Some(START);

        let clock = Arc::new(ManualClock::new(START + 29 * DAY.as_millis() as u64));
        let pool = Arc::new(
            KeyPool::load(
                vec![],
                PoolPolicy::default(),
                Arc::new(MemoryRepository::with_state(persisted)),
                EventSink::default(),
                clock.clone(),
            )
            .await,
        );
        assert!(pool.status().await.keys[0].exhausted);

        let handle = spawn_rollover_task(pool.clone(), Duration::from_secs(3600));

        // First scheduled check: window not over yet
        tokio::time::sleep(Duration::from_secs(3601)).await;
        assert!(pool.status().await.keys[0].exhausted);

        clock.advance(2 * DAY);
        tokio::time::sleep(Duration::from_secs(3600)).await;

        let status = pool.status().await;
        assert!(!status.keys[0].exhausted);
        assert_eq!(status.keys[0].usage_count, 0);

        handle.abort();
    }
}
