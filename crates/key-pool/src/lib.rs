//! Shared pool of API keys for the upstream email service
//!
//! Rotates round-robin across a fixed list of credentials to spread
//! per-key usage limits, persists its state after every mutation, and
//! reinstates exhausted keys after a cool-down.
//!
//! Key lifecycle:
//! 1. Seeded from configuration, or restored from the repository
//! 2. Handed out by `next_available()` starting at the active slot
//! 3. Each successful request counts via `record_usage()`; reaching the
//!    per-period limit marks the key exhausted
//! 4. An upstream quota/invalid-key rejection marks it exhausted directly
//! 5. After the 12 h cool-down an exhausted key is reinstated on demand
//! 6. Every 30 days the accounting window rolls over and counters reset

pub mod classify;
pub mod clock;
pub mod error;
pub mod events;
pub mod pool;
pub mod record;
pub mod repository;
pub mod rollover;
pub mod source;

pub use classify::{DEFAULT_EXHAUSTION_PHRASES, ExhaustionClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use events::{CredentialRef, EventSink, Notification, ToastKind};
pub use pool::{KeyPool, KeySummary, PoolPolicy, PoolState, PoolStatus, PooledKey, Quota};
pub use record::KeyRecord;
pub use repository::{MemoryRepository, POOL_STATE_KEY, PoolRepository, StoreRepository};
pub use rollover::spawn_rollover_task;
