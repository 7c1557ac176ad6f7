//! Persistence boundary for pool state
//!
//! The pool only sees `load()`/`save()`. `StoreRepository` serializes the
//! state as JSON under a single key of a `KeyValueStore`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use storage::KeyValueStore;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::pool::PoolState;

/// Storage key holding the serialized pool state.
pub const POOL_STATE_KEY: &str = "api_key_pool_state";

pub type RepositoryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub trait PoolRepository: Send + Sync {
    /// Previously saved state, `None` on first start.
    fn load(&self) -> RepositoryFuture<'_, Option<PoolState>>;

    fn save<'a>(&'a self, state: &'a PoolState) -> RepositoryFuture<'a, ()>;
}

pub struct StoreRepository {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl StoreRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(store, POOL_STATE_KEY)
    }

    pub fn with_key(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }
}

impl PoolRepository for StoreRepository {
    fn load(&self) -> RepositoryFuture<'_, Option<PoolState>> {
        Box::pin(async move {
            let Some(raw) = self.store.get(&self.key).await? else {
                return Ok(None);
            };
            let state = serde_json::from_str(&raw).map_err(|e| Error::Corrupt(e.to_string()))?;
            Ok(Some(state))
        })
    }

    fn save<'a>(&'a self, state: &'a PoolState) -> RepositoryFuture<'a, ()> {
        Box::pin(async move {
            let json =
                serde_json::to_string(state).map_err(|e| Error::Storage(e.to_string()))?;
            self.store.set(&self.key, json).await?;
            Ok(())
        })
    }
}

/// Repository kept in memory, counting saves. Used by tests and by
/// sessions that must not touch disk.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<Option<PoolState>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PoolState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            saves: Default::default(),
        }
    }

    pub async fn snapshot(&self) -> Option<PoolState> {
        self.state.lock().await.clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl PoolRepository for MemoryRepository {
    fn load(&self) -> RepositoryFuture<'_, Option<PoolState>> {
        Box::pin(async move { Ok(self.state.lock().await.clone()) })
    }

    fn save<'a>(&'a self, state: &'a PoolState) -> RepositoryFuture<'a, ()> {
        Box::pin(async move {
            *self.state.lock().await = Some(state.clone());
            self.saves
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
    }
}
