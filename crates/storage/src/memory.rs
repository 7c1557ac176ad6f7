//! In-memory store

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::{KeyValueStore, StoreFuture};

/// Non-durable store; contents vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate entries, e.g. to simulate state left by an earlier session.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.entries.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.entries.lock().await.insert(key.to_owned(), value);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.entries.lock().await.remove(key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_remove() {
        let store = MemoryStore::new();
        assert_eq!(store.get("api_mode").await.unwrap(), None);

        store.set("api_mode", "combined".into()).await.unwrap();
        assert_eq!(
            store.get("api_mode").await.unwrap().as_deref(),
            Some("combined")
        );

        store.remove("api_mode").await.unwrap();
        assert_eq!(store.get("api_mode").await.unwrap(), None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn with_entries_seeds_values() {
        let store = MemoryStore::with_entries([("user_prefix", "a1b2c3d4")]);
        assert_eq!(
            store.get("user_prefix").await.unwrap().as_deref(),
            Some("a1b2c3d4")
        );
    }
}
