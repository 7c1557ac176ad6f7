//! JSON file store
//!
//! Holds a flat JSON object of string values. All writes use atomic
//! temp-file + rename so a crash mid-write never leaves a truncated file. A
//! tokio Mutex serializes writers inside the process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::{KeyValueStore, StoreFuture};

/// File-backed store. The in-memory map mirrors the file contents.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`.
    ///
    /// A missing file is created as `{}` so later loads take the same path.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
            let entries: BTreeMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("{}: {e}", path.display())))?;
            info!(path = %path.display(), entries = entries.len(), "opened store");
            entries
        } else {
            info!(path = %path.display(), "store file not found, starting empty");
            let entries = BTreeMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.entries.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            entries.insert(key.to_owned(), value);
            debug!(key, "stored value");
            write_atomic(&self.path, &entries).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            if entries.remove(key).is_some() {
                debug!(key, "removed value");
                write_atomic(&self.path, &entries).await?;
            }
            Ok(())
        })
    }
}

/// Write the map to `path` via a sibling temp file and rename.
///
/// Permissions are 0600 on unix since the file holds API keys.
async fn write_atomic(path: &Path, data: &BTreeMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing store: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let tmp_path = dir.join(format!(".mailpool-store.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted store");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStore::open(path.clone()).await.unwrap();
        store
            .set("api_key_pool_state", r#"{"records":[],"activeIndex":0}"#.into())
            .await
            .unwrap();
        store.set("api_mode", "personal".into()).await.unwrap();

        let reopened = FileStore::open(path).await.unwrap();
        assert_eq!(
            reopened.get("api_mode").await.unwrap().as_deref(),
            Some("personal")
        );
        assert!(
            reopened
                .get("api_key_pool_state")
                .await
                .unwrap()
                .unwrap()
                .contains("activeIndex")
        );
    }

    #[tokio::test]
    async fn missing_file_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert!(!path.exists());

        let store = FileStore::open(path.clone()).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.get("anything").await.unwrap(), None);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: BTreeMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "[1, 2, 3]").await.unwrap();

        let result = FileStore::open(path).await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn remove_deletes_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStore::open(path.clone()).await.unwrap();
        store.set("personal_api_key", "secret".into()).await.unwrap();
        store.remove("personal_api_key").await.unwrap();
        store.remove("personal_api_key").await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!contents.contains("personal_api_key"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStore::open(path.clone()).await.unwrap();
        store.set("api_mode", "public".into()).await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "store file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Arc::new(FileStore::open(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set(&format!("key-{i}"), i.to_string())
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: BTreeMap<String, String> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }
}
