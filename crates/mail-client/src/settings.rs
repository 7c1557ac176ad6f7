//! Persisted scalar settings
//!
//! Selected mode, personal credential, timeouts and the namespace prefix
//! live in the same key-value store as the pool state so a restarted
//! session resumes where it left off.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use storage::KeyValueStore;
use tracing::warn;

use crate::error::Result;
use crate::mode::Mode;

pub const MODE_KEY: &str = "api_mode";
pub const PERSONAL_KEY: &str = "personal_api_key";
pub const HTTP_TIMEOUT_KEY: &str = "http_timeout_secs";
pub const EMAIL_WAIT_TIMEOUT_KEY: &str = "email_wait_timeout_secs";
pub const USER_PREFIX_KEY: &str = "user_prefix";

#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn KeyValueStore>,
}

impl Settings {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn mode(&self) -> Result<Option<Mode>> {
        let Some(raw) = self.store.get(MODE_KEY).await? else {
            return Ok(None);
        };
        match raw.parse() {
            Ok(mode) => Ok(Some(mode)),
            Err(e) => {
                warn!(value = %raw, error = %e, "ignoring persisted mode");
                Ok(None)
            }
        }
    }

    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        self.store.set(MODE_KEY, mode.to_string()).await?;
        Ok(())
    }

    pub async fn personal_credential(&self) -> Result<Option<Secret<String>>> {
        Ok(self
            .store
            .get(PERSONAL_KEY)
            .await?
            .filter(|s| !s.trim().is_empty())
            .map(Secret::new))
    }

    pub async fn set_personal_credential(&self, secret: Option<&Secret<String>>) -> Result<()> {
        match secret {
            Some(secret) => self.store.set(PERSONAL_KEY, secret.expose().clone()).await?,
            None => self.store.remove(PERSONAL_KEY).await?,
        }
        Ok(())
    }

    pub async fn http_timeout(&self) -> Result<Option<Duration>> {
        self.duration(HTTP_TIMEOUT_KEY).await
    }

    pub async fn set_http_timeout(&self, timeout: Duration) -> Result<()> {
        self.set_duration(HTTP_TIMEOUT_KEY, timeout).await
    }

    pub async fn email_wait_timeout(&self) -> Result<Option<Duration>> {
        self.duration(EMAIL_WAIT_TIMEOUT_KEY).await
    }

    pub async fn set_email_wait_timeout(&self, timeout: Duration) -> Result<()> {
        self.set_duration(EMAIL_WAIT_TIMEOUT_KEY, timeout).await
    }

    pub async fn user_prefix(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get(USER_PREFIX_KEY)
            .await?
            .filter(|p| !p.trim().is_empty()))
    }

    pub async fn set_user_prefix(&self, prefix: &str) -> Result<()> {
        self.store.set(USER_PREFIX_KEY, prefix.to_owned()).await?;
        Ok(())
    }

    async fn duration(&self, key: &str) -> Result<Option<Duration>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
            _ => {
                warn!(key, value = %raw, "ignoring persisted timeout");
                Ok(None)
            }
        }
    }

    async fn set_duration(&self, key: &str, value: Duration) -> Result<()> {
        self.store.set(key, value.as_secs().to_string()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryStore;

    #[tokio::test]
    async fn mode_roundtrip() {
        let settings = Settings::new(Arc::new(MemoryStore::new()));
        assert_eq!(settings.mode().await.unwrap(), None);
        settings.set_mode(Mode::Combined).await.unwrap();
        assert_eq!(settings.mode().await.unwrap(), Some(Mode::Combined));
    }

    #[tokio::test]
    async fn garbage_values_are_ignored() {
        let store = MemoryStore::with_entries([
            (MODE_KEY, "turbo"),
            (HTTP_TIMEOUT_KEY, "soon"),
            (EMAIL_WAIT_TIMEOUT_KEY, "0"),
        ]);
        let settings = Settings::new(Arc::new(store));
        assert_eq!(settings.mode().await.unwrap(), None);
        assert_eq!(settings.http_timeout().await.unwrap(), None);
        assert_eq!(settings.email_wait_timeout().await.unwrap(), None);
    }

    #[tokio::test]
    async fn personal_credential_set_and_clear() {
        let settings = Settings::new(Arc::new(MemoryStore::new()));
        let secret: Secret<String> = "personal-key-abcdef".into();
        settings
            .set_personal_credential(Some(&secret))
            .await
            .unwrap();
        assert_eq!(
            settings.personal_credential().await.unwrap(),
            Some(secret)
        );

        settings.set_personal_credential(None).await.unwrap();
        assert_eq!(settings.personal_credential().await.unwrap(), None);
    }

    #[tokio::test]
    async fn timeouts_are_stored_in_seconds() {
        let store = Arc::new(MemoryStore::new());
        let settings = Settings::new(store.clone());
        settings
            .set_http_timeout(Duration::from_secs(45))
            .await
            .unwrap();
        assert_eq!(
            store.get(HTTP_TIMEOUT_KEY).await.unwrap().as_deref(),
            Some("45")
        );
        assert_eq!(
            settings.http_timeout().await.unwrap(),
            Some(Duration::from_secs(45))
        );
    }
}
