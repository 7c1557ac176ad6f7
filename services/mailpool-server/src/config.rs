//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The personal key is loaded from the MAILPOOL_PERSONAL_KEY env var or
//! personal_key_file, never stored in the TOML directly.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use key_pool::{PoolPolicy, Quota};
use mail_client::{ClientConfig, Mode, RetryPolicy};
use reqwest::Url;
use reqwest::header::HeaderName;
use serde::Deserialize;

const PERSONAL_KEY_ENV: &str = "MAILPOOL_PERSONAL_KEY";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub client: ClientSection,
}

/// Local HTTP API settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream email API
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_credential_header")]
    pub credential_header: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_email_wait_timeout")]
    pub email_wait_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            credential_header: default_credential_header(),
            timeout_secs: default_timeout(),
            email_wait_timeout_secs: default_email_wait_timeout(),
        }
    }
}

/// Shared key pool
#[derive(Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub keys: Vec<String>,
    /// One key per line; blank lines and `#` comments are skipped
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_usage_limit")]
    pub usage_limit: u32,
    #[serde(default = "default_daily_request_limit")]
    pub daily_request_limit: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_period_days")]
    pub period_days: u64,
    #[serde(default = "default_rollover_interval")]
    pub rollover_interval_secs: u64,
    /// Keys known to be revoked; the client rotates away from them
    #[serde(default)]
    pub retired_keys: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            keys_file: None,
            state_path: default_state_path(),
            usage_limit: default_usage_limit(),
            daily_request_limit: default_daily_request_limit(),
            cooldown_secs: default_cooldown(),
            period_days: default_period_days(),
            rollover_interval_secs: default_rollover_interval(),
            retired_keys: Vec::new(),
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("keys", &format_args!("[{} keys]", self.keys.len()))
            .field("keys_file", &self.keys_file)
            .field("state_path", &self.state_path)
            .field("usage_limit", &self.usage_limit)
            .field("daily_request_limit", &self.daily_request_limit)
            .field("cooldown_secs", &self.cooldown_secs)
            .field("period_days", &self.period_days)
            .field("rollover_interval_secs", &self.rollover_interval_secs)
            .field("retired_keys", &format_args!("[{} keys]", self.retired_keys.len()))
            .finish()
    }
}

/// Client behaviour
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_inbox_lifetime")]
    pub inbox_lifetime_secs: u64,
    #[serde(default)]
    pub auto_delete_all: bool,
    #[serde(default)]
    pub keep_pooled_inboxes: bool,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_plan_type")]
    pub plan_type: String,
    #[serde(default)]
    pub exhaustion_phrases: Vec<String>,
    #[serde(skip)]
    pub personal_key: Option<Secret<String>>,
    /// Path to a file containing the personal key (alternative to MAILPOOL_PERSONAL_KEY)
    #[serde(default)]
    pub personal_key_file: Option<PathBuf>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            namespace: None,
            inbox_lifetime_secs: default_inbox_lifetime(),
            auto_delete_all: false,
            keep_pooled_inboxes: false,
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            plan_type: default_plan_type(),
            exhaustion_phrases: Vec::new(),
            personal_key: None,
            personal_key_file: None,
        }
    }
}

fn default_max_connections() -> usize {
    256
}

fn default_base_url() -> String {
    "https://api.mailslurp.com".into()
}

fn default_credential_header() -> String {
    "x-api-key".into()
}

fn default_timeout() -> u64 {
    30
}

fn default_email_wait_timeout() -> u64 {
    60
}

fn default_state_path() -> PathBuf {
    PathBuf::from("mailpool-state.json")
}

fn default_usage_limit() -> u32 {
    50
}

fn default_daily_request_limit() -> u32 {
    250
}

fn default_cooldown() -> u64 {
    12 * 60 * 60
}

fn default_period_days() -> u64 {
    30
}

fn default_rollover_interval() -> u64 {
    60 * 60
}

fn default_inbox_lifetime() -> u64 {
    300
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_plan_type() -> String {
    "free".into()
}

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

fn non_zero(value: u64, name: &str) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!(
            "{name} must be greater than 0"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Personal key resolution order:
    /// 1. MAILPOOL_PERSONAL_KEY env var
    /// 2. personal_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Some(ref keys_file) = config.pool.keys_file {
            let contents = std::fs::read_to_string(keys_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read keys_file {}: {e}",
                    keys_file.display()
                ))
            })?;
            config.pool.keys.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_owned),
            );
        }
        config.pool.keys.retain(|k| !k.trim().is_empty());

        if let Ok(key) = std::env::var(PERSONAL_KEY_ENV) {
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.client.personal_key = Some(Secret::new(key));
            }
        } else if let Some(ref key_file) = config.client.personal_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read personal_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.client.personal_key = Some(Secret::new(key));
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            )));
        }
        non_zero(self.upstream.timeout_secs, "timeout_secs")?;
        non_zero(
            self.upstream.email_wait_timeout_secs,
            "email_wait_timeout_secs",
        )?;
        non_zero(self.server.max_connections as u64, "max_connections")?;
        non_zero(self.pool.usage_limit.into(), "usage_limit")?;
        non_zero(self.pool.daily_request_limit.into(), "daily_request_limit")?;
        non_zero(self.pool.cooldown_secs, "cooldown_secs")?;
        non_zero(self.pool.period_days, "period_days")?;
        if self.pool.period_days.checked_mul(MILLIS_PER_DAY).is_none() {
            return Err(common::Error::Config(format!(
                "period_days is too large, got: {}",
                self.pool.period_days
            )));
        }
        non_zero(self.pool.rollover_interval_secs, "rollover_interval_secs")?;
        non_zero(self.client.inbox_lifetime_secs, "inbox_lifetime_secs")?;
        non_zero(self.client.retry_attempts.into(), "retry_attempts")?;

        if self.pool.keys.is_empty() && self.client.mode != Mode::Personal {
            return Err(common::Error::Config(format!(
                "pool.keys must not be empty in {} mode",
                self.client.mode
            )));
        }

        // Surfaces URL and header errors at load instead of at first use
        self.client_config()?;
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("mailpool.toml")
    }

    pub fn policy(&self) -> PoolPolicy {
        PoolPolicy {
            quota: Quota {
                per_period_usage_limit: self.pool.usage_limit,
                daily_request_limit: self.pool.daily_request_limit,
            },
            cooldown: Duration::from_secs(self.pool.cooldown_secs),
            period: Duration::from_millis(self.pool.period_days.saturating_mul(MILLIS_PER_DAY)),
        }
    }

    pub fn rollover_interval(&self) -> Duration {
        Duration::from_secs(self.pool.rollover_interval_secs)
    }

    pub fn client_config(&self) -> common::Result<ClientConfig> {
        let base_url = Url::parse(&self.upstream.base_url).map_err(|e| {
            common::Error::Config(format!(
                "invalid base_url {}: {e}",
                self.upstream.base_url
            ))
        })?;
        let credential_header = HeaderName::from_bytes(self.upstream.credential_header.as_bytes())
            .map_err(|e| {
                common::Error::Config(format!(
                    "invalid credential_header {}: {e}",
                    self.upstream.credential_header
                ))
            })?;

        let mut client = ClientConfig::new(base_url);
        client.credential_header = credential_header;
        client.http_timeout = Duration::from_secs(self.upstream.timeout_secs);
        client.email_wait_timeout = Duration::from_secs(self.upstream.email_wait_timeout_secs);
        client.mode = self.client.mode;
        client.personal_credential = self.client.personal_key.clone();
        client.namespace = self.client.namespace.clone();
        client.inbox_lifetime = Duration::from_secs(self.client.inbox_lifetime_secs);
        client.auto_delete_all = self.client.auto_delete_all;
        client.keep_pooled_inboxes = self.client.keep_pooled_inboxes;
        client.retry = RetryPolicy {
            max_attempts: self.client.retry_attempts,
            base_delay: Duration::from_millis(self.client.retry_base_delay_ms),
        };
        client.plan_type = self.client.plan_type.clone();
        client.retired_keys = self.pool.retired_keys.clone();
        client.exhaustion_phrases = self.client.exhaustion_phrases.clone();
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:8025"

[pool]
keys = ["pool-key-0-abcdefghijklmnopqrstuvwxyz", "pool-key-1-abcdefghijklmnopqrstuvwxyz"]
"#
    }

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("mailpool.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        unsafe { remove_env(PERSONAL_KEY_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 256);
        assert_eq!(config.upstream.base_url, "https://api.mailslurp.com");
        assert_eq!(config.upstream.credential_header, "x-api-key");
        assert_eq!(config.upstream.timeout_secs, 30);
        assert_eq!(config.upstream.email_wait_timeout_secs, 60);
        assert_eq!(config.pool.keys.len(), 2);
        assert_eq!(config.pool.usage_limit, 50);
        assert_eq!(config.pool.daily_request_limit, 250);
        assert_eq!(config.pool.cooldown_secs, 43_200);
        assert_eq!(config.client.mode, Mode::Public);
        assert_eq!(config.client.inbox_lifetime_secs, 300);
        assert!(config.client.personal_key.is_none());

        let policy = config.policy();
        assert_eq!(policy.period, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.rollover_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/mailpool.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let toml = format!("{}\n[upstream]\nbase_url = \"ftp://mail.example\"\n", valid_toml());
        let path = write_config(dir.path(), &toml);

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("base_url must start with http"));
    }

    #[test]
    fn test_rejects_zero_limits() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        for (section, field) in [
            ("upstream", "timeout_secs"),
            ("server", "max_connections"),
            ("client", "retry_attempts"),
        ] {
            // server fields belong in the [server] table already present
            let (server_extra, tail) = if section == "server" {
                (format!("{field} = 0\n"), String::new())
            } else {
                (String::new(), format!("[{section}]\n{field} = 0\n"))
            };
            let toml = format!(
                "[server]\nlisten_addr = \"127.0.0.1:8025\"\n{server_extra}[pool]\nkeys = [\"k\"]\nusage_limit = 1\n{tail}"
            );
            let path = write_config(dir.path(), &toml);
            let err = Config::load(&path).unwrap_err();
            assert!(
                err.to_string().contains(field),
                "expected {field} in error, got: {err}"
            );
        }
    }

    #[test]
    fn test_rejects_period_that_overflows() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "[server]\nlisten_addr = \"127.0.0.1:8025\"\n[pool]\nkeys = [\"k\"]\nperiod_days = {}\n",
            u64::MAX / 1000
        );
        let path = write_config(dir.path(), &toml);

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("period_days is too large"), "got: {err}");
    }

    #[test]
    fn test_policy_period_in_days() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            &format!("{}period_days = 7\n", valid_toml()),
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.policy().period, Duration::from_secs(7 * 24 * 60 * 60));
    }

    #[test]
    fn test_requires_pool_keys_unless_personal() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        unsafe { remove_env(PERSONAL_KEY_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "[server]\nlisten_addr = \"127.0.0.1:8025\"\n");
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("pool.keys must not be empty"));

        let path = write_config(
            dir.path(),
            "[server]\nlisten_addr = \"127.0.0.1:8025\"\n[client]\nmode = \"personal\"\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.client.mode, Mode::Personal);
    }

    #[test]
    fn test_keys_file_is_merged() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let keys_path = dir.path().join("keys.txt");
        std::fs::write(&keys_path, "# shared keys\nfile-key-a\n\n  file-key-b  \n").unwrap();
        let toml = format!(
            "[server]\nlisten_addr = \"127.0.0.1:8025\"\n[pool]\nkeys = [\"inline-key\"]\nkeys_file = \"{}\"\n",
            keys_path.display()
        );
        let path = write_config(dir.path(), &toml);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool.keys, vec!["inline-key", "file-key-a", "file-key-b"]);
    }

    #[test]
    fn test_personal_key_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), valid_toml());

        unsafe { set_env(PERSONAL_KEY_ENV, "env-personal-key") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env(PERSONAL_KEY_ENV) };

        assert_eq!(
            config.client.personal_key.as_ref().map(|s| s.expose().as_str()),
            Some("env-personal-key")
        );
    }

    #[test]
    fn test_personal_key_env_takes_precedence_over_file() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("personal.key");
        std::fs::write(&key_path, "file-personal-key\n").unwrap();
        let toml = format!(
            "{}\n[client]\npersonal_key_file = \"{}\"\n",
            valid_toml(),
            key_path.display()
        );
        let path = write_config(dir.path(), &toml);

        unsafe { remove_env(PERSONAL_KEY_ENV) };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.client.personal_key.as_ref().map(|s| s.expose().as_str()),
            Some("file-personal-key")
        );

        unsafe { set_env(PERSONAL_KEY_ENV, "env-wins") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env(PERSONAL_KEY_ENV) };
        assert_eq!(
            config.client.personal_key.as_ref().map(|s| s.expose().as_str()),
            Some("env-wins")
        );
    }

    #[test]
    fn test_debug_hides_keys() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        unsafe { set_env(PERSONAL_KEY_ENV, "env-personal-key") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), valid_toml());
        let config = Config::load(&path).unwrap();
        unsafe { remove_env(PERSONAL_KEY_ENV) };

        let debug = format!("{config:?}");
        assert!(!debug.contains("pool-key-0"));
        assert!(!debug.contains("env-personal-key"));
        assert!(debug.contains("[2 keys]"));
    }

    #[test]
    fn test_client_config_carries_settings() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        unsafe { remove_env(PERSONAL_KEY_ENV) };
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            "{}\n[client]\nmode = \"combined\"\nnamespace = \"qa\"\nretry_base_delay_ms = 250\nexhaustion_phrases = [\"plan expired\"]\n",
            valid_toml()
        );
        let path = write_config(dir.path(), &toml);
        let client = Config::load(&path).unwrap().client_config().unwrap();

        assert_eq!(client.mode, Mode::Combined);
        assert_eq!(client.namespace.as_deref(), Some("qa"));
        assert_eq!(client.retry.base_delay, Duration::from_millis(250));
        assert_eq!(client.credential_header.as_str(), "x-api-key");
        assert_eq!(client.base_url.host_str(), Some("api.mailslurp.com"));
        assert_eq!(client.exhaustion_phrases, vec!["plan expired"]);
    }

    #[test]
    fn test_resolve_path_cli_takes_precedence() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        unsafe { set_env("CONFIG_PATH", "/env/mailpool.toml") };
        let path = Config::resolve_path(None);
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(path, PathBuf::from("/env/mailpool.toml"));
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("mailpool.toml"));
    }
}
