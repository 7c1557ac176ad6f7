//! Domain operations over the request gateway
//!
//! `ApiClient` is the surface the UI talks to. It is cheap to clone; every
//! clone shares one pool, router, gateway and set of timers.

use std::sync::{Arc, Weak};
use std::time::Duration;

use common::Secret;
use key_pool::{Clock, ExhaustionClassifier, KeyPool, Notification, PoolStatus, ToastKind};
use reqwest::Url;
use reqwest::header::{ACCEPT, HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use storage::KeyValueStore;
use tokio::sync::RwLock;
use tracing::{info, warn};
use transport::{Credential, CredentialOrigin, CredentialSource, HttpRequest, Transport};

use crate::error::{Error, Result};
use crate::gateway::{RequestGateway, RotationBudget, Served, error_message};
use crate::lifetime::InboxReaper;
use crate::model::{
    Attachment, CreateInboxOptions, Email, Inbox, KeyCheck, SendEmailOptions, WaitOptions,
    parse_email_list,
};
use crate::mode::{Mode, ModeRouter};
use crate::namespace::Namespace;
use crate::retry::{RetryPolicy, with_retry};
use crate::settings::Settings;
use crate::usage::{Action, KeyUsageInfo, UsageLimits, UsageTracker};

/// Extra phrases that make a failed inbox creation worth one more try on
/// another key.
const CREATE_INBOX_PHRASES: &[&str] = &["limit", "account", "free account", "action not permitted"];

/// Minimum length accepted for a replacement pool key.
pub const MIN_KEY_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub credential_header: HeaderName,
    pub http_timeout: Duration,
    pub email_wait_timeout: Duration,
    /// Mode used when none is persisted
    pub mode: Mode,
    /// Personal key from the environment; wins over a persisted one
    pub personal_credential: Option<Secret<String>>,
    pub namespace: Option<String>,
    pub inbox_lifetime: Duration,
    /// Schedule deletion for every inbox, whatever credential created it
    pub auto_delete_all: bool,
    /// Never schedule deletion for pool-created inboxes
    pub keep_pooled_inboxes: bool,
    pub retry: RetryPolicy,
    pub plan_type: String,
    /// Keys known to be dead; the client rotates away before creating an inbox
    pub retired_keys: Vec<String>,
    /// Added to the default exhaustion phrases
    pub exhaustion_phrases: Vec<String>,
    /// Pause between probes in `check_all_pool_keys`
    pub probe_pause: Duration,
}

impl ClientConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            credential_header: HeaderName::from_static("x-api-key"),
            http_timeout: Duration::from_secs(30),
            email_wait_timeout: Duration::from_secs(60),
            mode: Mode::Public,
            personal_credential: None,
            namespace: None,
            inbox_lifetime: Duration::from_secs(300),
            auto_delete_all: false,
            keep_pooled_inboxes: false,
            retry: RetryPolicy::default(),
            plan_type: "free".into(),
            retired_keys: Vec::new(),
            exhaustion_phrases: Vec::new(),
            probe_pause: Duration::from_millis(500),
        }
    }
}

/// `/user/info` merged with local usage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    #[serde(flatten)]
    pub account: Map<String, Value>,
    pub mode: Mode,
    #[serde(flatten)]
    pub usage: KeyUsageInfo,
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    http: Duration,
    email_wait: Duration,
}

struct Inner {
    config: ClientConfig,
    pool: Arc<KeyPool>,
    router: Arc<ModeRouter>,
    gateway: RequestGateway,
    settings: Settings,
    namespace: Namespace,
    usage: UsageTracker,
    reaper: InboxReaper,
    clock: Arc<dyn Clock>,
    timeouts: RwLock<Timeouts>,
    create_inbox_classifier: ExhaustionClassifier,
}

#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl ApiClient {
    /// Build the client, restoring mode, personal key, timeouts and
    /// namespace from `store`.
    pub async fn new(
        config: ClientConfig,
        pool: Arc<KeyPool>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let host = config
            .base_url
            .host_str()
            .ok_or_else(|| Error::InvalidInput(format!("base URL {} has no host", config.base_url)))?
            .to_string();
        if config.base_url.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!(
                "base URL {} cannot carry a path",
                config.base_url
            )));
        }

        let settings = Settings::new(store);
        let mode = settings.mode().await?.unwrap_or(config.mode);
        let personal = match config.personal_credential.clone() {
            Some(secret) => Some(secret),
            None => settings.personal_credential().await?,
        };
        let timeouts = Timeouts {
            http: settings.http_timeout().await?.unwrap_or(config.http_timeout),
            email_wait: settings
                .email_wait_timeout()
                .await?
                .unwrap_or(config.email_wait_timeout),
        };
        let namespace = Namespace::resolve(config.namespace.as_deref(), &settings).await?;

        let router = Arc::new(ModeRouter::new(pool.clone(), mode, personal));
        let classifier = ExhaustionClassifier::default().extended(&config.exhaustion_phrases);
        let create_inbox_classifier = classifier.extended(CREATE_INBOX_PHRASES);
        let gateway = RequestGateway::new(
            transport,
            router.clone(),
            classifier,
            config.credential_header.clone(),
            host,
        );
        let clock = pool.clock().clone();
        let usage = UsageTracker::new(
            UsageLimits::from(pool.policy().quota),
            config.plan_type.clone(),
            clock.clone(),
        );

        let active_mode = router.mode().await;
        info!(
            mode = %active_mode,
            namespace = %namespace.prefix(),
            http_timeout_secs = timeouts.http.as_secs(),
            "api client ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pool,
                router,
                gateway,
                settings,
                namespace,
                usage,
                reaper: InboxReaper::new(),
                clock,
                timeouts: RwLock::new(timeouts),
                create_inbox_classifier,
            }),
        })
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.inner.pool
    }

    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    pub fn reaper(&self) -> &InboxReaper {
        &self.inner.reaper
    }

    // --- request plumbing ---

    fn endpoint(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.inner.config.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| Error::InvalidInput("base URL cannot carry a path".into()))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    async fn http_timeout(&self) -> Duration {
        self.inner.timeouts.read().await.http
    }

    /// Run `build()` through the gateway under the generic retry policy.
    /// Retries reuse whatever credential is current; only one rotation is
    /// allowed across all of them.
    async fn call<F>(&self, operation: &'static str, build: F) -> Result<Served>
    where
        F: Fn() -> HttpRequest,
    {
        let budget = RotationBudget::default();
        let served = with_retry(self.inner.config.retry, operation, || {
            self.inner.gateway.execute_within(build(), &budget)
        })
        .await?;
        self.inner.usage.record_request(served.origin).await;
        Ok(served)
    }

    async fn get(&self, operation: &'static str, url: Url) -> Result<Served> {
        let timeout = self.http_timeout().await;
        self.call(operation, || HttpRequest::get(url.clone()).with_timeout(timeout))
            .await
    }

    async fn delete(&self, operation: &'static str, url: Url) -> Result<Served> {
        let timeout = self.http_timeout().await;
        self.call(operation, || HttpRequest::delete(url.clone()).with_timeout(timeout))
            .await
    }

    async fn post(&self, operation: &'static str, url: Url, body: &Value) -> Result<Served> {
        let timeout = self.http_timeout().await;
        self.call(operation, || {
            HttpRequest::post(url.clone()).json(body).with_timeout(timeout)
        })
        .await
    }

    // --- inboxes ---

    /// Inboxes in this client's namespace.
    pub async fn list_inboxes(&self) -> Result<Vec<Inbox>> {
        let served = self.get("list_inboxes", self.endpoint(&["inboxes"], &[])?).await?;
        let inboxes: Vec<Inbox> = decode(&served)?;
        let total = inboxes.len();
        let mine = self.inner.namespace.filter(inboxes);
        self.inner
            .usage
            .set_inbox_count(served.origin, mine.len())
            .await;
        info!(total, visible = mine.len(), "listed inboxes");
        Ok(mine)
    }

    pub async fn get_inbox(&self, inbox_id: &str) -> Result<Inbox> {
        require_id("inbox", inbox_id)?;
        let served = self
            .get("get_inbox", self.endpoint(&["inboxes", inbox_id], &[])?)
            .await?;
        decode(&served)
    }

    /// Create an inbox in this client's namespace.
    ///
    /// If the active pool key is retired it is rotated away first. A failure
    /// that names a quota or account problem marks the key used and repeats
    /// the whole operation once.
    pub async fn create_inbox(&self, options: CreateInboxOptions) -> Result<Inbox> {
        self.rotate_if_retired().await?;

        match self.try_create_inbox(options.clone()).await {
            Err(e) if self.worth_recreating(&e) => {
                warn!(error = %e, "inbox creation rejected, retrying on another key");
                if let Some(origin @ CredentialOrigin::Pool { .. }) = self.inner.router.current_origin().await {
                    self.inner.router.report_exhausted(origin).await;
                }
                self.try_create_inbox(options).await
            }
            result => result,
        }
    }

    fn worth_recreating(&self, error: &Error) -> bool {
        match error {
            Error::CredentialExhausted { .. } => true,
            Error::RemoteRejected { message, .. } => {
                self.inner.create_inbox_classifier.matches(message)
            }
            _ => false,
        }
    }

    async fn rotate_if_retired(&self) -> Result<()> {
        if self.inner.config.retired_keys.is_empty() {
            return Ok(());
        }
        let Some(origin @ CredentialOrigin::Pool { slot }) = self.inner.router.current_origin().await else {
            return Ok(());
        };
        let secret = self.inner.pool.secret_at(slot).await?;
        if self
            .inner
            .config
            .retired_keys
            .iter()
            .any(|retired| retired == secret.expose())
        {
            warn!(slot, key = %secret.masked(), "active key is retired, rotating");
            self.inner.router.report_exhausted(origin).await;
        }
        Ok(())
    }

    async fn try_create_inbox(&self, mut options: CreateInboxOptions) -> Result<Inbox> {
        if let Some(origin) = self.inner.router.current_origin().await {
            self.inner.usage.check(origin, Action::CreateInbox).await?;
        }
        self.inner
            .namespace
            .apply(&mut options, self.inner.clock.now_millis());
        let body = serde_json::to_value(&options)
            .map_err(|e| Error::InvalidInput(format!("inbox options: {e}")))?;

        let served = self
            .post("create_inbox", self.endpoint(&["inboxes"], &[])?, &body)
            .await?;
        let inbox: Inbox = decode(&served)?;
        self.inner.usage.record_inbox_created(served.origin).await;
        info!(
            inbox_id = %inbox.id,
            name = options.name.as_deref().unwrap_or_default(),
            source = served.origin.label(),
            "inbox created"
        );

        self.schedule_deletion(&inbox, served.origin, options.keep)
            .await;
        Ok(inbox)
    }

    async fn schedule_deletion(&self, inbox: &Inbox, origin: CredentialOrigin, keep: bool) {
        let config = &self.inner.config;
        let temporary = config.auto_delete_all
            || (origin.is_pooled() && !keep && !config.keep_pooled_inboxes);
        if !temporary {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let inbox_id = inbox.id.clone();
        let email_address = inbox.email_address.clone();
        self.inner
            .reaper
            .schedule(&inbox.id, config.inbox_lifetime, async move {
                let Some(client) = ApiClient::from_weak(&weak) else {
                    return;
                };
                match client.remove_inbox(&inbox_id).await {
                    Ok(()) => {
                        info!(inbox_id = %inbox_id, "temporary inbox deleted");
                        client
                            .inner
                            .pool
                            .events()
                            .publish(Notification::InboxAutoDeleted {
                                inbox_id,
                                email_address,
                            });
                    }
                    Err(e) => warn!(inbox_id = %inbox_id, error = %e, "automatic inbox deletion failed"),
                }
            })
            .await;
    }

    /// Delete an inbox, draining its emails first. Cancels any scheduled
    /// deletion.
    pub async fn delete_inbox(&self, inbox_id: &str) -> Result<()> {
        require_id("inbox", inbox_id)?;
        self.inner.reaper.cancel(inbox_id).await;
        self.remove_inbox(inbox_id).await
    }

    async fn remove_inbox(&self, inbox_id: &str) -> Result<()> {
        match self.list_emails(inbox_id).await {
            Ok(emails) => {
                for email in emails {
                    if let Err(e) = self.delete_email(&email.id).await {
                        warn!(inbox_id, email_id = %email.id, error = %e, "could not delete email, continuing");
                    }
                }
            }
            Err(e) => warn!(inbox_id, error = %e, "could not list emails before deleting inbox"),
        }

        let served = self
            .delete("delete_inbox", self.endpoint(&["inboxes", inbox_id], &[])?)
            .await?;
        self.inner.usage.record_inbox_deleted(served.origin).await;
        info!(inbox_id, "inbox deleted");
        Ok(())
    }

    // --- emails ---

    pub async fn list_emails(&self, inbox_id: &str) -> Result<Vec<Email>> {
        require_id("inbox", inbox_id)?;
        let url = self.endpoint(&["emails"], &[("inboxId", inbox_id.to_string())])?;
        let served = self.get("list_emails", url).await?;
        let value: Value = decode(&served)?;
        match parse_email_list(value) {
            Some(emails) => Ok(emails),
            None => {
                warn!(inbox_id, "unrecognised email list response, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    pub async fn get_email(&self, email_id: &str) -> Result<Email> {
        require_id("email", email_id)?;
        let url = self.endpoint(
            &["emails", email_id],
            &[("decodeBody", "true".into()), ("htmlBody", "true".into())],
        )?;
        let served = self.get("get_email", url).await?;
        let mut email: Email = decode(&served)?;
        email.apply_mime_body();
        Ok(email)
    }

    pub async fn delete_email(&self, email_id: &str) -> Result<()> {
        require_id("email", email_id)?;
        self.delete("delete_email", self.endpoint(&["emails", email_id], &[])?)
            .await?;
        Ok(())
    }

    /// Send from `inbox_id`. Returns the upstream receipt (`null` when the
    /// API answers with an empty body).
    pub async fn send_email(&self, inbox_id: &str, options: SendEmailOptions) -> Result<Value> {
        require_id("inbox", inbox_id)?;
        if options.to.iter().all(|to| to.trim().is_empty()) {
            return Err(Error::InvalidInput("at least one recipient is required".into()));
        }
        if let Some(origin) = self.inner.router.current_origin().await {
            self.inner.usage.check(origin, Action::SendEmail).await?;
        }
        let body = serde_json::to_value(&options)
            .map_err(|e| Error::InvalidInput(format!("email options: {e}")))?;

        let served = self
            .post("send_email", self.endpoint(&["inboxes", inbox_id], &[])?, &body)
            .await?;
        self.inner.usage.record_email_sent(served.origin).await;
        info!(inbox_id, recipients = options.to.len(), "email sent");
        if served.response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        decode(&served)
    }

    /// Long-poll for the newest email. The attempt timeout covers the
    /// server-side wait plus the normal HTTP timeout.
    pub async fn wait_for_latest_email(&self, inbox_id: &str, options: WaitOptions) -> Result<Email> {
        require_id("inbox", inbox_id)?;
        let timeouts = *self.inner.timeouts.read().await;
        let wait = options.timeout.unwrap_or(timeouts.email_wait);
        let url = self.endpoint(
            &["waitForLatestEmail"],
            &[
                ("inboxId", inbox_id.to_string()),
                ("timeout", wait.as_millis().to_string()),
                ("unreadOnly", options.unread_only.to_string()),
            ],
        )?;
        let attempt_timeout = wait + timeouts.http;
        let served = self
            .call("wait_for_latest_email", || {
                HttpRequest::get(url.clone()).with_timeout(attempt_timeout)
            })
            .await?;
        let mut email: Email = decode(&served)?;
        email.apply_mime_body();
        Ok(email)
    }

    pub async fn download_attachment(&self, attachment_id: &str) -> Result<Attachment> {
        require_id("attachment", attachment_id)?;
        let url = self.endpoint(&["attachments", attachment_id], &[])?;
        let timeout = self.http_timeout().await;
        let served = self
            .call("download_attachment", || {
                let mut request = HttpRequest::get(url.clone()).with_timeout(timeout);
                request.headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
                request
            })
            .await?;
        Ok(Attachment {
            content_type: served.response.content_type().map(str::to_string),
            bytes: served.response.body,
        })
    }

    // --- account and connection ---

    pub async fn check_account_status(&self) -> Result<AccountStatus> {
        let served = self
            .get("check_account_status", self.endpoint(&["user", "info"], &[])?)
            .await?;
        let account: Map<String, Value> = decode(&served)?;
        Ok(AccountStatus {
            account,
            mode: self.get_mode().await,
            usage: self.get_key_usage_info().await?,
        })
    }

    /// Probe the account endpoint and announce the result.
    pub async fn check_connection(&self) -> bool {
        let connected = match self.check_account_status().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "connection check failed");
                false
            }
        };
        let mode = self.get_mode().await;
        info!(connected, mode = %mode, "connection status");
        self.inner
            .pool
            .events()
            .publish(Notification::ConnectionStatusChanged {
                connected,
                mode: mode.to_string(),
            });
        connected
    }

    // --- mode ---

    pub async fn get_mode(&self) -> Mode {
        self.inner.router.mode().await
    }

    pub async fn has_personal_credential(&self) -> bool {
        self.inner.router.has_personal().await
    }

    pub async fn switch_mode(&self, mode: Mode) -> Result<()> {
        self.inner.router.set_mode(mode).await?;
        self.inner.settings.set_mode(mode).await?;
        self.inner
            .pool
            .events()
            .toast(ToastKind::Info, format!("Switched to {mode} mode."));
        Ok(())
    }

    /// Install (or, with `None` or a blank string, clear) the personal key.
    pub async fn set_personal_credential(&self, secret: Option<String>) -> Result<()> {
        let secret = secret
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(Secret::new);
        self.inner
            .settings
            .set_personal_credential(secret.as_ref())
            .await?;
        let cleared = secret.is_none();
        self.inner.router.set_personal(secret).await;
        if cleared {
            // Clearing the key may have dropped personal mode
            self.inner.settings.set_mode(self.get_mode().await).await?;
        }
        Ok(())
    }

    // --- pool administration ---

    pub async fn get_pool_status(&self) -> PoolStatus {
        self.inner.pool.status().await
    }

    pub async fn get_key_usage_info(&self) -> Result<KeyUsageInfo> {
        let origin = self.inner.router.current_origin().await;
        let expires_at = match origin {
            Some(CredentialOrigin::Pool { slot }) => {
                let started = self.inner.pool.period_started_at(slot).await?;
                Some(started + self.inner.pool.policy().period.as_millis() as u64)
            }
            _ => None,
        };
        Ok(self.inner.usage.info(origin, expires_at).await)
    }

    pub async fn reset_pool(&self) {
        self.inner.pool.reset_all().await;
        self.inner
            .pool
            .events()
            .toast(ToastKind::Info, "API key pool reset.");
    }

    /// Put a new key into slot `index`.
    pub async fn replace_pool_key(&self, index: usize, secret: &str) -> Result<()> {
        let secret = secret.trim();
        if secret.len() < MIN_KEY_LEN {
            return Err(Error::InvalidInput(format!(
                "API key must be at least {MIN_KEY_LEN} characters"
            )));
        }
        self.inner.pool.replace(index, secret.to_string()).await?;
        if self.get_mode().await != Mode::Personal {
            self.inner.pool.next_available().await;
        }
        Ok(())
    }

    /// Probe one slot directly, bypassing rotation. A 402 or 429 marks the
    /// slot exhausted.
    pub async fn check_pool_key(&self, index: usize) -> Result<KeyCheck> {
        let secret = self.inner.pool.secret_at(index).await?;
        let fingerprint = secret.masked();
        let credential = Credential::pooled(index, secret);
        let request = HttpRequest::get(self.endpoint(&["user", "info"], &[])?)
            .with_timeout(self.http_timeout().await);

        let check = match self.inner.gateway.send_with(request, &credential).await {
            Ok(response) if response.is_success() => KeyCheck {
                slot: index,
                fingerprint,
                valid: true,
                exhausted: false,
                status: Some(response.status.as_u16()),
                message: None,
            },
            Ok(response) => {
                let status = response.status.as_u16();
                let exhausted = matches!(status, 402 | 429);
                if exhausted {
                    self.inner.pool.mark_exhausted(index).await?;
                }
                KeyCheck {
                    slot: index,
                    fingerprint,
                    valid: false,
                    exhausted,
                    status: Some(status),
                    message: Some(error_message(&response)),
                }
            }
            Err(e) => KeyCheck {
                slot: index,
                fingerprint,
                valid: false,
                exhausted: false,
                status: None,
                message: Some(e.to_string()),
            },
        };
        info!(slot = index, valid = check.valid, status = ?check.status, "pool key checked");
        Ok(check)
    }

    /// Probe every slot in order, pausing between probes.
    pub async fn check_all_pool_keys(&self) -> Result<Vec<KeyCheck>> {
        let len = self.inner.pool.len().await;
        let mut checks = Vec::with_capacity(len);
        for index in 0..len {
            if index > 0 {
                tokio::time::sleep(self.inner.config.probe_pause).await;
            }
            checks.push(self.check_pool_key(index).await?);
        }
        Ok(checks)
    }

    // --- timeouts ---

    pub async fn set_http_timeout(&self, timeout: Duration) -> Result<()> {
        require_nonzero("HTTP timeout", timeout)?;
        self.inner.settings.set_http_timeout(timeout).await?;
        self.inner.timeouts.write().await.http = timeout;
        Ok(())
    }

    pub async fn set_email_wait_timeout(&self, timeout: Duration) -> Result<()> {
        require_nonzero("email wait timeout", timeout)?;
        self.inner.settings.set_email_wait_timeout(timeout).await?;
        self.inner.timeouts.write().await.email_wait = timeout;
        Ok(())
    }

    pub async fn timeouts(&self) -> (Duration, Duration) {
        let t = *self.inner.timeouts.read().await;
        (t.http, t.email_wait)
    }

    /// Cancel pending inbox deletions.
    pub async fn shutdown(&self) {
        let pending = self.inner.reaper.pending().await;
        if pending > 0 {
            info!(pending, "cancelling scheduled inbox deletions");
        }
        self.inner.reaper.shutdown().await;
    }
}

fn decode<T: DeserializeOwned>(served: &Served) -> Result<T> {
    served
        .response
        .json()
        .map_err(|e| Error::Decode(e.to_string()))
}

fn require_id(what: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{what} id is required")));
    }
    Ok(())
}

fn require_nonzero(what: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(Error::InvalidInput(format!("{what} must be greater than zero")));
    }
    Ok(())
}
