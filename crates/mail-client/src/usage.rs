//! Local per-credential usage accounting
//!
//! Tracks inboxes owned, emails sent and requests made today for each
//! credential, and refuses inbox creation or sending before a call when a
//! local limit is already reached. This is advisory: the upstream service
//! enforces its own quotas, which the gateway handles by rotation.

use std::collections::HashMap;
use std::sync::Arc;

use key_pool::{Clock, Quota};
use serde::Serialize;
use tokio::sync::Mutex;
use transport::CredentialOrigin;

use crate::error::{Error, Result};

const DAY_MILLIS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimits {
    pub inboxes: u32,
    pub daily_requests: u32,
}

impl From<Quota> for UsageLimits {
    fn from(quota: Quota) -> Self {
        Self {
            inboxes: quota.per_period_usage_limit,
            daily_requests: quota.daily_request_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub inboxes: u32,
    pub emails_sent: u32,
    pub requests_today: u32,
}

/// `getKeyUsageInfo()` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUsageInfo {
    pub source: Option<CredentialOrigin>,
    pub usage: Usage,
    pub limits: UsageLimits,
    pub plan_type: String,
    /// End of the active accounting window, unix millis. `None` for the
    /// personal credential.
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateInbox,
    SendEmail,
}

#[derive(Default)]
struct Counters {
    usage: Usage,
    day: u64,
}

pub struct UsageTracker {
    limits: UsageLimits,
    plan_type: String,
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<CredentialOrigin, Counters>>,
}

impl UsageTracker {
    pub fn new(limits: UsageLimits, plan_type: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            plan_type: plan_type.into(),
            clock,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> UsageLimits {
        self.limits
    }

    pub fn plan_type(&self) -> &str {
        &self.plan_type
    }

    async fn with_counters<T>(&self, origin: CredentialOrigin, f: impl FnOnce(&mut Usage) -> T) -> T {
        let today = self.clock.now_millis() / DAY_MILLIS;
        let mut counters = self.counters.lock().await;
        let entry = counters.entry(origin).or_insert_with(|| Counters {
            usage: Usage::default(),
            day: today,
        });
        if entry.day != today {
            entry.day = today;
            entry.usage.requests_today = 0;
        }
        f(&mut entry.usage)
    }

    pub async fn usage(&self, origin: CredentialOrigin) -> Usage {
        self.with_counters(origin, |usage| *usage).await
    }

    pub async fn set_inbox_count(&self, origin: CredentialOrigin, count: usize) {
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        self.with_counters(origin, |usage| usage.inboxes = count).await;
    }

    pub async fn record_request(&self, origin: CredentialOrigin) {
        self.with_counters(origin, |usage| {
            usage.requests_today = usage.requests_today.saturating_add(1)
        })
        .await;
    }

    pub async fn record_inbox_created(&self, origin: CredentialOrigin) {
        self.with_counters(origin, |usage| usage.inboxes = usage.inboxes.saturating_add(1))
            .await;
    }

    pub async fn record_inbox_deleted(&self, origin: CredentialOrigin) {
        self.with_counters(origin, |usage| usage.inboxes = usage.inboxes.saturating_sub(1))
            .await;
    }

    pub async fn record_email_sent(&self, origin: CredentialOrigin) {
        self.with_counters(origin, |usage| {
            usage.emails_sent = usage.emails_sent.saturating_add(1)
        })
        .await;
    }

    /// Refuse `action` if a local limit is already reached for `origin`.
    pub async fn check(&self, origin: CredentialOrigin, action: Action) -> Result<()> {
        let usage = self.usage(origin).await;
        if usage.requests_today >= self.limits.daily_requests {
            return Err(Error::UsageLimit(format!(
                "daily request limit of {} reached",
                self.limits.daily_requests
            )));
        }
        if action == Action::CreateInbox && usage.inboxes >= self.limits.inboxes {
            return Err(Error::UsageLimit(format!(
                "inbox limit of {} reached; delete an inbox first",
                self.limits.inboxes
            )));
        }
        Ok(())
    }

    pub async fn info(&self, origin: Option<CredentialOrigin>, expires_at: Option<u64>) -> KeyUsageInfo {
        let usage = match origin {
            Some(origin) => self.usage(origin).await,
            None => Usage::default(),
        };
        KeyUsageInfo {
            source: origin,
            usage,
            limits: self.limits,
            plan_type: self.plan_type.clone(),
            expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use key_pool::ManualClock;
    use std::time::Duration;

    const SLOT0: CredentialOrigin = CredentialOrigin::Pool { slot: 0 };

    fn tracker(inboxes: u32, daily: u32) -> (UsageTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let tracker = UsageTracker::new(
            UsageLimits {
                inboxes,
                daily_requests: daily,
            },
            "free",
            clock.clone(),
        );
        (tracker, clock)
    }

    #[tokio::test]
    async fn inbox_limit_blocks_creation_only() {
        let (tracker, _clock) = tracker(2, 100);
        tracker.set_inbox_count(SLOT0, 2).await;
        assert!(matches!(
            tracker.check(SLOT0, Action::CreateInbox).await,
            Err(Error::UsageLimit(_))
        ));
        assert!(tracker.check(SLOT0, Action::SendEmail).await.is_ok());

        tracker.record_inbox_deleted(SLOT0).await;
        assert!(tracker.check(SLOT0, Action::CreateInbox).await.is_ok());
    }

    #[tokio::test]
    async fn daily_counter_resets_at_day_boundary() {
        let (tracker, clock) = tracker(50, 2);
        tracker.record_request(SLOT0).await;
        tracker.record_request(SLOT0).await;
        assert!(tracker.check(SLOT0, Action::SendEmail).await.is_err());

        clock.advance(Duration::from_secs(24 * 3600));
        assert!(tracker.check(SLOT0, Action::SendEmail).await.is_ok());
        assert_eq!(tracker.usage(SLOT0).await.requests_today, 0);
    }

    #[tokio::test]
    async fn counters_are_per_credential() {
        let (tracker, _clock) = tracker(50, 250);
        tracker.record_email_sent(SLOT0).await;
        assert_eq!(tracker.usage(SLOT0).await.emails_sent, 1);
        assert_eq!(
            tracker.usage(CredentialOrigin::Personal).await.emails_sent,
            0
        );
    }

    #[tokio::test]
    async fn info_serializes_camel_case() {
        let (tracker, _clock) = tracker(50, 250);
        let info = tracker.info(Some(SLOT0), Some(42)).await;
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["planType"], "free");
        assert_eq!(json["expiresAt"], 42);
        assert_eq!(json["limits"]["dailyRequests"], 250);
        assert_eq!(json["usage"]["requestsToday"], 0);
        assert_eq!(json["source"]["source"], "pool");
    }
}
