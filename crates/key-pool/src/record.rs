//! Durable per-key state

use std::fmt;

use serde::{Deserialize, Serialize};

/// One credential slot in the pool.
///
/// Timestamps are unix milliseconds. `usage_count` is only meaningful inside
/// the window that began at `period_started_at`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub secret: String,
    #[serde(default)]
    pub usage_count: u32,
    /// Last successful use or exhaustion; `None` until first use
    #[serde(default)]
    pub last_used_at: Option<u64>,
    #[serde(default)]
    pub exhausted: bool,
    pub period_started_at: u64,
}

impl KeyRecord {
    /// A never-used, non-exhausted record whose window starts at `now`.
    pub fn fresh(secret: impl Into<String>, now: u64) -> Self {
        Self {
            secret: secret.into(),
            usage_count: 0,
            last_used_at: None,
            exhausted: false,
            period_started_at: now,
        }
    }

    /// Exhausted long enough ago to be reinstated.
    ///
    /// Records that were never used have no exhaustion time and never
    /// qualify.
    pub fn cooled_down(&self, now: u64, cooldown_millis: u64) -> bool {
        self.exhausted
            && self
                .last_used_at
                .is_some_and(|at| now.saturating_sub(at) > cooldown_millis)
    }

    /// Whether the accounting window that started at `period_started_at` is over.
    pub fn period_elapsed(&self, now: u64, period_millis: u64) -> bool {
        now.saturating_sub(self.period_started_at) > period_millis
    }

    pub(crate) fn reinstate(&mut self) {
        self.exhausted = false;
        self.usage_count = 0;
    }

    pub fn fingerprint(&self) -> String {
        common::mask(&self.secret)
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("secret", &self.fingerprint())
            .field("usage_count", &self.usage_count)
            .field("last_used_at", &self.last_used_at)
            .field("exhausted", &self.exhausted)
            .field("period_started_at", &self.period_started_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3_600_000;

    #[test]
    fn serializes_camel_case() {
        let record = KeyRecord::fresh("0123456789abcdef", 1_000);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "secret": "0123456789abcdef",
                "usageCount": 0,
                "lastUsedAt": null,
                "exhausted": false,
                "periodStartedAt": 1000
            })
        );
    }

    #[test]
    fn missing_counters_default() {
        let record: KeyRecord =
            serde_json::from_str(r#"{"secret":"k","periodStartedAt":5}"#).unwrap();
        assert_eq!(record.usage_count, 0);
        assert!(!record.exhausted);
        assert_eq!(record.last_used_at, None);
    }

    #[test]
    fn cooled_down_requires_exhaustion_timestamp() {
        let now = 100 * HOUR;
        let mut record = KeyRecord::fresh("k", 0);
        record.exhausted = true;
        assert!(!record.cooled_down(now, 12 * HOUR));

        record.last_used_at = Some(now - 13 * HOUR);
        assert!(record.cooled_down(now, 12 * HOUR));

        record.last_used_at = Some(now - 11 * HOUR);
        assert!(!record.cooled_down(now, 12 * HOUR));
    }

    #[test]
    fn debug_masks_secret() {
        let record = KeyRecord::fresh("0123456789abcdef", 0);
        let debug = format!("{record:?}");
        assert!(debug.contains("01234567..."));
        assert!(!debug.contains("0123456789abcdef"));
    }
}
