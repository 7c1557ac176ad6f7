//! Round-robin key selection, exhaustion and cool-down
//!
//! `PoolState` is the plain data and the pure transitions over it, all taking
//! the current time explicitly. `KeyPool` wraps it in a mutex, persists after
//! every mutation, publishes notifications and records metrics.
//!
//! Rotation always proceeds in slot order from the active slot. It never
//! prefers least-used or least-recently-used keys.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::events::{CredentialRef, EventSink, Notification};
use crate::record::KeyRecord;
use crate::repository::PoolRepository;

/// Usage limits applied to every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    /// Successful requests per accounting window before a key is exhausted
    pub per_period_usage_limit: u32,
    pub daily_request_limit: u32,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            per_period_usage_limit: 50,
            daily_request_limit: 250,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolPolicy {
    pub quota: Quota,
    /// Minimum idle time before an exhausted key is reinstated
    pub cooldown: Duration,
    /// Length of the accounting window
    pub period: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            quota: Quota::default(),
            cooldown: Duration::from_secs(12 * 60 * 60),
            period: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Persisted pool state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolState {
    pub records: Vec<KeyRecord>,
    #[serde(default)]
    pub active_index: usize,
}

impl PoolState {
    pub fn seeded<I, S>(secrets: I, now: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            records: secrets
                .into_iter()
                .map(|s| KeyRecord::fresh(s, now))
                .collect(),
            active_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn available(&self) -> usize {
        self.records.iter().filter(|r| !r.exhausted).count()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.records.len() {
            Ok(())
        } else {
            Err(Error::InvalidIndex {
                index,
                len: self.records.len(),
            })
        }
    }

    /// First non-exhausted slot at or after `from`, wrapping around.
    fn scan_from(&self, from: usize) -> Option<usize> {
        let n = self.records.len();
        (0..n)
            .map(|offset| (from + offset) % n)
            .find(|&i| !self.records[i].exhausted)
    }

    /// Reinstate exhausted records idle for longer than the cool-down.
    ///
    /// Returns how many records were reinstated.
    pub fn cooldown_sweep(&mut self, now: u64, cooldown_millis: u64) -> usize {
        let mut reinstated = 0;
        for record in &mut self.records {
            if record.cooled_down(now, cooldown_millis) {
                record.reinstate();
                reinstated += 1;
            }
        }
        reinstated
    }

    /// Select the slot the next request should use.
    ///
    /// Scans circularly from the active slot. When every record is exhausted
    /// a cool-down sweep runs and, if it reinstated anything, the scan is
    /// retried once.
    pub fn next_available(&mut self, now: u64, cooldown_millis: u64) -> Option<usize> {
        if self.records.is_empty() {
            return None;
        }
        let found = self.scan_from(self.active_index).or_else(|| {
            if self.cooldown_sweep(now, cooldown_millis) > 0 {
                self.scan_from(self.active_index)
            } else {
                None
            }
        })?;
        self.active_index = found;
        Some(found)
    }

    /// Mark a record exhausted and move the active slot past it.
    ///
    /// The active slot becomes the next non-exhausted record after `index`;
    /// when none exists it is left on the slot right after `index` and
    /// callers learn about the exhaustion through `next_available()`.
    pub fn mark_exhausted(&mut self, index: usize, now: u64) -> Result<()> {
        self.check_index(index)?;
        let record = &mut self.records[index];
        record.exhausted = true;
        record.last_used_at = Some(now);

        let n = self.records.len();
        self.active_index = self
            .scan_from((index + 1) % n)
            .unwrap_or((index + 1) % n);
        Ok(())
    }

    /// Count one successful use.
    ///
    /// Returns true when this use reached `limit` and exhausted the record.
    /// A record that is already exhausted keeps counting but is not exhausted
    /// a second time.
    pub fn record_usage(&mut self, index: usize, now: u64, limit: u32) -> Result<bool> {
        self.check_index(index)?;
        let record = &mut self.records[index];
        record.usage_count = record.usage_count.saturating_add(1);
        record.last_used_at = Some(now);
        if record.usage_count >= limit && !record.exhausted {
            self.mark_exhausted(index, now)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Start a new accounting window for records whose window is over.
    ///
    /// Returns how many records rolled over. Idempotent at a fixed `now`.
    pub fn rollover(&mut self, now: u64, period_millis: u64) -> usize {
        let mut rolled = 0;
        for record in &mut self.records {
            if record.period_elapsed(now, period_millis) {
                record.reinstate();
                record.period_started_at = now;
                rolled += 1;
            }
        }
        rolled
    }

    /// Overwrite a slot with a fresh record.
    pub fn replace(&mut self, index: usize, secret: String, now: u64) -> Result<()> {
        self.check_index(index)?;
        self.records[index] = KeyRecord::fresh(secret, now);
        Ok(())
    }

    /// Clear usage and exhaustion everywhere and return to slot 0.
    pub fn reset_all(&mut self, now: u64) {
        for record in &mut self.records {
            record.reinstate();
            record.last_used_at = None;
            record.period_started_at = now;
        }
        self.active_index = 0;
    }

    fn credential_ref(&self, index: usize) -> CredentialRef {
        CredentialRef {
            slot: index,
            fingerprint: self.records[index].fingerprint(),
        }
    }
}

/// A key handed out by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledKey {
    pub slot: usize,
    pub secret: Secret<String>,
}

/// Per-key summary for status displays. Never carries the raw secret.
#[derive(Debug, Clone, Serialize)]
pub struct KeySummary {
    pub slot: usize,
    pub fingerprint: String,
    pub usage_count: u32,
    pub exhausted: bool,
    pub active: bool,
    pub last_used_at: Option<u64>,
    pub period_started_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub available: usize,
    pub active_index: usize,
    pub quota: Quota,
    pub keys: Vec<KeySummary>,
}

/// Process-wide pool of API keys.
///
/// All operations serialize on one mutex and persist while holding it, so
/// concurrent calls never interleave a read-modify-write.
pub struct KeyPool {
    state: Mutex<PoolState>,
    policy: PoolPolicy,
    repository: Arc<dyn PoolRepository>,
    events: EventSink,
    clock: Arc<dyn Clock>,
}

impl KeyPool {
    /// Build the pool from its seed list and whatever the repository holds.
    ///
    /// Persisted state overrides the seed. Unreadable state, or a persisted
    /// pool with no records while the seed has some, falls back to the seed.
    /// A rollover check runs before the pool is returned.
    pub async fn load(
        seed: Vec<String>,
        policy: PoolPolicy,
        repository: Arc<dyn PoolRepository>,
        events: EventSink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_millis();
        let seeded = PoolState::seeded(seed, now);

        let mut state = match repository.load().await {
            Ok(Some(persisted)) if persisted.is_empty() && !seeded.is_empty() => {
                warn!("persisted pool is empty, using configured keys");
                seeded
            }
            Ok(Some(persisted)) => {
                info!(keys = persisted.len(), "restored persisted pool state");
                persisted
            }
            Ok(None) => {
                info!(keys = seeded.len(), "no persisted pool state, using configured keys");
                seeded
            }
            Err(e) => {
                warn!(error = %e, "discarding persisted pool state, using configured keys");
                seeded
            }
        };

        if state.active_index >= state.len() {
            state.active_index = 0;
        }
        let rolled = state.rollover(now, policy.period.as_millis() as u64);
        if rolled > 0 {
            info!(rolled, "accounting window rolled over on load");
        }

        let pool = Self {
            state: Mutex::new(state),
            policy,
            repository,
            events,
            clock,
        };
        {
            let state = pool.state.lock().await;
            pool.persist(&state).await;
            pool.record_gauge(&state);
        }
        pool
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn cooldown_millis(&self) -> u64 {
        self.policy.cooldown.as_millis() as u64
    }

    /// Key the next request should use, or `None` when every key is
    /// exhausted and none has cooled down.
    pub async fn next_available(&self) -> Option<PooledKey> {
        let mut state = self.state.lock().await;
        let now = self.clock.now_millis();
        let before = state.clone();

        let selected = state.next_available(now, self.cooldown_millis());
        let reinstated = before
            .records
            .iter()
            .zip(&state.records)
            .filter(|(old, new)| old.exhausted && !new.exhausted)
            .count();
        if reinstated > 0 {
            info!(reinstated, "cool-down elapsed, keys reinstated");
            metrics::counter!("key_pool_cooldown_resets_total").increment(reinstated as u64);
        }
        if *state != before {
            self.persist(&state).await;
            self.record_gauge(&state);
        }

        match selected {
            Some(slot) => {
                debug!(slot, "selected pool key");
                Some(PooledKey {
                    slot,
                    secret: Secret::new(state.records[slot].secret.clone()),
                })
            }
            None => {
                debug!(keys = state.len(), "no pool key available");
                None
            }
        }
    }

    /// Active slot if it is usable right now, without sweeping or persisting.
    pub async fn active_slot(&self) -> Option<usize> {
        let state = self.state.lock().await;
        state
            .records
            .get(state.active_index)
            .filter(|r| !r.exhausted)
            .map(|_| state.active_index)
    }

    /// Mark a key exhausted, advance the active slot and announce it.
    ///
    /// Returns the key selected in its place (after a cool-down sweep), which
    /// is also what the `credential-exhausted` notification carries.
    pub async fn mark_exhausted(&self, index: usize) -> Result<Option<PooledKey>> {
        let mut state = self.state.lock().await;
        let now = self.clock.now_millis();
        state.mark_exhausted(index, now)?;
        let replacement = state.next_available(now, self.cooldown_millis());
        self.after_exhaustion(&state, index, replacement).await;
        Ok(replacement.map(|slot| PooledKey {
            slot,
            secret: Secret::new(state.records[slot].secret.clone()),
        }))
    }

    /// Count one successful use of a key, exhausting it at the quota.
    pub async fn record_usage(&self, index: usize) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = self.clock.now_millis();
        let limit = self.policy.quota.per_period_usage_limit;
        let tripped = state.record_usage(index, now, limit)?;
        debug!(
            slot = index,
            usage_count = state.records[index].usage_count,
            limit,
            "recorded key usage"
        );
        if tripped {
            info!(slot = index, limit, "key reached its usage limit");
            let replacement = state.next_available(now, self.cooldown_millis());
            self.after_exhaustion(&state, index, replacement).await;
        } else {
            self.persist(&state).await;
        }
        Ok(())
    }

    async fn after_exhaustion(&self, state: &PoolState, index: usize, replacement: Option<usize>) {
        let old = state.credential_ref(index);
        let new = replacement.map(|slot| state.credential_ref(slot));
        match &new {
            Some(new_ref) => info!(
                old_slot = index,
                old_key = %old.fingerprint,
                new_slot = new_ref.slot,
                new_key = %new_ref.fingerprint,
                "key exhausted, rotated"
            ),
            None => warn!(old_slot = index, old_key = %old.fingerprint, "key exhausted, pool has no key left"),
        }
        metrics::counter!("key_pool_exhaustions_total").increment(1);
        if new.is_some() {
            metrics::counter!("key_pool_rotations_total").increment(1);
        }

        self.persist(state).await;
        self.record_gauge(state);
        self.events.publish(Notification::CredentialExhausted {
            old,
            any_available: new.is_some(),
            new,
        });
    }

    /// Roll over keys whose accounting window is over. Returns the count.
    pub async fn rollover_check(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = self.clock.now_millis();
        let rolled = state.rollover(now, self.policy.period.as_millis() as u64);
        if rolled > 0 {
            info!(rolled, "accounting window rolled over");
            self.persist(&state).await;
            self.record_gauge(&state);
        } else {
            debug!("rollover check: nothing to reset");
        }
        rolled
    }

    /// Put a fresh key into an existing slot.
    pub async fn replace(&self, index: usize, secret: String) -> Result<()> {
        if secret.trim().is_empty() {
            return Err(Error::InvalidKey("key must not be empty".into()));
        }
        let mut state = self.state.lock().await;
        let now = self.clock.now_millis();
        state.replace(index, secret, now)?;
        info!(slot = index, key = %state.records[index].fingerprint(), "pool key replaced");
        self.persist(&state).await;
        self.record_gauge(&state);
        Ok(())
    }

    /// Administrative reset: every key usable again, active slot 0.
    pub async fn reset_all(&self) {
        let mut state = self.state.lock().await;
        state.reset_all(self.clock.now_millis());
        info!(keys = state.len(), "pool reset");
        self.persist(&state).await;
        self.record_gauge(&state);
    }

    /// Secret stored in a slot, for direct probes that bypass rotation.
    pub async fn secret_at(&self, index: usize) -> Result<Secret<String>> {
        let state = self.state.lock().await;
        state.check_index(index)?;
        Ok(Secret::new(state.records[index].secret.clone()))
    }

    /// Start of the accounting window of a slot.
    pub async fn period_started_at(&self, index: usize) -> Result<u64> {
        let state = self.state.lock().await;
        state.check_index(index)?;
        Ok(state.records[index].period_started_at)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> PoolState {
        self.state.lock().await.clone()
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let keys = state
            .records
            .iter()
            .enumerate()
            .map(|(slot, r)| KeySummary {
                slot,
                fingerprint: r.fingerprint(),
                usage_count: r.usage_count,
                exhausted: r.exhausted,
                active: slot == state.active_index,
                last_used_at: r.last_used_at,
                period_started_at: r.period_started_at,
            })
            .collect();
        PoolStatus {
            total: state.len(),
            available: state.available(),
            active_index: state.active_index,
            quota: self.policy.quota,
            keys,
        }
    }

    /// Pool health summary for the health endpoint.
    ///
    /// All keys available → healthy, some → degraded, none → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let status = self.status().await;
        let label = if status.total > 0 && status.available == status.total {
            "healthy"
        } else if status.available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };
        serde_json::json!({
            "status": label,
            "keys_total": status.total,
            "keys_available": status.available,
            "keys_exhausted": status.total - status.available,
            "active_index": status.active_index,
        })
    }

    /// User-facing explanation used when nothing can be handed out.
    pub async fn exhausted_message(&self) -> String {
        let state = self.state.lock().await;
        serde_json::json!({
            "error": {
                "type": "pool_exhausted",
                "message": "All public API keys are exhausted. Add a personal API key or wait for the cool-down.",
                "pool": {
                    "keys_total": state.len(),
                    "keys_available": state.available(),
                    "cooldown_secs": self.policy.cooldown.as_secs(),
                }
            }
        })
        .to_string()
    }

    /// Persist, logging failures. Pool operations stay total over valid
    /// slots even when storage is unavailable.
    async fn persist(&self, state: &PoolState) {
        if let Err(e) = self.repository.save(state).await {
            warn!(error = %e, "failed to persist pool state");
        }
    }

    fn record_gauge(&self, state: &PoolState) {
        metrics::gauge!("key_pool_available_keys").set(state.available() as f64);
    }
}
