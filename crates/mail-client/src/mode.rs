//! Credential-source policy
//!
//! The mode decides which credential a call uses:
//! - `public`: always the shared pool
//! - `personal`: always the user's own key
//! - `combined`: the pool first; when it is spent, fail over to the personal
//!   key; when the personal key is spent, fail back to the pool if it has
//!   recovered
//!
//! Failover inside `combined` never changes the mode itself, only which side
//! is active. The router is the `CredentialSource` the gateway talks to.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use key_pool::{Clock, KeyPool, ToastKind};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use transport::{Credential, CredentialOrigin, CredentialSource, SourceError, SourceFuture};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Public,
    Personal,
    Combined,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Public => "public",
            Mode::Personal => "personal",
            Mode::Combined => "combined",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Mode::Public),
            "personal" => Ok(Mode::Personal),
            "combined" => Ok(Mode::Combined),
            other => Err(Error::InvalidInput(format!(
                "unknown mode {other:?} (expected public, personal or combined)"
            ))),
        }
    }
}

struct PersonalKey {
    secret: Secret<String>,
    exhausted_at: Option<u64>,
}

struct RouterState {
    mode: Mode,
    personal: Option<PersonalKey>,
    /// In combined mode: the personal key is the active side
    using_personal: bool,
}

/// Mode state machine and the credential source built on it.
pub struct ModeRouter {
    pool: Arc<KeyPool>,
    state: Mutex<RouterState>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
}

impl ModeRouter {
    pub fn new(pool: Arc<KeyPool>, mode: Mode, personal: Option<Secret<String>>) -> Self {
        let clock = pool.clock().clone();
        let cooldown = pool.policy().cooldown;
        let mode = match (mode, &personal) {
            (Mode::Personal, None) => {
                warn!("personal mode without a personal key, falling back to public");
                Mode::Public
            }
            (mode, _) => mode,
        };
        Self {
            pool,
            state: Mutex::new(RouterState {
                mode,
                personal: personal.map(|secret| PersonalKey {
                    secret,
                    exhausted_at: None,
                }),
                using_personal: false,
            }),
            clock,
            cooldown,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub async fn mode(&self) -> Mode {
        self.state.lock().await.mode
    }

    pub async fn has_personal(&self) -> bool {
        self.state.lock().await.personal.is_some()
    }

    /// Switch modes. Personal mode requires a personal key.
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut state = self.state.lock().await;
        if mode == Mode::Personal && state.personal.is_none() {
            return Err(Error::InvalidInput(
                "personal mode requires a personal API key".into(),
            ));
        }
        let previous = state.mode;
        state.mode = mode;
        state.using_personal = false;
        if let Some(personal) = state.personal.as_mut() {
            personal.exhausted_at = None;
        }
        info!(from = %previous, to = %mode, "mode switched");
        Ok(())
    }

    /// Install or clear the personal key.
    ///
    /// Clearing it while in personal mode drops back to public.
    pub async fn set_personal(&self, secret: Option<Secret<String>>) {
        let mut state = self.state.lock().await;
        match secret {
            Some(secret) => {
                info!(key = %secret.masked(), "personal key set");
                state.personal = Some(PersonalKey {
                    secret,
                    exhausted_at: None,
                });
            }
            None => {
                info!("personal key cleared");
                state.personal = None;
                state.using_personal = false;
                if state.mode == Mode::Personal {
                    state.mode = Mode::Public;
                }
            }
        }
    }

    /// Origin the next call would most likely use, without side effects.
    pub async fn current_origin(&self) -> Option<CredentialOrigin> {
        let (mode, using_personal, personal_usable) = {
            let state = self.state.lock().await;
            let usable = state
                .personal
                .as_ref()
                .is_some_and(|p| self.personal_usable(p));
            (state.mode, state.using_personal, usable)
        };
        match mode {
            Mode::Personal => personal_usable.then_some(CredentialOrigin::Personal),
            Mode::Combined if using_personal && personal_usable => Some(CredentialOrigin::Personal),
            Mode::Public | Mode::Combined => self
                .pool
                .active_slot()
                .await
                .map(|slot| CredentialOrigin::Pool { slot }),
        }
    }

    fn personal_usable(&self, personal: &PersonalKey) -> bool {
        match personal.exhausted_at {
            None => true,
            Some(at) => {
                self.clock.now_millis().saturating_sub(at) > self.cooldown.as_millis() as u64
            }
        }
    }

    fn usable_personal(&self, state: &mut RouterState) -> Option<Credential> {
        let usable = state
            .personal
            .as_ref()
            .is_some_and(|p| self.personal_usable(p));
        let personal = state.personal.as_mut().filter(|_| usable)?;
        personal.exhausted_at = None;
        Some(Credential::personal(personal.secret.clone()))
    }

    async fn pooled(&self) -> Option<Credential> {
        self.pool
            .next_available()
            .await
            .map(|key| Credential::pooled(key.slot, key.secret))
    }

    fn announce_failover(&self, message: &str) {
        self.pool.events().toast(ToastKind::Warning, message);
    }

    fn announce_total_exhaustion(&self, mode: Mode) {
        let message = match mode {
            Mode::Personal => "Your personal API key is exhausted. Wait for the limit to reset or switch to public mode.",
            _ => "All public API keys are exhausted. Add your personal API key in settings.",
        };
        self.pool.events().toast(ToastKind::Error, message);
    }
}

impl CredentialSource for ModeRouter {
    fn id(&self) -> &str {
        "router"
    }

    fn acquire(&self) -> SourceFuture<'_, std::result::Result<Credential, SourceError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            match state.mode {
                Mode::Public => match self.pooled().await {
                    Some(credential) => Ok(credential),
                    None => Err(SourceError::Exhausted(self.pool.exhausted_message().await)),
                },
                Mode::Personal => self.usable_personal(&mut state).ok_or_else(|| {
                    SourceError::Exhausted(
                        "personal API key is exhausted; wait for the cool-down or switch mode"
                            .into(),
                    )
                }),
                Mode::Combined => {
                    if state.using_personal {
                        if let Some(credential) = self.usable_personal(&mut state) {
                            return Ok(credential);
                        }
                        if let Some(credential) = self.pooled().await {
                            info!("personal key unavailable, back on the pool");
                            state.using_personal = false;
                            return Ok(credential);
                        }
                    } else {
                        if let Some(credential) = self.pooled().await {
                            return Ok(credential);
                        }
                        if let Some(credential) = self.usable_personal(&mut state) {
                            info!("pool exhausted, failing over to the personal key");
                            state.using_personal = true;
                            self.announce_failover("Public API keys exhausted, using your personal key.");
                            return Ok(credential);
                        }
                    }
                    Err(SourceError::Exhausted(
                        "all public API keys and the personal key are exhausted".into(),
                    ))
                }
            }
        })
    }

    fn record_success(&self, origin: CredentialOrigin) -> SourceFuture<'_, ()> {
        Box::pin(async move {
            if origin.is_pooled() {
                self.pool.record_success(origin).await;
            }
        })
    }

    fn report_exhausted(&self, origin: CredentialOrigin) -> SourceFuture<'_, Option<Credential>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mode = state.mode;
            let replacement = match origin {
                CredentialOrigin::Pool { .. } => {
                    let replacement = self.pool.report_exhausted(origin).await;
                    match (mode, replacement) {
                        (_, Some(credential)) => {
                            self.pool
                                .events()
                                .toast(ToastKind::Info, "API key limit reached, switched to the next key.");
                            Some(credential)
                        }
                        (Mode::Combined, None) => {
                            let personal = self.usable_personal(&mut state);
                            if personal.is_some() {
                                info!("pool exhausted, failing over to the personal key");
                                state.using_personal = true;
                                self.announce_failover("Public API keys exhausted, using your personal key.");
                            }
                            personal
                        }
                        (_, None) => None,
                    }
                }
                CredentialOrigin::Personal => {
                    if let Some(personal) = state.personal.as_mut() {
                        warn!(key = %personal.secret.masked(), "personal key exhausted");
                        personal.exhausted_at = Some(self.clock.now_millis());
                    }
                    state.using_personal = false;
                    if mode == Mode::Combined {
                        let pooled = self.pooled().await;
                        if pooled.is_some() {
                            info!("personal key exhausted, back on the pool");
                            self.announce_failover("Personal API key exhausted, using public keys.");
                        }
                        pooled
                    } else {
                        None
                    }
                }
            };
            if replacement.is_none() {
                self.announce_total_exhaustion(mode);
            }
            replacement
        })
    }
}
