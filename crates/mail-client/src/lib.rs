//! Client for the upstream transactional-email API
//!
//! Layers, bottom up:
//! - `RequestGateway` attaches a credential to each request and rotates
//!   once when the response names a quota or invalid-key problem
//! - `ModeRouter` decides which credential source a call uses (shared
//!   pool, personal key, or pool with personal fallback)
//! - `ApiClient` exposes inbox and email operations with backoff, caller
//!   namespacing, local usage limits and temporary-inbox cleanup

pub mod client;
pub mod error;
pub mod gateway;
pub mod lifetime;
pub mod mode;
pub mod model;
pub mod namespace;
pub mod retry;
pub mod settings;
pub mod usage;

#[cfg(test)]
mod testing;

pub use client::{AccountStatus, ApiClient, ClientConfig, MIN_KEY_LEN};
pub use error::{Error, ErrorKind, Result};
pub use gateway::{RequestGateway, RotationBudget, Served};
pub use mode::{Mode, ModeRouter};
pub use model::{
    Attachment, CreateInboxOptions, Email, Inbox, KeyCheck, SendEmailOptions, WaitOptions,
};
pub use retry::{RetryPolicy, with_retry};
pub use usage::{KeyUsageInfo, Usage, UsageLimits};
