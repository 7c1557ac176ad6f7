//! Durable key-value storage
//!
//! The pool state and the client's scalar settings are persisted through the
//! `KeyValueStore` trait. `FileStore` keeps every entry in a single JSON file
//! and rewrites it atomically on each mutation; `MemoryStore` backs tests and
//! ephemeral sessions.
//!
//! There is no cross-process locking: the last writer wins.

pub mod error;
pub mod file;
pub mod memory;

pub use error::{Error, Result};
pub use file::FileStore;
pub use memory::MemoryStore;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// String-keyed storage of string values.
///
/// Uses `Pin<Box<dyn Future>>` return types so stores can be shared as
/// `Arc<dyn KeyValueStore>`.
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if the key was never set or has been removed.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Insert or overwrite a value and persist it.
    fn set<'a>(&'a self, key: &'a str, value: String) -> StoreFuture<'a, ()>;

    /// Delete a value. Removing a missing key is not an error.
    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;
}
