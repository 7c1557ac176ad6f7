//! Shared types for the mailpool workspace

mod error;
mod mask;
mod secret;

pub use error::{Error, Result};
pub use mask::mask;
pub use secret::Secret;
