//! Error types shared across the workspace.
//!
//! Module-specific error types use thiserror for clear error propagation.

use thiserror::Error;

/// Errors produced by the shared contract layer
#[derive(Error, Debug)]
pub enum Error {
    /// Event bus has no subscribers for a must-deliver event
    #[error("No event subscribers: {0}")]
    NoSubscribers(String),
}

/// Convenience Result type using the shared Error
pub type Result<T> = std::result::Result<T, Error>;
