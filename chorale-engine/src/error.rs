//! Error types for chorale-engine
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation.

use thiserror::Error;

/// Main error type for the engine crate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Opening a media location failed
    #[error("Open failed: {0}")]
    Open(String),

    /// Audio decoding errors
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Playback command rejected by the backend
    #[error("Playback error: {0}")]
    Playback(String),

    /// Invalid timing parameters
    #[error("Invalid timing: {0}")]
    InvalidTiming(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("Malformed URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;
