//! Error types for companion-audio
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation. Nothing in this subsystem is fatal to the surrounding
//! application: decode and scheduling failures degrade to dropped fragments
//! and diagnostic counters at the session boundary. The variants here exist
//! so the components can report *why* something was dropped.

use thiserror::Error;

/// Main error type for the audio subsystem
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Fragment decoding errors (malformed payload, poisoned stream decoder)
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    Output(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// File I/O errors (config loading)
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using the subsystem Error
pub type Result<T> = std::result::Result<T, Error>;
