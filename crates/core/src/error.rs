//! Core error types for operator plumbing.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for configuration and model handling.
#[derive(Debug, Error)]
pub enum Error {
    // I/O errors
    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    // Parsing errors
    #[error("TOML parse error in '{path}': {reason}")]
    TomlParseFailed { path: PathBuf, reason: String },

    // Configuration errors
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("invalid value for option '{option}': {reason}")]
    InvalidOption { option: String, reason: String },
}

impl Error {
    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a TOML parse error.
    pub fn toml_parse_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::TomlParseFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an invalid option error.
    pub fn invalid_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}
