//! Result type definition and logging combinators.
//!
//! Lets callers degrade a failed read to a fallback without unwrap/expect
//! while still leaving a trace of what went wrong.

use crate::error::Error;

/// The standard Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for results whose failure is tolerable.
pub trait ResultExt<T> {
    /// Get the value or a default, logging the error if present.
    fn or_default_logged(self, default: T) -> T;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn or_default_logged(self, default: T) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "operation failed, using default");
                default
            }
        }
    }
}
