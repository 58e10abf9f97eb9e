//! Error types for the reconciler crate.

use std::fmt;
use std::path::PathBuf;

use crate::types::Status;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
///
/// Every variant maps onto exactly one [`Status`] via [`Error::status`];
/// nothing escapes the event-handling boundary as a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A required relation or input is absent or incomplete.
    MissingDependency { dependency: String },
    /// An input value is malformed and needs an operator fix.
    Validation { field: String, reason: String },
    /// An external source did not answer in time or at all.
    Unavailable { what: String, reason: String },
    /// Artifact generation failed.
    Render { artifact: String, reason: String },
    /// Writing or replacing an artifact failed.
    Io { path: PathBuf, reason: String },
    /// Restarting or stopping the supervised service failed.
    ServiceControl { reason: String },
    /// A workload administration command failed.
    Workload { command: String, reason: String },
    /// An object storage request failed.
    Storage { operation: String, reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingDependency { dependency } => {
                write!(f, "waiting for {dependency}")
            }
            Self::Validation { field, reason } => {
                write!(f, "invalid {field}: {reason}")
            }
            Self::Unavailable { what, reason } => {
                write!(f, "{what} unavailable: {reason}")
            }
            Self::Render { artifact, reason } => {
                write!(f, "failed to render {artifact}: {reason}")
            }
            Self::Io { path, reason } => {
                write!(f, "failed to write '{}': {reason}", path.display())
            }
            Self::ServiceControl { reason } => {
                write!(f, "service control failed: {reason}")
            }
            Self::Workload { command, reason } => {
                write!(f, "workload command '{command}' failed: {reason}")
            }
            Self::Storage { operation, reason } => {
                write!(f, "object storage {operation} failed: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create a missing dependency error.
    pub fn missing_dependency(dependency: impl Into<String>) -> Self {
        Self::MissingDependency {
            dependency: dependency.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an unavailable error.
    pub fn unavailable(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Create a render error.
    pub fn render(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Render {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }

    /// Create an I/O error.
    pub fn io(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a service control error.
    pub fn service_control(reason: impl Into<String>) -> Self {
        Self::ServiceControl {
            reason: reason.into(),
        }
    }

    /// Create a workload command error.
    pub fn workload(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Workload {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create an object storage error.
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying on the next event can clear this error without
    /// operator intervention.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Validation { .. })
    }

    /// The status this failure is reported as.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::MissingDependency { .. } | Self::Validation { .. } => {
                Status::Blocked(self.to_string())
            }
            Self::Unavailable { .. } => Status::Waiting(self.to_string()),
            Self::Render { .. }
            | Self::Io { .. }
            | Self::ServiceControl { .. }
            | Self::Workload { .. }
            | Self::Storage { .. } => Status::Error(self.to_string()),
        }
    }
}

impl From<maas_operator_core::Error> for Error {
    fn from(err: maas_operator_core::Error) -> Self {
        match err {
            maas_operator_core::Error::InvalidOption { option, reason } => {
                Self::validation(option, reason)
            }
            maas_operator_core::Error::InvalidConfig { reason } => {
                Self::validation("operator configuration", reason)
            }
            other => Self::unavailable("operator state", other.to_string()),
        }
    }
}
