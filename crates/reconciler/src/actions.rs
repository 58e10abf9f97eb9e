//! Operator-invoked actions.
//!
//! Requests arrive as a name plus string parameters and are validated into
//! a typed [`Action`] before anything touches the workload. A request that
//! fails validation never changes state.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::workload::AdminAccount;

/// Key/value result returned to the caller.
pub type ActionOutput = BTreeMap<String, String>;

/// A raw action invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ActionRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Why an action did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "kebab-case")]
pub enum ActionError {
    Unknown { name: String },
    MissingParameter { action: String, parameter: String },
    /// The unit is not in a state where the action can run.
    Precondition { reason: String },
    Failed { reason: String },
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown { name } => write!(f, "unknown action '{name}'"),
            Self::MissingParameter { action, parameter } => {
                write!(f, "{action} requires parameter '{parameter}'")
            }
            Self::Precondition { reason } => write!(f, "cannot run now: {reason}"),
            Self::Failed { reason } => write!(f, "action failed: {reason}"),
        }
    }
}

impl std::error::Error for ActionError {}

impl ActionError {
    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::Precondition {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// The action catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    CreateAdmin,
    GetApiKey,
    ListControllers,
    GetApiEndpoint,
    CreateBackup,
    ListBackups,
    RestoreBackup,
}

impl ActionKind {
    pub const ALL: [Self; 7] = [
        Self::CreateAdmin,
        Self::GetApiKey,
        Self::ListControllers,
        Self::GetApiEndpoint,
        Self::CreateBackup,
        Self::ListBackups,
        Self::RestoreBackup,
    ];

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateAdmin => "create-admin",
            Self::GetApiKey => "get-api-key",
            Self::ListControllers => "list-controllers",
            Self::GetApiEndpoint => "get-api-endpoint",
            Self::CreateBackup => "create-backup",
            Self::ListBackups => "list-backups",
            Self::RestoreBackup => "restore-backup",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Parameters that must be present and non-empty.
    #[must_use]
    pub const fn required(&self) -> &'static [&'static str] {
        match self {
            Self::CreateAdmin => &["username", "password", "email"],
            Self::GetApiKey => &["username"],
            Self::RestoreBackup => &["backup-id", "controller-id"],
            Self::ListControllers
            | Self::GetApiEndpoint
            | Self::CreateBackup
            | Self::ListBackups => &[],
        }
    }

    /// Whether the action needs the service to have been configured once.
    ///
    /// Restores run before the database is attached, so never do.
    #[must_use]
    pub const fn needs_service(&self) -> bool {
        matches!(self, Self::CreateAdmin | Self::GetApiKey | Self::CreateBackup)
    }
}

/// A validated action with typed parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateAdmin(AdminAccount),
    GetApiKey { username: String },
    ListControllers,
    GetApiEndpoint,
    CreateBackup,
    ListBackups,
    RestoreBackup {
        backup_id: String,
        controller_id: String,
    },
}

impl Action {
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::CreateAdmin(_) => ActionKind::CreateAdmin,
            Self::GetApiKey { .. } => ActionKind::GetApiKey,
            Self::ListControllers => ActionKind::ListControllers,
            Self::GetApiEndpoint => ActionKind::GetApiEndpoint,
            Self::CreateBackup => ActionKind::CreateBackup,
            Self::ListBackups => ActionKind::ListBackups,
            Self::RestoreBackup { .. } => ActionKind::RestoreBackup,
        }
    }

    /// Validate a request against the catalog.
    ///
    /// # Errors
    ///
    /// - `Unknown` if no action has that name
    /// - `MissingParameter` for the first required parameter that is
    ///   absent or blank
    pub fn from_request(request: &ActionRequest) -> Result<Self, ActionError> {
        let kind = ActionKind::from_name(&request.name).ok_or_else(|| ActionError::Unknown {
            name: request.name.clone(),
        })?;

        if let Some(missing) = kind
            .required()
            .iter()
            .find(|key| request.param(key).is_none())
        {
            return Err(ActionError::MissingParameter {
                action: kind.name().to_string(),
                parameter: (*missing).to_string(),
            });
        }

        let owned = |key: &str| request.param(key).map(str::to_string).unwrap_or_default();

        Ok(match kind {
            ActionKind::CreateAdmin => Self::CreateAdmin(AdminAccount {
                username: owned("username"),
                password: owned("password"),
                email: owned("email"),
                ssh_import: request.param("ssh-import").map(str::to_string),
            }),
            ActionKind::GetApiKey => Self::GetApiKey {
                username: owned("username"),
            },
            ActionKind::ListControllers => Self::ListControllers,
            ActionKind::GetApiEndpoint => Self::GetApiEndpoint,
            ActionKind::CreateBackup => Self::CreateBackup,
            ActionKind::ListBackups => Self::ListBackups,
            ActionKind::RestoreBackup => Self::RestoreBackup {
                backup_id: owned("backup-id"),
                controller_id: owned("controller-id"),
            },
        })
    }
}
