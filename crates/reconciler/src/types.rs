//! Core types for the reconciler.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::actions::{ActionError, ActionOutput, ActionRequest};
use crate::fingerprint::Fingerprint;

/// Identifies the relation an event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRef {
    /// Local endpoint name.
    pub endpoint: String,
    /// Runtime relation id.
    pub id: u32,
    /// Remote unit the event concerns, when there is one.
    #[serde(default)]
    pub unit: Option<String>,
}

impl RelationRef {
    pub fn new(endpoint: impl Into<String>, id: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            id,
            unit: None,
        }
    }

    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// Lifecycle events delivered by the orchestration runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Event {
    Install,
    ConfigChanged,
    RelationJoined(RelationRef),
    RelationChanged(RelationRef),
    RelationDeparted(RelationRef),
    RelationBroken(RelationRef),
    LeaderElected,
    Upgrade,
    ActionInvoked(ActionRequest),
    UpdateStatus,
    Remove,
}

impl Event {
    /// Short name used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::ConfigChanged => "config-changed",
            Self::RelationJoined(_) => "relation-joined",
            Self::RelationChanged(_) => "relation-changed",
            Self::RelationDeparted(_) => "relation-departed",
            Self::RelationBroken(_) => "relation-broken",
            Self::LeaderElected => "leader-elected",
            Self::Upgrade => "upgrade",
            Self::ActionInvoked(_) => "action",
            Self::UpdateStatus => "update-status",
            Self::Remove => "remove",
        }
    }
}

/// Status reported back to the runtime after each event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "kebab-case")]
pub enum Status {
    Active(Option<String>),
    Waiting(String),
    Blocked(String),
    Error(String),
}

impl Status {
    #[must_use]
    pub const fn active() -> Self {
        Self::Active(None)
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// Human-readable message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Active(message) => message.as_deref(),
            Self::Waiting(message) | Self::Blocked(message) | Self::Error(message) => {
                Some(message.as_str())
            }
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::Waiting("waiting for first event".to_string())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Active(_) => "active",
            Self::Waiting(_) => "waiting",
            Self::Blocked(_) => "blocked",
            Self::Error(_) => "error",
        };
        match self.message() {
            Some(message) => write!(f, "{state}: {message}"),
            None => write!(f, "{state}"),
        }
    }
}

/// Outcome of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled {
    pub status: Status,
    /// Set only for [`Event::ActionInvoked`].
    pub action: Option<std::result::Result<ActionOutput, ActionError>>,
}

impl Handled {
    #[must_use]
    pub const fn status(status: Status) -> Self {
        Self {
            status,
            action: None,
        }
    }
}

/// What has actually been applied to disk and the workload.
///
/// Only ever replaced wholesale after a fully successful apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    /// Fingerprint of the service configuration last written and restarted.
    pub service: Option<Fingerprint>,
    /// Fingerprint of the leader duties last carried out.
    pub leader: Option<Fingerprint>,
    /// Artifact files currently managed, relative to the config directory.
    pub artifacts: Vec<PathBuf>,
}

impl AppliedState {
    #[must_use]
    pub const fn is_service_applied(&self) -> bool {
        self.service.is_some()
    }
}
