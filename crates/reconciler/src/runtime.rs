//! The orchestration runtime as seen from the reconciler.
//!
//! The runtime owns relation data, secrets and leadership; the reconciler
//! only reads a fresh [`Observation`] per event and writes back through
//! [`Runtime::publish`], [`Runtime::ensure_secret`] and
//! [`Runtime::set_workload_version`].

use async_trait::async_trait;
use maas_operator_core::{DataBag, Observation};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Which data bag of a relation a publication targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// The local unit's own bag.
    Unit,
    /// The local application's bag. Only the leader may write it.
    App,
}

/// Relation data to be written by this unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub endpoint: String,
    pub relation_id: u32,
    pub scope: Scope,
    /// Keys to set; keys not listed are left alone.
    pub data: DataBag,
}

impl Publication {
    pub fn unit(endpoint: impl Into<String>, relation_id: u32, data: DataBag) -> Self {
        Self {
            endpoint: endpoint.into(),
            relation_id,
            scope: Scope::Unit,
            data,
        }
    }

    pub fn app(endpoint: impl Into<String>, relation_id: u32, data: DataBag) -> Self {
        Self {
            endpoint: endpoint.into(),
            relation_id,
            scope: Scope::App,
            data,
        }
    }
}

/// A stored secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub id: String,
    pub content: DataBag,
}

/// Access to the orchestration runtime.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Snapshot the current config, relations and leadership.
    async fn observe(&self) -> Result<Observation>;

    /// Write relation data. Must be idempotent.
    async fn publish(&self, publication: &Publication) -> Result<()>;

    /// Look up a secret owned by this application.
    async fn secret(&self, label: &str) -> Result<Option<Secret>>;

    /// Read a secret another application shared with us, by id.
    async fn granted_secret(&self, id: &str) -> Result<Option<Secret>>;

    /// Create or update the secret under `label`, optionally granting a
    /// relation read access, and return its id.
    async fn ensure_secret(
        &self,
        label: &str,
        content: &DataBag,
        grant: Option<u32>,
    ) -> Result<String>;

    /// Report the workload version shown alongside the unit status.
    async fn set_workload_version(&self, version: &str) -> Result<()>;
}
