//! The managed application and its supervised service.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use maas_operator_core::WorkloadFacts;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An administrative account to create.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAccount {
    pub username: String,
    pub password: String,
    pub email: String,
    /// External identity to import keys from, e.g. `gh:someone`.
    pub ssh_import: Option<String>,
}

impl std::fmt::Debug for AdminAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAccount")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("email", &self.email)
            .field("ssh_import", &self.ssh_import)
            .finish()
    }
}

/// Paths of rendered TLS material handed to the workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub cacert: Option<PathBuf>,
}

/// A data set on the workload host that backups carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveKind {
    /// Boot images synced by the region.
    Images,
    /// Curtin and cloud-init preseed templates.
    Preseeds,
}

impl ArchiveKind {
    /// Restore order: preseeds first, images last.
    pub const RESTORE_ORDER: [Self; 2] = [Self::Preseeds, Self::Images];

    /// Object name of the archive inside a backup.
    #[must_use]
    pub const fn file_name(&self) -> &'static str {
        match self {
            Self::Images => "image-storage.tar.gz",
            Self::Preseeds => "preseeds.tar.gz",
        }
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::Preseeds => "preseeds",
        }
    }
}

/// Administration of the wrapped application.
#[async_trait]
pub trait Workload: Send + Sync {
    /// Read installation and initialisation facts.
    async fn facts(&self) -> Result<WorkloadFacts>;

    async fn install(&self, channel: &str) -> Result<()>;

    async fn refresh(&self, channel: &str) -> Result<()>;

    async fn uninstall(&self) -> Result<()>;

    async fn create_admin(&self, account: &AdminAccount) -> Result<()>;

    /// Fetch the API key of an existing user.
    async fn api_key(&self, username: &str) -> Result<String>;

    /// Toggle the metrics endpoint, authenticating as `admin` against `api_url`.
    async fn set_metrics(&self, admin: &str, api_url: &str, enabled: bool) -> Result<()>;

    async fn enable_tls(&self, files: &TlsFiles) -> Result<()>;

    async fn disable_tls(&self) -> Result<()>;

    /// Enroll with a site manager using the token it issued.
    async fn enrol_site_manager(&self, token: &str) -> Result<()>;

    /// System ids of every region controller, read through the API as `admin`.
    async fn region_ids(&self, admin: &str, api_url: &str) -> Result<Vec<String>>;

    /// Pack the `kind` data set into a gzipped tarball at `dest`.
    async fn archive(&self, kind: ArchiveKind, dest: &Path) -> Result<()>;

    /// Replace the `kind` data set with the tarball at `src`.
    ///
    /// An archive without any files is an error and leaves the data set empty.
    async fn restore_archive(&self, kind: ArchiveKind, src: &Path) -> Result<()>;

    /// Record the controller id this machine takes over after a restore.
    async fn set_controller_id(&self, id: &str) -> Result<()>;
}

/// The process supervisor running the workload's service.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Restart so freshly written artifacts take effect.
    async fn restart(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}
