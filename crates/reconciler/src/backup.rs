//! Backups of region data to object storage.
//!
//! A backup lives under `<path>/backup/<id>/` in the bucket and holds the
//! region controller ids, one gzipped tarball per [`ArchiveKind`] and a
//! metadata file written last. A backup is complete only when all four
//! objects exist and the metadata records success.
//!
//! The bucket is claimed for one deployment by a `model-uuid.txt` object at
//! the root of the path; backups from another deployment are never mixed in.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use maas_operator_core::TimeoutConfig;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::desired::ObjectStorage;
use crate::error::{Error, Result};
use crate::reconciler::within;
use crate::workload::{ArchiveKind, Workload};

/// `strftime` layout of backup ids.
pub const BACKUP_ID_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
pub const MODEL_UUID_FILE: &str = "model-uuid.txt";
pub const METADATA_FILE: &str = "backup_metadata.json";
pub const CONTROLLERS_FILE: &str = "controllers.txt";
/// Written before each backup to check the credentials can upload.
pub const LATEST_MARKER: &str = "backup/latest";

const SIZE_PREFIXES: [&str; 11] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi", "Yi", "Ri", "Qi"];

/// One stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// Objects directly under a prefix, and the prefixes one level down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub objects: Vec<ObjectEntry>,
    /// Sub-prefixes, each ending in `/`.
    pub prefixes: Vec<String>,
}

/// A bucket in some object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket unless it already exists.
    async fn ensure_bucket(&self) -> Result<()>;

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;

    /// Upload the file at `path` without loading it into memory.
    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;

    /// `None` when there is no such object.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Download into `dest`; `false` when there is no such object.
    async fn get_file(&self, key: &str, dest: &Path) -> Result<bool>;

    /// List one level below `prefix`, using `/` as the delimiter.
    async fn list(&self, prefix: &str) -> Result<Listing>;
}

/// Opens a store for the credentials a storage relation offers.
#[async_trait]
pub trait ObjectStoreProvider: Send + Sync {
    async fn connect(&self, storage: &ObjectStorage) -> Result<Arc<dyn ObjectStore>>;
}

/// Object keys under the configured path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    prefix: String,
}

impl Layout {
    #[must_use]
    pub fn new(path: &str) -> Self {
        Self {
            prefix: path.trim_matches('/').to_string(),
        }
    }

    /// Key of `relative` under the configured path.
    #[must_use]
    pub fn key(&self, relative: &str) -> String {
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{relative}", self.prefix)
        }
    }

    #[must_use]
    pub fn backups(&self) -> String {
        self.key("backup/")
    }

    #[must_use]
    pub fn backup(&self, id: &str) -> String {
        self.key(&format!("backup/{id}/"))
    }

    #[must_use]
    pub fn object(&self, id: &str, name: &str) -> String {
        self.key(&format!("backup/{id}/{name}"))
    }
}

/// Written next to each backup's archives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupMetadata {
    pub maas_snap_version: String,
    pub maas_snap_channel: String,
    pub unit_name: String,
    pub success: bool,
}

/// What `list-backups` reports for one backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub id: String,
    /// Total bytes of every object in the backup.
    pub size: u64,
    pub controllers: Vec<String>,
    pub completed: bool,
    /// Workload version the backup was taken from.
    pub version: String,
}

impl BackupSummary {
    #[must_use]
    pub const fn status(&self) -> &'static str {
        if self.completed { "finished" } else { "failed" }
    }
}

/// Inputs of one backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub id: String,
    pub app: String,
    pub unit: String,
    pub version: String,
    pub channel: String,
    /// Account the region list is read as.
    pub admin: String,
    pub api_url: String,
}

/// Inputs of one restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub backup_id: String,
    pub controller_id: String,
    pub installed_version: String,
    /// Region units in the deployment, this one included.
    pub region_units: usize,
}

/// Id for a backup started now.
#[must_use]
pub fn new_backup_id() -> String {
    chrono::Utc::now().format(BACKUP_ID_FORMAT).to_string()
}

/// Render a byte count in binary units, e.g. `1.5KiB`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn as_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut prefixes = SIZE_PREFIXES.iter();
    let mut prefix = prefixes.next().copied().unwrap_or_default();
    while value >= 1024.0 {
        let Some(&next) = prefixes.next() else { break };
        value /= 1024.0;
        prefix = next;
    }
    format!("{value:.1}{prefix}B")
}

/// Format backups as the table `list-backups` returns.
#[must_use]
pub fn format_backup_list(bucket: &str, layout: &Layout, backups: &[BackupSummary]) -> String {
    let header = format!(
        "{:<20} | {:<11} | {:<8} | {:<8} | {:<10} | {:<22} | {}",
        "backup-id", "action", "status", "maas", "size", "controllers", "backup-path"
    );
    let mut out = format!(
        "Storage bucket name: {bucket}\nBackups base path: /{}\n\n{header}\n{}",
        layout.backups(),
        "-".repeat(header.len())
    );
    for backup in backups {
        let _ = write!(
            out,
            "\n{:<20} | {:<11} | {:<8} | {:<8} | {:<10} | {:<22} | /{}",
            backup.id,
            "full backup",
            backup.status(),
            backup.version,
            as_size(backup.size),
            backup.controllers.join(", "),
            layout.key(&format!("backup/{}", backup.id)),
        );
    }
    out
}

fn version_parts(version: &str) -> Option<(u64, u64, u64)> {
    let release = version.split('/').next()?.split('-').next()?;
    let mut parts = release.split('.').map(str::trim);
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let point = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    Some((major, minor, point))
}

/// Whether a backup taken on `backup` can be restored onto `installed`:
/// same major and minor release, installed point release not older.
///
/// # Errors
///
/// Returns the reason the versions are incompatible.
pub fn check_version(installed: &str, backup: &str) -> std::result::Result<(), String> {
    let installed = version_parts(installed)
        .ok_or_else(|| format!("cannot read installed version '{installed}'"))?;
    let backup =
        version_parts(backup).ok_or_else(|| format!("cannot read backup version '{backup}'"))?;
    if installed.0 != backup.0 {
        return Err("MAAS major version does not match backup major version".to_string());
    }
    if installed.1 != backup.1 {
        return Err("MAAS minor version does not match backup minor version".to_string());
    }
    if installed.2 < backup.2 {
        return Err(
            "MAAS point version is not greater or equal to backup point version".to_string(),
        );
    }
    Ok(())
}

/// Check a restore target against the backup's controller list.
///
/// # Errors
///
/// Returns the reason when the unit count differs from the backup or
/// `controller_id` is not one of the backed up controllers.
pub fn check_controllers(
    controllers: &[String],
    region_units: usize,
    controller_id: &str,
) -> std::result::Result<(), String> {
    if controllers.len() != region_units {
        return Err(format!(
            "the number of region units ({region_units}) does not match the backup ({})",
            controllers.len()
        ));
    }
    if !controllers.iter().any(|c| c == controller_id) {
        return Err(format!(
            "{controller_id} is not a valid ID from the controllers list; should be one of {}",
            controllers.join(", ")
        ));
    }
    Ok(())
}

fn lines(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn scratch_dir() -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("maas-backup-")
        .tempdir()
        .map_err(|e| Error::io(std::env::temp_dir(), e.to_string()))
}

/// Backup operations against one connected store.
pub struct Backups<'a> {
    store: &'a dyn ObjectStore,
    workload: &'a dyn Workload,
    layout: Layout,
    timeouts: TimeoutConfig,
}

impl<'a> Backups<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn ObjectStore,
        workload: &'a dyn Workload,
        storage: &ObjectStorage,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            store,
            workload,
            layout: Layout::new(&storage.path),
            timeouts,
        }
    }

    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    async fn transfer<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        within(self.timeouts.transfer(), fut, |limit| {
            Error::storage(operation, format!("timed out after {}ms", limit.as_millis()))
        })
        .await
    }

    async fn command<T>(&self, name: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        within(self.timeouts.command(), fut, |limit| {
            Error::workload(name, format!("timed out after {}ms", limit.as_millis()))
        })
        .await
    }

    /// Create the bucket if needed and claim it for `deployment`.
    ///
    /// # Errors
    ///
    /// - `Validation` if the bucket already holds another deployment's backups
    /// - `Storage` if the store cannot be reached
    pub async fn claim(&self, deployment: &str) -> Result<()> {
        self.transfer("create-bucket", self.store.ensure_bucket())
            .await?;
        let key = self.layout.key(MODEL_UUID_FILE);
        match self.transfer("download", self.store.get(&key)).await? {
            Some(owner) if String::from_utf8_lossy(&owner).trim() != deployment => {
                Err(Error::validation(
                    "object storage",
                    "the bucket has backups from another deployment",
                ))
            }
            Some(_) => Ok(()),
            None => {
                self.transfer("upload", self.store.put(&key, deployment.as_bytes().to_vec()))
                    .await
            }
        }
    }

    /// Archive and upload everything, then record the outcome.
    ///
    /// Metadata is uploaded even when the archives failed, marking the
    /// backup as failed.
    ///
    /// # Errors
    ///
    /// Returns the first failure of the upload check, the archives or the
    /// metadata upload.
    pub async fn create(&self, request: &BackupRequest) -> Result<()> {
        let marker = format!(
            "Date Backup Requested: {}\nApplication Name: {}\nUnit Name: {}\n",
            request.id, request.app, request.unit
        );
        self.transfer(
            "upload",
            self.store.put(&self.layout.key(LATEST_MARKER), marker.into_bytes()),
        )
        .await?;

        let outcome = self.upload_contents(request).await;
        if let Err(e) = &outcome {
            warn!(backup = %request.id, error = %e, "backup contents not uploaded");
        }

        let metadata = BackupMetadata {
            maas_snap_version: request.version.clone(),
            maas_snap_channel: request.channel.clone(),
            unit_name: request.unit.clone(),
            success: outcome.is_ok(),
        };
        let encoded = serde_json::to_vec(&metadata)
            .map_err(|e| Error::render(METADATA_FILE, e.to_string()))?;
        self.transfer(
            "upload",
            self.store.put(&self.layout.object(&request.id, METADATA_FILE), encoded),
        )
        .await?;

        outcome?;
        info!(backup = %request.id, "backup created");
        Ok(())
    }

    async fn upload_contents(&self, request: &BackupRequest) -> Result<()> {
        let regions = self
            .command(
                "region-controllers",
                self.workload.region_ids(&request.admin, &request.api_url),
            )
            .await?;
        self.transfer(
            "upload",
            self.store.put(
                &self.layout.object(&request.id, CONTROLLERS_FILE),
                regions.join("\n").into_bytes(),
            ),
        )
        .await?;

        let scratch = scratch_dir()?;
        for kind in [ArchiveKind::Images, ArchiveKind::Preseeds] {
            let path = scratch.path().join(kind.file_name());
            within(self.timeouts.transfer(), self.workload.archive(kind, &path), |limit| {
                Error::workload("archive", format!("timed out after {}ms", limit.as_millis()))
            })
            .await?;
            self.transfer(
                "upload",
                self.store
                    .put_file(&self.layout.object(&request.id, kind.file_name()), &path),
            )
            .await?;
            info!(backup = %request.id, archive = kind.label(), "archive uploaded");
        }
        Ok(())
    }

    /// Every backup under the configured path, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a `Storage` error if listing or reading fails.
    pub async fn list(&self) -> Result<Vec<BackupSummary>> {
        let root = self.layout.backups();
        let listing = self.transfer("list", self.store.list(&root)).await?;
        let mut backups = Vec::new();
        for prefix in &listing.prefixes {
            let Some(id) = prefix.strip_prefix(&root).map(|p| p.trim_end_matches('/')) else {
                continue;
            };
            if !id.is_empty() {
                backups.push(self.summary(id).await?);
            }
        }
        backups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(backups)
    }

    async fn summary(&self, id: &str) -> Result<BackupSummary> {
        let dir = self.layout.backup(id);
        let listing = self.transfer("list", self.store.list(&dir)).await?;
        let size = listing.objects.iter().map(|o| o.size).sum();
        let names: BTreeSet<&str> = listing
            .objects
            .iter()
            .filter_map(|o| o.key.strip_prefix(&dir))
            .collect();
        let complete = names
            == BTreeSet::from([
                METADATA_FILE,
                CONTROLLERS_FILE,
                ArchiveKind::Images.file_name(),
                ArchiveKind::Preseeds.file_name(),
            ]);

        let metadata = match self.read(&self.layout.object(id, METADATA_FILE)).await? {
            None => BackupMetadata::default(),
            Some(body) => serde_json::from_slice(&body).unwrap_or_else(|e| {
                warn!(backup = id, error = %e, "unreadable backup metadata");
                BackupMetadata::default()
            }),
        };
        let controllers = self
            .read(&self.layout.object(id, CONTROLLERS_FILE))
            .await?
            .map(|body| lines(&body))
            .unwrap_or_default();

        Ok(BackupSummary {
            id: id.to_string(),
            size,
            controllers,
            completed: metadata.success && complete,
            version: metadata.maas_snap_version,
        })
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.transfer("download", self.store.get(key)).await
    }

    /// Restore a backup onto this machine.
    ///
    /// Checks the version and controller list first; nothing on the
    /// workload changes until both pass.
    ///
    /// # Errors
    ///
    /// - `Validation` for an unknown backup id, incompatible version or
    ///   controller mismatch
    /// - `Storage` if an object is missing or cannot be downloaded
    /// - `Workload` if an archive cannot be unpacked
    pub async fn restore(&self, request: &RestoreRequest) -> Result<()> {
        let id = request.backup_id.as_str();
        if !self.list().await?.iter().any(|b| b.id == id) {
            return Err(Error::validation("backup-id", format!("no backup named {id}")));
        }

        let metadata = self
            .read(&self.layout.object(id, METADATA_FILE))
            .await?
            .ok_or_else(|| Error::storage("download", format!("backup {id} has no metadata")))?;
        let metadata: BackupMetadata = serde_json::from_slice(&metadata)
            .map_err(|e| Error::validation("backup metadata", e.to_string()))?;
        check_version(&request.installed_version, &metadata.maas_snap_version)
            .map_err(|reason| Error::validation("workload version", reason))?;

        let controllers = self
            .read(&self.layout.object(id, CONTROLLERS_FILE))
            .await?
            .map(|body| lines(&body))
            .ok_or_else(|| {
                Error::storage("download", format!("backup {id} has no controller list"))
            })?;
        check_controllers(&controllers, request.region_units, &request.controller_id)
            .map_err(|reason| Error::validation("controller-id", reason))?;

        self.command(
            "set-controller-id",
            self.workload.set_controller_id(&request.controller_id),
        )
        .await?;

        let scratch = scratch_dir()?;
        for kind in ArchiveKind::RESTORE_ORDER {
            let path = scratch.path().join(kind.file_name());
            let key = self.layout.object(id, kind.file_name());
            if !self.transfer("download", self.store.get_file(&key, &path)).await? {
                return Err(Error::storage(
                    "download",
                    format!("backup {id} has no {} archive", kind.label()),
                ));
            }
            within(
                self.timeouts.transfer(),
                self.workload.restore_archive(kind, &path),
                |limit| {
                    Error::workload(
                        "restore-archive",
                        format!("timed out after {}ms", limit.as_millis()),
                    )
                },
            )
            .await?;
            info!(backup = id, archive = kind.label(), "archive restored");
        }
        Ok(())
    }
}
