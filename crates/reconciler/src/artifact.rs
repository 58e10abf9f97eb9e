//! On-disk artifacts and the applied-state marker.
//!
//! Every write goes to a temp file in the target directory, is fsynced and
//! then renamed over the target, so readers see either the old file or the
//! new one and never a torn write.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use maas_operator_core::ResultExt;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::render::Artifact;
use crate::types::AppliedState;

const MARKER_MODE: u32 = 0o600;

/// Owns the config directory the workload reads from.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    state_file: String,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, state_file: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            state_file: state_file.into(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path(&self, relative: &Path) -> PathBuf {
        self.dir.join(relative)
    }

    #[must_use]
    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(&self.state_file)
    }

    /// Write a full artifact set.
    ///
    /// All temp files are staged before the first rename, so a failure while
    /// staging leaves every existing artifact untouched.
    ///
    /// # Errors
    ///
    /// Returns `Io` naming the first file that could not be staged or moved
    /// into place.
    pub fn write_all(&self, artifacts: &[Artifact]) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e.to_string()))?;

        let staged = artifacts
            .iter()
            .map(|artifact| {
                let target = self.path(&artifact.path);
                stage(&self.dir, artifact.contents.as_bytes(), artifact.mode)
                    .map(|tmp| (tmp, target.clone()))
                    .map_err(|e| Error::io(target, e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        for (tmp, target) in staged {
            tmp.persist(&target)
                .map_err(|e| Error::io(&target, e.error.to_string()))?;
            debug!(path = %target.display(), "artifact written");
        }

        sync_dir(&self.dir);
        info!(dir = %self.dir.display(), count = artifacts.len(), "artifacts replaced");
        Ok(())
    }

    /// Delete previously managed files. Files already gone are fine.
    ///
    /// # Errors
    ///
    /// Returns `Io` if a file exists but cannot be removed.
    pub fn remove(&self, relative: &[PathBuf]) -> Result<()> {
        for rel in relative {
            let path = self.path(rel);
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "artifact removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(path, e.to_string())),
            }
        }
        Ok(())
    }

    /// Load the applied-state marker.
    ///
    /// A missing marker means nothing has been applied yet. An unreadable
    /// one is logged and treated the same way, which forces a full rewrite
    /// on the next pass.
    #[must_use]
    pub fn load_applied(&self) -> AppliedState {
        let path = self.marker_path();
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| format!("corrupt marker '{}': {e}", path.display()))
                .or_default_logged(AppliedState::default()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => AppliedState::default(),
            Err(e) => Err::<AppliedState, _>(format!("cannot read '{}': {e}", path.display()))
                .or_default_logged(AppliedState::default()),
        }
    }

    /// Persist the applied-state marker atomically.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the marker cannot be written.
    pub fn save_applied(&self, applied: &AppliedState) -> Result<()> {
        let path = self.marker_path();
        let bytes = serde_json::to_vec_pretty(applied)
            .map_err(|e| Error::io(&path, e.to_string()))?;
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e.to_string()))?;
        stage(&self.dir, &bytes, MARKER_MODE)
            .and_then(|tmp| tmp.persist(&path).map(|_| ()).map_err(|e| e.error))
            .map_err(|e| Error::io(&path, e.to_string()))
    }

    /// Delete the applied-state marker.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the marker exists but cannot be removed.
    pub fn clear_applied(&self) -> Result<()> {
        self.remove(&[PathBuf::from(&self.state_file)])
    }
}

fn stage(dir: &Path, contents: &[u8], mode: u32) -> io::Result<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    set_mode(tmp.as_file(), mode)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        warn!(dir = %dir.display(), error = %e, "directory fsync failed");
    }
}
