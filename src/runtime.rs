//! File-backed runtime adaptor.
//!
//! The platform glue that invokes the operator drops a JSON
//! [`Observation`] into the runtime directory before each event and picks
//! up what the operator wrote back:
//!
//! - `observation.json`: read on every `observe`
//! - `publications.json`: relation data bags, merged key by key
//! - `secrets.json`: secrets by label with their read grants
//! - `granted-secrets.json`: content of other applications' secrets, by id
//! - `workload-version`: the version to show next to the unit status
//!
//! Writes go through a temp file in the same directory and a rename.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use maas_operator_core::{DataBag, Observation};
use maas_operator_reconciler::{Error, Publication, Result, Runtime, Scope, Secret};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

pub const OBSERVATION_FILE: &str = "observation.json";
pub const PUBLICATIONS_FILE: &str = "publications.json";
pub const SECRETS_FILE: &str = "secrets.json";
pub const GRANTED_SECRETS_FILE: &str = "granted-secrets.json";
pub const WORKLOAD_VERSION_FILE: &str = "workload-version";

/// One relation data bag as written back to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedBag {
    pub endpoint: String,
    pub relation_id: u32,
    pub scope: Scope,
    pub data: DataBag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSecret {
    pub id: String,
    pub content: DataBag,
    #[serde(default)]
    pub grants: BTreeSet<u32>,
}

/// Runtime that exchanges JSON documents through a directory.
#[derive(Debug)]
pub struct FileRuntime {
    dir: PathBuf,
    // Serialises read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileRuntime {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every bag written so far, ordered by endpoint, relation and scope.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the publications file cannot be parsed.
    pub fn publications(&self) -> Result<Vec<PublishedBag>> {
        Ok(read_optional::<Vec<PublishedBag>>(&self.dir.join(PUBLICATIONS_FILE))?
            .unwrap_or_default())
    }

    /// Every stored secret, by label.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the secrets file cannot be parsed.
    pub fn secrets(&self) -> Result<BTreeMap<String, StoredSecret>> {
        Ok(read_optional(&self.dir.join(SECRETS_FILE))?.unwrap_or_default())
    }
}

fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::unavailable(
                path.display().to_string(),
                e.to_string(),
            ));
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| Error::unavailable(path.display().to_string(), format!("malformed JSON: {e}")))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| Error::io(path, e.to_string()))?;
    write_atomic(path, &json)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::io(path, "path has no parent directory"))?;
    std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e.to_string()))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(path, e.to_string()))?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| Error::io(path, e.to_string()))?;
    restrict(tmp.path()).map_err(|e| Error::io(path, e.to_string()))?;
    tmp.persist(path)
        .map_err(|e| Error::io(path, e.error.to_string()))?;
    Ok(())
}

#[cfg(unix)]
fn restrict(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[async_trait]
impl Runtime for FileRuntime {
    async fn observe(&self) -> Result<Observation> {
        let path = self.dir.join(OBSERVATION_FILE);
        read_optional(&path)?.ok_or_else(|| {
            Error::unavailable("runtime", format!("no observation at {}", path.display()))
        })
    }

    async fn publish(&self, publication: &Publication) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut bags = self.publications()?;
        match bags.iter_mut().find(|b| {
            b.endpoint == publication.endpoint
                && b.relation_id == publication.relation_id
                && b.scope == publication.scope
        }) {
            Some(bag) => bag.data.extend(publication.data.clone()),
            None => bags.push(PublishedBag {
                endpoint: publication.endpoint.clone(),
                relation_id: publication.relation_id,
                scope: publication.scope,
                data: publication.data.clone(),
            }),
        }
        bags.sort_by(|a, b| {
            (&a.endpoint, a.relation_id, a.scope).cmp(&(&b.endpoint, b.relation_id, b.scope))
        });
        debug!(
            endpoint = %publication.endpoint,
            relation_id = publication.relation_id,
            keys = publication.data.len(),
            "publishing relation data"
        );
        write_json(&self.dir.join(PUBLICATIONS_FILE), &bags)
    }

    async fn secret(&self, label: &str) -> Result<Option<Secret>> {
        Ok(self.secrets()?.remove(label).map(|s| Secret {
            id: s.id,
            content: s.content,
        }))
    }

    async fn granted_secret(&self, id: &str) -> Result<Option<Secret>> {
        if let Some(own) = self.secrets()?.into_values().find(|s| s.id == id) {
            return Ok(Some(Secret {
                id: own.id,
                content: own.content,
            }));
        }
        let mut granted: BTreeMap<String, DataBag> =
            read_optional(&self.dir.join(GRANTED_SECRETS_FILE))?.unwrap_or_default();
        Ok(granted.remove(id).map(|content| Secret {
            id: id.to_string(),
            content,
        }))
    }

    async fn ensure_secret(
        &self,
        label: &str,
        content: &DataBag,
        grant: Option<u32>,
    ) -> Result<String> {
        let _guard = self.lock.lock().await;
        let mut secrets = self.secrets()?;
        let entry = secrets
            .entry(label.to_string())
            .or_insert_with(|| StoredSecret {
                id: format!("secret:{label}"),
                content: DataBag::new(),
                grants: BTreeSet::new(),
            });
        entry.content = content.clone();
        if let Some(relation_id) = grant {
            entry.grants.insert(relation_id);
        }
        let id = entry.id.clone();
        write_json(&self.dir.join(SECRETS_FILE), &secrets)?;
        Ok(id)
    }

    async fn set_workload_version(&self, version: &str) -> Result<()> {
        let path = self.dir.join(WORKLOAD_VERSION_FILE);
        if std::fs::read_to_string(&path).is_ok_and(|current| current.trim() == version) {
            return Ok(());
        }
        write_atomic(&path, format!("{version}\n").as_bytes())
    }
}
