//! In-memory runtime, workload, supervisor and object store.
//!
//! Used by the test suites and by anyone embedding the reconciler without a
//! real orchestration runtime. Each one records what it was asked to do and
//! can be told to fail or stall.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maas_operator_core::{DataBag, Observation, WorkloadFacts};
use tokio::sync::{Mutex, MutexGuard};

use crate::backup::{Listing, ObjectEntry, ObjectStore, ObjectStoreProvider};
use crate::desired::ObjectStorage;
use crate::error::{Error, Result};
use crate::runtime::{Publication, Runtime, Scope, Secret};
use crate::workload::{AdminAccount, ArchiveKind, Supervisor, TlsFiles, Workload};

/// Key of one published data bag.
pub type BagKey = (String, u32, Scope);

#[derive(Debug, Default)]
pub struct RuntimeState {
    pub observation: Option<Observation>,
    pub bags: BTreeMap<BagKey, DataBag>,
    /// Secrets by label.
    pub secrets: BTreeMap<String, Secret>,
    /// `(label, relation id)` pairs granted read access.
    pub grants: BTreeSet<(String, u32)>,
    /// Secrets other applications shared with us, by id.
    pub granted: BTreeMap<String, DataBag>,
    pub workload_version: Option<String>,
    pub publish_calls: usize,
    pub observe_delay: Option<Duration>,
    pub fail_observe: bool,
}

/// Runtime backed by a mutable observation.
#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    state: Mutex<RuntimeState>,
}

impl InMemoryRuntime {
    #[must_use]
    pub fn new(observation: Observation) -> Self {
        Self {
            state: Mutex::new(RuntimeState {
                observation: Some(observation),
                ..RuntimeState::default()
            }),
        }
    }

    pub async fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().await
    }

    /// Replace the observation returned by the next `observe`.
    pub async fn set_observation(&self, observation: Observation) {
        self.state.lock().await.observation = Some(observation);
    }

    /// Edit the current observation in place.
    pub async fn update<F: FnOnce(&mut Observation)>(&self, edit: F) {
        if let Some(obs) = self.state.lock().await.observation.as_mut() {
            edit(obs);
        }
    }

    /// Make a secret owned by another application readable under `id`.
    pub async fn share_secret(&self, id: &str, content: DataBag) {
        self.state.lock().await.granted.insert(id.to_string(), content);
    }

    pub async fn workload_version(&self) -> Option<String> {
        self.state.lock().await.workload_version.clone()
    }

    pub async fn published(&self, endpoint: &str, relation_id: u32, scope: Scope) -> Option<DataBag> {
        self.state
            .lock()
            .await
            .bags
            .get(&(endpoint.to_string(), relation_id, scope))
            .cloned()
    }
}

#[async_trait]
impl Runtime for InMemoryRuntime {
    async fn observe(&self) -> Result<Observation> {
        let (delay, fail, observation) = {
            let state = self.state.lock().await;
            (state.observe_delay, state.fail_observe, state.observation.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Error::unavailable("runtime", "connection refused"));
        }
        observation.ok_or_else(|| Error::unavailable("runtime", "no observation recorded"))
    }

    async fn publish(&self, publication: &Publication) -> Result<()> {
        let mut state = self.state.lock().await;
        state.publish_calls += 1;
        let key = (
            publication.endpoint.clone(),
            publication.relation_id,
            publication.scope,
        );
        state
            .bags
            .entry(key)
            .or_default()
            .extend(publication.data.clone());
        Ok(())
    }

    async fn secret(&self, label: &str) -> Result<Option<Secret>> {
        Ok(self.state.lock().await.secrets.get(label).cloned())
    }

    async fn granted_secret(&self, id: &str) -> Result<Option<Secret>> {
        let state = self.state.lock().await;
        let owned = state.secrets.values().find(|s| s.id == id).cloned();
        Ok(owned.or_else(|| {
            state.granted.get(id).map(|content| Secret {
                id: id.to_string(),
                content: content.clone(),
            })
        }))
    }

    async fn ensure_secret(
        &self,
        label: &str,
        content: &DataBag,
        grant: Option<u32>,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        let id = format!("secret:{label}");
        state.secrets.insert(
            label.to_string(),
            Secret {
                id: id.clone(),
                content: content.clone(),
            },
        );
        if let Some(relation_id) = grant {
            state.grants.insert((label.to_string(), relation_id));
        }
        Ok(id)
    }

    async fn set_workload_version(&self, version: &str) -> Result<()> {
        self.state.lock().await.workload_version = Some(version.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct WorkloadState {
    pub facts: WorkloadFacts,
    pub admins: BTreeMap<String, AdminAccount>,
    /// Every command issued, in order.
    pub calls: Vec<String>,
    pub metrics: Option<bool>,
    /// Commands that fail when issued.
    pub failing: BTreeSet<String>,
    pub delay: Option<Duration>,
    /// System ids the API reports for region controllers.
    pub region_ids: Vec<String>,
    /// Files of each archived data set, by relative path.
    pub data: BTreeMap<ArchiveKind, BTreeMap<String, String>>,
    pub controller_id: Option<String>,
    /// Site manager tokens enrolled with, in order.
    pub enrolments: Vec<String>,
}

/// Workload whose facts and admin accounts live in memory.
#[derive(Debug, Default)]
pub struct InMemoryWorkload {
    state: Mutex<WorkloadState>,
}

impl InMemoryWorkload {
    #[must_use]
    pub fn new(facts: WorkloadFacts) -> Self {
        Self {
            state: Mutex::new(WorkloadState {
                facts,
                ..WorkloadState::default()
            }),
        }
    }

    /// An initialised workload on `channel` with TLS off, one region
    /// controller and a little data in each archived set.
    #[must_use]
    pub fn installed(channel: &str) -> Self {
        let data = BTreeMap::from([
            (
                ArchiveKind::Images,
                BTreeMap::from([("bootloaders/uefi/amd64/grubx64.efi".to_string(), "grub".to_string())]),
            ),
            (
                ArchiveKind::Preseeds,
                BTreeMap::from([("curtin_userdata".to_string(), "#cloud-config".to_string())]),
            ),
        ]);
        Self {
            state: Mutex::new(WorkloadState {
                facts: WorkloadFacts {
                    installed_channel: Some(channel.to_string()),
                    version: Some(track(channel).to_string()),
                    enrollment_secret: Some("enroll-token".to_string()),
                    uuid: Some("8a6c1f02-region".to_string()),
                    tls_enabled: Some(false),
                },
                region_ids: vec!["abc123".to_string()],
                data,
                ..WorkloadState::default()
            }),
        }
    }

    pub async fn state(&self) -> MutexGuard<'_, WorkloadState> {
        self.state.lock().await
    }

    pub async fn fail(&self, command: &str) {
        self.state.lock().await.failing.insert(command.to_string());
    }

    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    async fn issue(&self, command: &str) -> Result<MutexGuard<'_, WorkloadState>> {
        let delay = self.state.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().await;
        state.calls.push(command.to_string());
        if state.failing.contains(command) {
            return Err(Error::workload(command, "injected failure"));
        }
        Ok(state)
    }
}

fn track(channel: &str) -> &str {
    channel.split('/').next().unwrap_or(channel)
}

#[async_trait]
impl Workload for InMemoryWorkload {
    async fn facts(&self) -> Result<WorkloadFacts> {
        let delay = self.state.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state.lock().await.facts.clone())
    }

    async fn install(&self, channel: &str) -> Result<()> {
        let mut state = self.issue("install").await?;
        state.facts.installed_channel = Some(channel.to_string());
        state.facts.version = Some(track(channel).to_string());
        state.facts.tls_enabled = Some(false);
        Ok(())
    }

    async fn refresh(&self, channel: &str) -> Result<()> {
        let mut state = self.issue("refresh").await?;
        state.facts.installed_channel = Some(channel.to_string());
        state.facts.version = Some(track(channel).to_string());
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        let mut state = self.issue("uninstall").await?;
        state.facts = WorkloadFacts::default();
        state.admins.clear();
        Ok(())
    }

    async fn create_admin(&self, account: &AdminAccount) -> Result<()> {
        let mut state = self.issue("create-admin").await?;
        if state.admins.contains_key(&account.username) {
            return Err(Error::workload(
                "create-admin",
                format!("user '{}' already exists", account.username),
            ));
        }
        state
            .admins
            .insert(account.username.clone(), account.clone());
        Ok(())
    }

    async fn api_key(&self, username: &str) -> Result<String> {
        let state = self.issue("apikey").await?;
        if state.admins.contains_key(username) {
            Ok(format!("key-{username}\n"))
        } else {
            Err(Error::workload("apikey", format!("no user '{username}'")))
        }
    }

    async fn set_metrics(&self, _admin: &str, _api_url: &str, enabled: bool) -> Result<()> {
        let mut state = self.issue("set-metrics").await?;
        state.metrics = Some(enabled);
        Ok(())
    }

    async fn enable_tls(&self, _files: &TlsFiles) -> Result<()> {
        let mut state = self.issue("enable-tls").await?;
        state.facts.tls_enabled = Some(true);
        Ok(())
    }

    async fn disable_tls(&self) -> Result<()> {
        let mut state = self.issue("disable-tls").await?;
        state.facts.tls_enabled = Some(false);
        Ok(())
    }

    async fn enrol_site_manager(&self, token: &str) -> Result<()> {
        let mut state = self.issue("msm-enrol").await?;
        state.enrolments.push(token.to_string());
        Ok(())
    }

    async fn region_ids(&self, admin: &str, _api_url: &str) -> Result<Vec<String>> {
        let state = self.issue("region-controllers").await?;
        if !state.admins.contains_key(admin) {
            return Err(Error::workload("region-controllers", format!("no user '{admin}'")));
        }
        Ok(state.region_ids.clone())
    }

    async fn archive(&self, kind: ArchiveKind, dest: &Path) -> Result<()> {
        let state = self.issue("archive").await?;
        let files = state.data.get(&kind).cloned().unwrap_or_default();
        let encoded = serde_json::to_vec(&files)
            .map_err(|e| Error::workload("archive", e.to_string()))?;
        std::fs::write(dest, encoded).map_err(|e| Error::io(dest, e.to_string()))
    }

    async fn restore_archive(&self, kind: ArchiveKind, src: &Path) -> Result<()> {
        let mut state = self.issue("restore-archive").await?;
        let raw = std::fs::read(src).map_err(|e| Error::io(src, e.to_string()))?;
        let files: BTreeMap<String, String> = serde_json::from_slice(&raw).map_err(|e| {
            Error::workload("restore-archive", format!("{} archive is corrupted: {e}", kind.label()))
        })?;
        let empty = files.is_empty();
        state.data.insert(kind, files);
        if empty {
            return Err(Error::workload(
                "restore-archive",
                format!("{} archive did not contain any files", kind.label()),
            ));
        }
        Ok(())
    }

    async fn set_controller_id(&self, id: &str) -> Result<()> {
        let mut state = self.issue("set-controller-id").await?;
        state.controller_id = Some(id.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SupervisorState {
    pub restarts: usize,
    pub stops: usize,
    pub fail: bool,
    pub delay: Option<Duration>,
}

/// Supervisor that counts restarts.
#[derive(Debug, Default)]
pub struct InMemorySupervisor {
    state: Mutex<SupervisorState>,
}

impl InMemorySupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().await
    }

    pub async fn restarts(&self) -> usize {
        self.state.lock().await.restarts
    }

    async fn control(&self, verb: &str) -> Result<MutexGuard<'_, SupervisorState>> {
        let delay = self.state.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().await;
        if state.fail {
            return Err(Error::service_control(format!("{verb}: injected failure")));
        }
        Ok(state)
    }
}

#[async_trait]
impl Supervisor for InMemorySupervisor {
    async fn restart(&self) -> Result<()> {
        self.control("restart").await?.restarts += 1;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.control("stop").await?.stops += 1;
        Ok(())
    }
}

/// Object store holding everything in one shared map.
///
/// Clones share contents, so the same store can be handed to the
/// reconciler as a provider and inspected by a test.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    failing: Arc<Mutex<BTreeSet<String>>>,
}

impl InMemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request of `operation` fail, e.g. `"upload"`.
    pub async fn fail(&self, operation: &str) {
        self.failing.lock().await.insert(operation.to_string());
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }

    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(key).cloned()
    }

    pub async fn insert(&self, key: &str, body: impl Into<Vec<u8>>) {
        self.objects.lock().await.insert(key.to_string(), body.into());
    }

    pub async fn remove(&self, key: &str) {
        self.objects.lock().await.remove(key);
    }

    async fn check(&self, operation: &str) -> Result<()> {
        if self.failing.lock().await.contains(operation) {
            return Err(Error::storage(operation, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn ensure_bucket(&self) -> Result<()> {
        self.check("create-bucket").await
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.check("upload").await?;
        self.objects.lock().await.insert(key.to_string(), body);
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = std::fs::read(path).map_err(|e| Error::io(path, e.to_string()))?;
        self.put(key, body).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check("download").await?;
        Ok(self.objects.lock().await.get(key).cloned())
    }

    async fn get_file(&self, key: &str, dest: &Path) -> Result<bool> {
        let Some(body) = self.get(key).await? else {
            return Ok(false);
        };
        std::fs::write(dest, body).map_err(|e| Error::io(dest, e.to_string()))?;
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Listing> {
        self.check("list").await?;
        let objects = self.objects.lock().await;
        let mut listing = Listing::default();
        let mut prefixes = BTreeSet::new();
        for (key, body) in objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    prefixes.insert(format!("{prefix}{dir}/"));
                }
                None => listing.objects.push(ObjectEntry {
                    key: key.clone(),
                    size: body.len() as u64,
                }),
            }
        }
        listing.prefixes = prefixes.into_iter().collect();
        Ok(listing)
    }
}

#[async_trait]
impl ObjectStoreProvider for InMemoryObjectStore {
    async fn connect(&self, _storage: &ObjectStorage) -> Result<Arc<dyn ObjectStore>> {
        self.check("connect").await?;
        Ok(Arc::new(self.clone()))
    }
}
