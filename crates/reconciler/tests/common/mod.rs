//! Shared fixtures for reconciler integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::path::Path;
use std::sync::Arc;

use maas_operator_core::{Observation, RelationRecord};
use maas_operator_reconciler::desired::endpoints;
use maas_operator_reconciler::{
    ArtifactStore, InMemoryObjectStore, InMemoryRuntime, InMemorySupervisor, InMemoryWorkload,
    Policy, Reconciler, Render,
};
use tempfile::TempDir;

pub const CHANNEL: &str = "3.6/stable";
pub const MARKER: &str = "applied-state.json";

/// A reconciler wired to in-memory collaborators and a temp config dir.
pub struct Harness {
    pub dir: TempDir,
    pub runtime: Arc<InMemoryRuntime>,
    pub workload: Arc<InMemoryWorkload>,
    pub supervisor: Arc<InMemorySupervisor>,
    /// Bucket behind the backup actions.
    pub stores: InMemoryObjectStore,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new(observation: Observation) -> Self {
        Self::build(observation, Policy::default(), None)
    }

    pub fn with_policy(observation: Observation, policy: Policy) -> Self {
        Self::build(observation, policy, None)
    }

    pub fn with_renderer(observation: Observation, renderer: Arc<dyn Render>) -> Self {
        Self::build(observation, Policy::default(), Some(renderer))
    }

    fn build(observation: Observation, policy: Policy, renderer: Option<Arc<dyn Render>>) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let runtime = Arc::new(InMemoryRuntime::new(observation));
        let workload = Arc::new(InMemoryWorkload::installed(CHANNEL));
        let supervisor = Arc::new(InMemorySupervisor::new());
        let stores = InMemoryObjectStore::new();
        let reconciler = wire(
            dir.path(),
            &runtime,
            &workload,
            &supervisor,
            &stores,
            policy,
            renderer,
        );
        Self {
            dir,
            runtime,
            workload,
            supervisor,
            stores,
            reconciler,
        }
    }

    /// Start a fresh reconciler over the same directory and collaborators,
    /// as happens when the process is invoked again for the next event.
    pub fn restart_process(&mut self) {
        self.reconciler = wire(
            self.dir.path(),
            &self.runtime,
            &self.workload,
            &self.supervisor,
            &self.stores,
            self.reconciler.policy().clone(),
            None,
        );
    }

    pub fn read(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.dir.path().join(name)).ok()
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path())
            .expect("read config dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn wire(
    dir: &Path,
    runtime: &Arc<InMemoryRuntime>,
    workload: &Arc<InMemoryWorkload>,
    supervisor: &Arc<InMemorySupervisor>,
    stores: &InMemoryObjectStore,
    policy: Policy,
    renderer: Option<Arc<dyn Render>>,
) -> Reconciler {
    let mut builder = Reconciler::builder()
        .with_runtime(runtime.clone())
        .with_workload(workload.clone())
        .with_supervisor(supervisor.clone())
        .with_object_stores(Arc::new(stores.clone()))
        .with_store(ArtifactStore::new(dir, MARKER))
        .with_policy(policy);
    if let Some(renderer) = renderer {
        builder = builder.with_renderer(renderer);
    }
    builder.build().expect("reconciler builds")
}

pub fn database() -> RelationRecord {
    RelationRecord::new(1, endpoints::DATABASE, "postgresql_client", "postgresql")
        .with_app_data("username", "maas")
        .with_app_data("password", "s3cret")
        .with_app_data("endpoints", "10.0.0.5:5432")
}

pub fn peers(names: &[(&str, &str)]) -> RelationRecord {
    names.iter().fold(
        RelationRecord::new(3, endpoints::PEER, "maas_peers", "maas-region"),
        |rel, (unit, host)| rel.with_unit_data(*unit, "system-name", *host),
    )
}

pub fn proxy(address: &str) -> RelationRecord {
    RelationRecord::new(2, endpoints::PROXY, "http", "haproxy")
        .with_unit_data("haproxy/0", "public-address", address)
}

pub fn controller() -> RelationRecord {
    RelationRecord::new(9, endpoints::CONTROLLER, "maas_region", "maas-agent")
        .with_unit_data("maas-agent/0", "unit", "maas-agent/0")
        .with_unit_data("maas-agent/0", "url", "agent-0.maas")
}

pub fn object_storage(path: &str) -> RelationRecord {
    RelationRecord::new(5, endpoints::OBJECT_STORAGE, "s3", "s3-integrator")
        .with_app_data("bucket", "maas-backups")
        .with_app_data("access-key", "AK")
        .with_app_data("secret-key", "SK")
        .with_app_data("endpoint", "https://s3.example.com")
        .with_app_data("region", "eu-west-1")
        .with_app_data("path", path)
}

/// Site manager relation, with the id of an issued token once there is one.
pub fn site_manager(token_id: Option<&str>) -> RelationRecord {
    let relation = RelationRecord::new(6, endpoints::SITE_MANAGER, "enroll", "maas-site-manager");
    match token_id {
        Some(id) => relation.with_app_data("token_id", id),
        None => relation,
    }
}

/// A unit with no relations yet.
pub fn bare() -> Observation {
    let mut obs = Observation::new("maas-region/0", "maas-region", "region-0.maas");
    obs.bind_address = Some("10.0.0.10".to_string());
    obs
}

/// A unit whose required inputs are all present.
pub fn ready() -> Observation {
    let mut obs = bare();
    obs.relations.push(database());
    obs
}
