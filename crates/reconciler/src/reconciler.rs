//! The reconciler: one event in, one status out.
//!
//! Every event recomputes the desired state from a fresh observation and
//! converges the unit toward it. Work that would not change anything is
//! skipped by comparing fingerprints with the [`AppliedState`] recorded
//! after the last successful apply.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use maas_operator_core::{DataBag, Observation, WorkloadFacts};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::actions::{Action, ActionError, ActionOutput, ActionRequest};
use crate::artifact::ArtifactStore;
use crate::backup::{
    self, BackupRequest, Backups, ObjectStore, ObjectStoreProvider, RestoreRequest,
};
use crate::desired::{
    self, ADMIN_SECRET_KEY, ADMIN_SECRET_LABEL, DesiredState, INTERNAL_ADMIN_USER, LeaderDuties,
    ObjectStorage, Policy, SITE_TOKEN_KEY, ServiceConfig, SiteEnrollment, TlsAction, endpoints,
};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::render::{self, Artifact, Render, YamlRenderer};
use crate::runtime::{Publication, Runtime};
use crate::types::{AppliedState, Event, Handled, Status};
use crate::workload::{AdminAccount, Supervisor, Workload};

const ADMIN_PASSWORD_LEN: usize = 15;
/// Admin secret key set once the account exists in the workload.
const ADMIN_CREATED_KEY: &str = "created";

/// Converges one unit of the region controller.
pub struct Reconciler {
    runtime: Arc<dyn Runtime>,
    workload: Arc<dyn Workload>,
    supervisor: Arc<dyn Supervisor>,
    renderer: Arc<dyn Render>,
    object_stores: Option<Arc<dyn ObjectStoreProvider>>,
    store: ArtifactStore,
    policy: Policy,
    applied: AppliedState,
    last_status: Status,
}

impl Reconciler {
    #[must_use]
    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::new()
    }

    /// What has been applied so far.
    #[must_use]
    pub const fn applied(&self) -> &AppliedState {
        &self.applied
    }

    /// Status reported for the last lifecycle event.
    #[must_use]
    pub const fn status(&self) -> &Status {
        &self.last_status
    }

    #[must_use]
    pub const fn policy(&self) -> &Policy {
        &self.policy
    }

    #[must_use]
    pub const fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Handle one event to completion.
    ///
    /// Never fails: every error is mapped to a [`Status`]. Action
    /// invocations carry their own result and leave the status unchanged.
    pub async fn handle(&mut self, event: Event) -> Handled {
        let span = info_span!("handle", event = event.kind());
        async move {
            if let Event::ActionInvoked(request) = &event {
                let result = self.run_action(request).await;
                return Handled {
                    status: self.last_status.clone(),
                    action: Some(result),
                };
            }

            let status = match self.dispatch(&event).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(error = %e, transient = e.is_transient(), "event not converged");
                    e.status()
                }
            };
            if status != self.last_status {
                info!(status = %status, "status changed");
            }
            self.last_status = status.clone();
            Handled::status(status)
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&mut self, event: &Event) -> Result<Status> {
        match event {
            Event::Install => {
                self.install().await?;
                self.reconcile(event, false).await
            }
            Event::Upgrade | Event::ConfigChanged => self.reconcile(event, true).await,
            Event::Remove => self.remove().await,
            Event::RelationJoined(_)
            | Event::RelationChanged(_)
            | Event::RelationDeparted(_)
            | Event::RelationBroken(_)
            | Event::LeaderElected
            | Event::UpdateStatus => self.reconcile(event, false).await,
            Event::ActionInvoked(_) => Ok(self.last_status.clone()),
        }
    }

    // ── inputs ────────────────────────────────────────────────────────────

    async fn observe(&self) -> Result<Observation> {
        self.runtime_call(self.runtime.observe()).await
    }

    async fn facts(&self) -> Result<WorkloadFacts> {
        within(self.policy.timeouts.observe(), self.workload.facts(), |limit| {
            Error::unavailable("workload", format!("no answer within {}ms", limit.as_millis()))
        })
        .await
    }

    async fn command<T>(&self, name: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        within(self.policy.timeouts.command(), fut, |limit| {
            Error::workload(name, format!("timed out after {}ms", limit.as_millis()))
        })
        .await
    }

    async fn runtime_call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        within(self.policy.timeouts.observe(), fut, |limit| {
            Error::unavailable("runtime", format!("no answer within {}ms", limit.as_millis()))
        })
        .await
    }

    // ── lifecycle ─────────────────────────────────────────────────────────

    async fn install(&self) -> Result<()> {
        let obs = self.observe().await?;
        let channel = self.policy.channel_for(&obs)?;
        let facts = self.facts().await?;
        if facts.is_installed() {
            debug!(channel = ?facts.installed_channel, "workload already installed");
            return Ok(());
        }
        self.command("install", self.workload.install(&channel)).await?;
        info!(channel = %channel, "workload installed");
        Ok(())
    }

    /// Move the workload to the expected channel when it differs.
    ///
    /// Returns a blocking status when that would be a downgrade.
    async fn converge_channel(&self, obs: &Observation, facts: &WorkloadFacts) -> Result<Option<Status>> {
        let Some(installed) = facts.installed_channel.as_deref() else {
            return Ok(None);
        };
        let expected = self.policy.channel_for(obs)?;
        if installed == expected {
            return Ok(None);
        }
        if is_downgrade(installed, &expected) {
            warn!(from = installed, to = %expected, "refusing downgrade");
            return Ok(Some(Status::Blocked(format!(
                "cannot downgrade {installed} to {expected}"
            ))));
        }
        self.command("refresh", self.workload.refresh(&expected)).await?;
        info!(from = installed, to = %expected, "workload refreshed");
        Ok(None)
    }

    async fn remove(&mut self) -> Result<Status> {
        within(self.policy.timeouts.restart(), self.supervisor.stop(), |limit| {
            Error::service_control(format!("stop did not finish within {}ms", limit.as_millis()))
        })
        .await?;
        self.command("uninstall", self.workload.uninstall()).await?;
        self.store.remove(&self.applied.artifacts)?;
        self.store.clear_applied()?;
        self.applied = AppliedState::default();
        info!("workload removed");
        Ok(Status::Waiting("workload removed".to_string()))
    }

    // ── reconciliation ────────────────────────────────────────────────────

    async fn reconcile(&mut self, event: &Event, converge: bool) -> Result<Status> {
        let mut obs = self.observe().await?;
        exclude_departing(&mut obs, event);
        let mut facts = self.facts().await?;

        if converge {
            if let Some(blocked) = self.converge_channel(&obs, &facts).await? {
                return Ok(blocked);
            }
            facts = self.facts().await?;
        }

        if let Some(version) = facts.version.as_deref() {
            self.runtime_call(self.runtime.set_workload_version(version))
                .await?;
        }

        if let Some(installed) = facts.installed_channel.as_deref() {
            let expected = self.policy.channel_for(&obs)?;
            if installed != expected {
                return Err(Error::missing_dependency(format!(
                    "workload on channel {expected}"
                )));
            }
        }

        let desired = DesiredState::derive(&obs, &facts, &self.policy)?;

        for publication in &desired.publications {
            self.runtime_call(self.runtime.publish(publication)).await?;
        }

        self.apply_service(&desired.service).await?;

        match &desired.leader {
            Some(duties) => self.apply_leader(duties).await?,
            None if self.applied.leader.is_some() => {
                debug!("no longer leader, forgetting leader duties");
                let next = AppliedState {
                    leader: None,
                    ..self.applied.clone()
                };
                self.commit(next)?;
            }
            None => {}
        }

        Ok(desired.status())
    }

    async fn apply_service(&mut self, service: &ServiceConfig) -> Result<()> {
        let fingerprint = Fingerprint::of("service configuration", service)?;
        if self.applied.service.as_ref() == Some(&fingerprint) {
            debug!(fingerprint = fingerprint.short(), "service configuration unchanged");
            return Ok(());
        }

        let artifacts = self.renderer.render(service)?;
        let paths: Vec<PathBuf> = artifacts.iter().map(|a| a.path.clone()).collect();
        let stale: Vec<PathBuf> = self
            .applied
            .artifacts
            .iter()
            .filter(|p| !paths.contains(p))
            .cloned()
            .collect();

        // Until the restart succeeds the files on disk match no fingerprint,
        // so the next pass must rewrite them whatever the inputs are then.
        let mut touched = paths.clone();
        touched.extend(stale.iter().cloned());
        self.commit(AppliedState {
            service: None,
            leader: self.applied.leader.clone(),
            artifacts: touched,
        })?;

        self.store.write_all(&artifacts)?;
        self.store.remove(&stale)?;

        within(self.policy.timeouts.restart(), self.supervisor.restart(), |limit| {
            Error::service_control(format!("restart did not finish within {}ms", limit.as_millis()))
        })
        .await?;

        let next = AppliedState {
            service: Some(fingerprint.clone()),
            leader: self.applied.leader.clone(),
            artifacts: paths,
        };
        self.commit(next)?;
        info!(
            fingerprint = fingerprint.short(),
            artifacts = artifacts.len(),
            removed = stale.len(),
            "service configuration applied"
        );
        Ok(())
    }

    async fn apply_leader(&mut self, duties: &LeaderDuties) -> Result<()> {
        let fingerprint = Fingerprint::of("leader duties", duties)?;
        if self.applied.leader.as_ref() == Some(&fingerprint) {
            debug!(fingerprint = fingerprint.short(), "leader duties unchanged");
            return Ok(());
        }

        self.bootstrap_admin(&duties.peers).await?;

        match duties.tls {
            TlsAction::Keep => {}
            TlsAction::Enable => {
                let files = render::tls_files(self.store.dir(), &self.applied.artifacts)
                    .ok_or_else(|| Error::render("tls material", "certificate files not written"))?;
                self.command("enable-tls", self.workload.enable_tls(&files)).await?;
                info!("workload TLS enabled");
            }
            TlsAction::Disable => {
                self.command("disable-tls", self.workload.disable_tls()).await?;
                info!("workload TLS disabled");
            }
        }

        self.command(
            "set-metrics",
            self.workload
                .set_metrics(&duties.admin_user, &duties.local_api_url, duties.metrics),
        )
        .await?;

        for offer in &duties.offers {
            let label = format!("enroll-{}-{}.secret", endpoints::CONTROLLER, offer.relation_id);
            let content = DataBag::from([(
                "maas-secret".to_string(),
                offer.enrollment_secret.clone(),
            )]);
            let secret_id = self
                .runtime_call(self.runtime.ensure_secret(&label, &content, Some(offer.relation_id)))
                .await?;
            let regions = serde_json::to_string(&offer.regions)
                .map_err(|e| Error::render("region list", e.to_string()))?;
            let data = DataBag::from([
                ("api_url".to_string(), offer.api_url.clone()),
                ("regions".to_string(), regions),
                ("maas_secret_id".to_string(), secret_id),
            ]);
            self.runtime_call(self.runtime.publish(&Publication::app(
                endpoints::CONTROLLER,
                offer.relation_id,
                data,
            )))
            .await?;
        }

        if let Some(site) = &duties.site_manager {
            self.enrol_site_manager(site).await?;
        }

        let next = AppliedState {
            leader: Some(fingerprint.clone()),
            ..self.applied.clone()
        };
        self.commit(next)?;
        info!(
            fingerprint = fingerprint.short(),
            offers = duties.offers.len(),
            "leader duties applied"
        );
        Ok(())
    }

    /// Ask the site manager for a token, and enrol once it has issued one.
    async fn enrol_site_manager(&self, site: &SiteEnrollment) -> Result<()> {
        let data = DataBag::from([("uuid".to_string(), site.uuid.clone())]);
        self.runtime_call(self.runtime.publish(&Publication::app(
            endpoints::SITE_MANAGER,
            site.relation_id,
            data,
        )))
        .await?;

        let Some(token_id) = site.token_id.as_deref() else {
            debug!("site manager has not issued a token yet");
            return Ok(());
        };
        let token = self
            .runtime_call(self.runtime.granted_secret(token_id))
            .await?
            .and_then(|secret| secret.content.get(SITE_TOKEN_KEY).cloned())
            .ok_or_else(|| Error::missing_dependency("site manager enrollment token"))?;
        self.command("msm-enrol", self.workload.enrol_site_manager(&token))
            .await?;
        info!(relation = site.relation_id, "enrolled with site manager");
        Ok(())
    }

    /// Create the internal admin account once and share its secret id.
    ///
    /// Whether the account exists is recorded in its secret, so a slow or
    /// failing workload never leads to a second creation.
    async fn bootstrap_admin(&self, peers: &[u32]) -> Result<()> {
        let existing = self
            .runtime_call(self.runtime.secret(ADMIN_SECRET_LABEL))
            .await?
            .filter(|secret| secret.content.contains_key("password"));

        let (secret_id, mut content) = match existing {
            Some(secret) => (secret.id, secret.content),
            None => {
                let content = DataBag::from([
                    ("username".to_string(), INTERNAL_ADMIN_USER.to_string()),
                    ("password".to_string(), generate_password()),
                ]);
                let id = self
                    .runtime_call(self.runtime.ensure_secret(ADMIN_SECRET_LABEL, &content, None))
                    .await?;
                info!(secret = %id, "admin secret created");
                (id, content)
            }
        };

        if content.get(ADMIN_CREATED_KEY).map(String::as_str) == Some("true") {
            debug!(user = INTERNAL_ADMIN_USER, "admin account present");
        } else {
            let account = AdminAccount {
                username: INTERNAL_ADMIN_USER.to_string(),
                password: content.get("password").cloned().unwrap_or_default(),
                email: format!("{INTERNAL_ADMIN_USER}@maas.internal"),
                ssh_import: None,
            };
            if let Err(e) = self
                .command("create-admin", self.workload.create_admin(&account))
                .await
            {
                // Created by a pass that stopped before recording it.
                if self
                    .command("apikey", self.workload.api_key(INTERNAL_ADMIN_USER))
                    .await
                    .is_err()
                {
                    return Err(e);
                }
                debug!(user = INTERNAL_ADMIN_USER, "admin account already present");
            }
            content.insert(ADMIN_CREATED_KEY.to_string(), "true".to_string());
            self.runtime_call(self.runtime.ensure_secret(ADMIN_SECRET_LABEL, &content, None))
                .await?;
            info!(user = INTERNAL_ADMIN_USER, "admin account created");
        }

        for relation_id in peers {
            let data = DataBag::from([(ADMIN_SECRET_KEY.to_string(), secret_id.clone())]);
            self.runtime_call(self.runtime.publish(&Publication::app(
                endpoints::PEER,
                *relation_id,
                data,
            )))
            .await?;
        }
        Ok(())
    }

    /// Persist and adopt a new applied state.
    fn commit(&mut self, next: AppliedState) -> Result<()> {
        self.store.save_applied(&next)?;
        self.applied = next;
        Ok(())
    }

    // ── actions ───────────────────────────────────────────────────────────

    /// Run an operator action. Never changes reconciler state.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionError`] for unknown actions, missing parameters,
    /// unmet preconditions or a failing workload.
    pub async fn run_action(
        &self,
        request: &ActionRequest,
    ) -> std::result::Result<ActionOutput, ActionError> {
        let result = self.execute_action(request).await;
        match &result {
            Ok(output) => info!(action = %request.name, keys = output.len(), "action succeeded"),
            Err(e) => warn!(action = %request.name, error = %e, "action failed"),
        }
        result
    }

    async fn execute_action(
        &self,
        request: &ActionRequest,
    ) -> std::result::Result<ActionOutput, ActionError> {
        let action = Action::from_request(request)?;

        if action.kind().needs_service() && !self.applied.is_service_applied() {
            return Err(ActionError::precondition(
                "the region has not been configured yet",
            ));
        }

        let obs = self
            .observe()
            .await
            .map_err(|e| ActionError::failed(e.to_string()))?;

        match action {
            Action::CreateAdmin(account) => {
                if !obs.is_leader {
                    return Err(ActionError::precondition(
                        "administrators can only be created on the leader",
                    ));
                }
                self.command("create-admin", self.workload.create_admin(&account))
                    .await
                    .map_err(|e| ActionError::failed(e.to_string()))?;
                Ok(output(
                    "info",
                    format!("user {} successfully created", account.username),
                ))
            }
            Action::GetApiKey { username } => {
                let key = self
                    .command("apikey", self.workload.api_key(&username))
                    .await
                    .map_err(|e| ActionError::failed(e.to_string()))?;
                Ok(output("api-key", key.trim()))
            }
            Action::ListControllers => {
                let regions = desired::regions(&obs);
                let agents: Vec<String> = desired::rack_agents(&obs).into_values().collect();
                let encode = |v: &[String]| {
                    serde_json::to_string(v).map_err(|e| ActionError::failed(e.to_string()))
                };
                Ok(ActionOutput::from([
                    ("regions".to_string(), encode(&regions)?),
                    ("agents".to_string(), encode(&agents)?),
                ]))
            }
            Action::GetApiEndpoint => {
                let endpoint = desired::resolve_api_endpoint(&obs, &self.policy)
                    .map_err(|e| ActionError::precondition(e.to_string()))?;
                Ok(output("api-url", endpoint.url))
            }
            Action::CreateBackup => self.create_backup(&obs).await,
            Action::ListBackups => self.list_backups(&obs).await,
            Action::RestoreBackup {
                backup_id,
                controller_id,
            } => self.restore_backup(&obs, backup_id, controller_id).await,
        }
    }

    async fn object_store(
        &self,
        obs: &Observation,
    ) -> std::result::Result<(ObjectStorage, Arc<dyn ObjectStore>), ActionError> {
        let provider = self
            .object_stores
            .as_ref()
            .ok_or_else(|| ActionError::precondition("object storage is not configured"))?;
        let storage = desired::backup_storage(obs)
            .map_err(|e| ActionError::precondition(e.to_string()))?;
        let store = within(
            self.policy.timeouts.transfer(),
            provider.connect(&storage),
            |limit| Error::storage("connect", format!("timed out after {}ms", limit.as_millis())),
        )
        .await
        .map_err(|e| ActionError::failed(e.to_string()))?;
        Ok((storage, store))
    }

    async fn create_backup(
        &self,
        obs: &Observation,
    ) -> std::result::Result<ActionOutput, ActionError> {
        if !obs.is_leader {
            return Err(ActionError::precondition(
                "backups can only be created on the leader",
            ));
        }
        if matches!(self.last_status, Status::Blocked(_)) {
            return Err(ActionError::precondition("the unit is blocked"));
        }
        let facts = self
            .facts()
            .await
            .map_err(|e| ActionError::failed(e.to_string()))?;
        let (Some(version), Some(deployment)) = (facts.version, facts.uuid) else {
            return Err(ActionError::precondition(
                "the workload has not been initialised",
            ));
        };
        let api_url = desired::local_api_url(obs, &self.policy)
            .map_err(|e| ActionError::precondition(e.to_string()))?;

        let (storage, store) = self.object_store(obs).await?;
        let backups = Backups::new(
            store.as_ref(),
            self.workload.as_ref(),
            &storage,
            self.policy.timeouts,
        );
        backups
            .claim(&deployment)
            .await
            .map_err(|e| ActionError::failed(e.to_string()))?;

        let request = BackupRequest {
            id: backup::new_backup_id(),
            app: obs.app.clone(),
            unit: obs.unit.clone(),
            version,
            channel: facts.installed_channel.unwrap_or_default(),
            admin: INTERNAL_ADMIN_USER.to_string(),
            api_url,
        };
        backups
            .create(&request)
            .await
            .map_err(|e| ActionError::failed(e.to_string()))?;
        Ok(output(
            "backups",
            format!("backup created with id {}", request.id),
        ))
    }

    async fn list_backups(
        &self,
        obs: &Observation,
    ) -> std::result::Result<ActionOutput, ActionError> {
        let (storage, store) = self.object_store(obs).await?;
        let backups = Backups::new(
            store.as_ref(),
            self.workload.as_ref(),
            &storage,
            self.policy.timeouts,
        );
        let listed = backups
            .list()
            .await
            .map_err(|e| ActionError::failed(e.to_string()))?;
        Ok(output(
            "backups",
            backup::format_backup_list(&storage.bucket, backups.layout(), &listed),
        ))
    }

    async fn restore_backup(
        &self,
        obs: &Observation,
        backup_id: String,
        controller_id: String,
    ) -> std::result::Result<ActionOutput, ActionError> {
        if obs.relation(endpoints::DATABASE).is_some() {
            return Err(ActionError::precondition(
                "the database relation must be removed before restoring",
            ));
        }
        let facts = self
            .facts()
            .await
            .map_err(|e| ActionError::failed(e.to_string()))?;
        let installed_version = facts
            .version
            .ok_or_else(|| ActionError::precondition("the workload is not installed"))?;

        let (storage, store) = self.object_store(obs).await?;
        let request = RestoreRequest {
            backup_id,
            controller_id,
            installed_version,
            region_units: desired::region_units(obs),
        };
        Backups::new(
            store.as_ref(),
            self.workload.as_ref(),
            &storage,
            self.policy.timeouts,
        )
        .restore(&request)
        .await
        .map_err(|e| match e {
            Error::Validation { .. } => ActionError::precondition(e.to_string()),
            _ => ActionError::failed(e.to_string()),
        })?;
        info!(backup = %request.backup_id, "backup restored");
        Ok(output("restore-status", "restore finished"))
    }

    /// Render what the current inputs would produce without touching disk.
    ///
    /// # Errors
    ///
    /// Returns the error a reconciliation pass would report.
    pub async fn preview(&self) -> Result<Vec<Artifact>> {
        let obs = self.observe().await?;
        let facts = self.facts().await?;
        let desired = DesiredState::derive(&obs, &facts, &self.policy)?;
        self.renderer.render(&desired.service)
    }
}

fn output(key: &str, value: impl Into<String>) -> ActionOutput {
    ActionOutput::from([(key.to_string(), value.into())])
}

/// Run `fut` with a deadline, mapping expiry through `on_timeout`.
pub(crate) async fn within<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
    on_timeout: impl FnOnce(Duration) -> Error,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(limit)),
    }
}

/// Drop whatever a departure event says is going away, so the pass
/// converges to the state after it.
fn exclude_departing(obs: &mut Observation, event: &Event) {
    match event {
        Event::RelationBroken(gone) => obs.relations.retain(|r| r.id != gone.id),
        Event::RelationDeparted(gone) => {
            if let Some(unit) = &gone.unit {
                for relation in obs.relations.iter_mut().filter(|r| r.id == gone.id) {
                    relation.units.remove(unit);
                }
            }
        }
        _ => {}
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ADMIN_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Numeric components of a channel's track, e.g. `3.6/stable` → `[3, 6]`.
fn track_version(channel: &str) -> Option<Vec<u64>> {
    channel
        .split('/')
        .next()?
        .split('.')
        .map(|part| part.parse().ok())
        .collect()
}

/// Whether moving from `from` to `to` lowers the track version. Tracks that
/// are not numeric never count as a downgrade.
fn is_downgrade(from: &str, to: &str) -> bool {
    match (track_version(from), track_version(to)) {
        (Some(from), Some(to)) => to < from,
        _ => false,
    }
}

/// Builder for [`Reconciler`].
pub struct ReconcilerBuilder {
    runtime: Option<Arc<dyn Runtime>>,
    workload: Option<Arc<dyn Workload>>,
    supervisor: Option<Arc<dyn Supervisor>>,
    renderer: Arc<dyn Render>,
    object_stores: Option<Arc<dyn ObjectStoreProvider>>,
    store: Option<ArtifactStore>,
    policy: Policy,
}

impl ReconcilerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            runtime: None,
            workload: None,
            supervisor: None,
            renderer: Arc::new(YamlRenderer),
            object_stores: None,
            store: None,
            policy: Policy::default(),
        }
    }

    #[must_use]
    pub fn with_runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    #[must_use]
    pub fn with_workload(mut self, workload: Arc<dyn Workload>) -> Self {
        self.workload = Some(workload);
        self
    }

    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Replace the default YAML renderer.
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn Render>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Enable the backup actions against stores from `provider`.
    #[must_use]
    pub fn with_object_stores(mut self, provider: Arc<dyn ObjectStoreProvider>) -> Self {
        self.object_stores = Some(provider);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Build the reconciler, loading the applied-state marker from the store.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a collaborator is missing.
    pub fn build(self) -> Result<Reconciler> {
        let missing = |what: &str| Error::validation("reconciler", format!("{what} is required"));
        let runtime = self.runtime.ok_or_else(|| missing("runtime"))?;
        let workload = self.workload.ok_or_else(|| missing("workload"))?;
        let supervisor = self.supervisor.ok_or_else(|| missing("supervisor"))?;
        let store = self.store.ok_or_else(|| missing("artifact store"))?;

        let applied = store.load_applied();
        debug!(
            service = ?applied.service.as_ref().map(Fingerprint::short),
            artifacts = applied.artifacts.len(),
            "loaded applied state"
        );

        Ok(Reconciler {
            runtime,
            workload,
            supervisor,
            renderer: self.renderer,
            object_stores: self.object_stores,
            store,
            policy: self.policy,
            applied,
            last_status: Status::default(),
        })
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use tempfile::TempDir;

    use super::*;
    use crate::memory::{InMemoryRuntime, InMemorySupervisor, InMemoryWorkload};

    #[test]
    fn test_downgrade_detection() {
        assert!(is_downgrade("3.6/stable", "3.5/stable"));
        assert!(is_downgrade("3.10/stable", "3.9/edge"));
        assert!(!is_downgrade("3.5/stable", "3.6/stable"));
        assert!(!is_downgrade("3.6/stable", "3.6/edge"));
        assert!(!is_downgrade("latest/edge", "3.6/stable"));
    }

    #[test]
    fn test_generated_password_shape() {
        let password = generate_password();
        assert_eq!(password.len(), ADMIN_PASSWORD_LEN);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_broken_relation_is_excluded() {
        use crate::types::RelationRef;
        use maas_operator_core::RelationRecord;

        let mut obs = Observation::new("maas-region/0", "maas-region", "r0");
        obs.relations
            .push(RelationRecord::new(1, endpoints::DATABASE, "pg", "postgresql"));
        exclude_departing(
            &mut obs,
            &Event::RelationBroken(RelationRef::new(endpoints::DATABASE, 1)),
        );
        assert!(obs.relations.is_empty());
    }

    #[test]
    fn test_departed_unit_is_excluded() {
        use crate::types::RelationRef;
        use maas_operator_core::RelationRecord;

        let mut obs = Observation::new("maas-region/0", "maas-region", "r0");
        obs.relations.push(
            RelationRecord::new(3, endpoints::PEER, "peers", "maas-region")
                .with_unit_data("maas-region/1", "system-name", "r1")
                .with_unit_data("maas-region/2", "system-name", "r2"),
        );
        exclude_departing(
            &mut obs,
            &Event::RelationDeparted(RelationRef::new(endpoints::PEER, 3).with_unit("maas-region/1")),
        );
        assert_eq!(desired::regions(&obs), vec!["r0", "r2"]);
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let result = ReconcilerBuilder::new().build();
        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[tokio::test]
    async fn test_builder_loads_applied_state() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), "applied-state.json");
        let applied = AppliedState {
            service: Some(Fingerprint::of_bytes(b"x")),
            ..AppliedState::default()
        };
        store.save_applied(&applied).unwrap();

        let reconciler = Reconciler::builder()
            .with_runtime(Arc::new(InMemoryRuntime::new(Observation::new("u/0", "u", "h"))))
            .with_workload(Arc::new(InMemoryWorkload::installed("3.6/stable")))
            .with_supervisor(Arc::new(InMemorySupervisor::new()))
            .with_store(store)
            .build()
            .unwrap();

        assert_eq!(reconciler.applied(), &applied);
        assert_eq!(reconciler.status(), &Status::default());
    }
}
