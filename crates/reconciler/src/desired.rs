//! Desired state derivation.
//!
//! [`DesiredState::derive`] is a pure function of one observation, the
//! workload facts read alongside it, and the operator [`Policy`]. Loosely
//! typed relation data and option values are validated here, so everything
//! downstream works with checked, strongly typed values.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use maas_operator_core::{
    DataBag, EndpointSource, Observation, OperatorConfig, PortConfig, TimeoutConfig,
    WorkloadFacts,
};
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::runtime::Publication;
use crate::types::Status;

/// Relation endpoint names.
pub mod endpoints {
    /// Backing database.
    pub const DATABASE: &str = "maas-db";
    /// Reverse proxy in front of the API.
    pub const PROXY: &str = "api";
    /// Trace collector.
    pub const TRACING: &str = "tracing";
    /// Peers of this application.
    pub const PEER: &str = "maas-cluster";
    /// Object storage for backups.
    pub const OBJECT_STORAGE: &str = "s3-parameters";
    /// Agents enrolling against this region.
    pub const CONTROLLER: &str = "maas-region";
    /// Site manager this region enrolls with.
    pub const SITE_MANAGER: &str = "maas-site-manager";
}

/// Configuration option names.
pub mod options {
    pub const MAAS_URL: &str = "maas_url";
    pub const TLS_MODE: &str = "tls_mode";
    pub const SSL_CERT: &str = "ssl_cert_content";
    pub const SSL_KEY: &str = "ssl_key_content";
    pub const SSL_CACERT: &str = "ssl_cacert_content";
    pub const METRICS: &str = "enable_prometheus_metrics";
    pub const CHANNEL: &str = "channel";
}

/// Label of the secret holding the internal admin credentials.
pub const ADMIN_SECRET_LABEL: &str = "maas-admin";
/// Peer application key the admin secret id is published under.
pub const ADMIN_SECRET_KEY: &str = "maas-admin-secret-uri";
/// Account the operator uses for its own administrative calls.
pub const INTERNAL_ADMIN_USER: &str = "maas-admin-internal";
/// Key of the site manager's secret holding the enrollment token.
pub const SITE_TOKEN_KEY: &str = "enroll-token";

const DEFAULT_DB_PORT: u16 = 5432;

// ═══════════════════════════════════════════════════════════════════════════
// POLICY
// ═══════════════════════════════════════════════════════════════════════════

/// Operator-owned policy that shapes derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// API endpoint sources, first match wins.
    pub precedence: Vec<EndpointSource>,
    pub ports: PortConfig,
    /// Channel installed when the `channel` option is unset.
    pub channel: String,
    pub timeouts: TimeoutConfig,
}

impl Policy {
    #[must_use]
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self {
            precedence: config.endpoint_precedence.clone(),
            ports: config.ports,
            channel: config.snap_channel.clone(),
            timeouts: config.timeouts,
        }
    }

    #[must_use]
    pub fn with_precedence(mut self, precedence: Vec<EndpointSource>) -> Self {
        self.precedence = precedence;
        self
    }

    /// Channel to install from, honouring the `channel` option.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the option is not a string.
    pub fn channel_for(&self, obs: &Observation) -> Result<String> {
        Ok(obs
            .config
            .string(options::CHANNEL)?
            .map_or_else(|| self.channel.clone(), str::to_string))
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::from_config(&OperatorConfig::default())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TYPED STATE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    /// No TLS anywhere.
    Disabled,
    /// TLS terminated at the reverse proxy.
    Termination,
    /// TLS passed through to the workload.
    Passthrough,
}

impl TlsMode {
    pub const ALL: [&'static str; 3] = ["disabled", "termination", "passthrough"];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Termination => "termination",
            Self::Passthrough => "passthrough",
        }
    }
}

impl FromStr for TlsMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "termination" => Ok(Self::Termination),
            "passthrough" => Ok(Self::Passthrough),
            other => Err(Error::validation(
                options::TLS_MODE,
                format!(
                    "'{other}' is not one of {}",
                    TlsMode::ALL.join(", ")
                ),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperatingMode {
    #[serde(rename = "region")]
    Region,
    #[serde(rename = "region+rack")]
    RegionRack,
}

impl OperatingMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Region => "region",
            Self::RegionRack => "region+rack",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    pub password: String,
    /// Endpoint the service connects to.
    pub primary: DbEndpoint,
    /// Further endpoints offered by the backing store, in offered order.
    pub standby: Vec<DbEndpoint>,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("primary", &self.primary)
            .field("standby", &self.standby)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct TlsMaterial {
    pub cert: String,
    pub key: String,
    pub cacert: Option<String>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .field("cacert", &self.cacert.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsConfig {
    pub mode: TlsMode,
    /// Present exactly when `mode` is passthrough.
    pub material: Option<TlsMaterial>,
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ObjectStorage {
    pub bucket: String,
    pub region: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    /// Key prefix inside the bucket, without leading or trailing slashes.
    pub path: String,
    pub tls_ca_chain: Option<String>,
}

impl fmt::Debug for ObjectStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorage")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("path", &self.path)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// The externally reachable API URL and where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiEndpoint {
    pub url: String,
    pub source: EndpointSource,
}

/// Everything rendered into configuration artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceConfig {
    pub api: ApiEndpoint,
    pub database: DatabaseConfig,
    pub mode: OperatingMode,
    pub tls: TlsConfig,
    pub tracing_endpoint: Option<String>,
    pub object_storage: Option<ObjectStorage>,
}

/// What the leader does to the workload's TLS setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TlsAction {
    Keep,
    Enable,
    Disable,
}

/// Enrollment data offered to one controller relation.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct ControllerOffer {
    pub relation_id: u32,
    pub api_url: String,
    pub regions: Vec<String>,
    pub enrollment_secret: String,
}

impl fmt::Debug for ControllerOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerOffer")
            .field("relation_id", &self.relation_id)
            .field("api_url", &self.api_url)
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}

/// Enrollment with a site manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteEnrollment {
    pub relation_id: u32,
    /// Deployment UUID the site manager issues a token for.
    pub uuid: String,
    /// Id of the secret holding the issued token, once there is one.
    pub token_id: Option<String>,
}

/// Singleton work only the elected leader performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderDuties {
    pub admin_user: String,
    /// API URL on this machine, used for the operator's own calls.
    pub local_api_url: String,
    pub metrics: bool,
    pub tls: TlsAction,
    /// Peer relations the admin secret id is shared on.
    pub peers: Vec<u32>,
    pub offers: Vec<ControllerOffer>,
    pub site_manager: Option<SiteEnrollment>,
}

/// The converged state this unit should be in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub service: ServiceConfig,
    /// Unit-scoped relation data to publish.
    pub publications: Vec<Publication>,
    /// `Some` only on the leader.
    pub leader: Option<LeaderDuties>,
    /// Optional inputs still outstanding; reported as waiting.
    pub pending: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// DERIVATION
// ═══════════════════════════════════════════════════════════════════════════

impl DesiredState {
    /// Derive the desired state from one event's inputs.
    ///
    /// # Errors
    ///
    /// - `MissingDependency` when the workload is not installed or the
    ///   database relation is absent or incomplete
    /// - `Validation` when an option or relation value is malformed
    /// - `Render` when proxy service definitions cannot be encoded
    pub fn derive(obs: &Observation, facts: &WorkloadFacts, policy: &Policy) -> Result<Self> {
        if !facts.is_installed() {
            return Err(Error::missing_dependency("workload installation"));
        }
        let database = database(obs)?;

        let tls = tls_config(obs)?;
        let api = resolve_api_endpoint(obs, policy)?;
        let tracing_endpoint = tracing_endpoint(obs)?;
        let mut pending = Vec::new();

        let object_storage = match obs.relation(endpoints::OBJECT_STORAGE) {
            None => None,
            Some(relation) => {
                let storage = object_storage(&relation.app_data);
                if storage.is_none() {
                    pending.push("object storage credentials".to_string());
                }
                storage
            }
        };

        let mode = if rack_agents(obs).contains_key(&obs.hostname) {
            OperatingMode::RegionRack
        } else {
            OperatingMode::Region
        };

        let service = ServiceConfig {
            api,
            database,
            mode,
            tls,
            tracing_endpoint,
            object_storage,
        };

        let publications = unit_publications(obs, &service, policy)?;

        let leader = if obs.is_leader {
            let duties = leader_duties(obs, facts, &service, policy)?;
            if duties.offers.is_empty()
                && obs.relation(endpoints::CONTROLLER).is_some()
                && facts.enrollment_secret.is_none()
            {
                pending.push("enrollment token".to_string());
            }
            if duties.site_manager.is_none() && obs.relation(endpoints::SITE_MANAGER).is_some() {
                pending.push("workload deployment UUID".to_string());
            }
            Some(duties)
        } else {
            None
        };

        debug!(
            api = %service.api.url,
            mode = service.mode.as_str(),
            leader = obs.is_leader,
            pending = pending.len(),
            "derived desired state"
        );

        Ok(Self {
            service,
            publications,
            leader,
            pending,
        })
    }

    /// Status to report once this state has been applied.
    #[must_use]
    pub fn status(&self) -> Status {
        self.pending.first().map_or_else(Status::active, |what| {
            Status::Waiting(format!("waiting for {what}"))
        })
    }
}

/// Database name derived from the application name.
#[must_use]
pub fn database_name(app: &str) -> String {
    format!("{}_db", app.replace('-', "_"))
}

fn database(obs: &Observation) -> Result<DatabaseConfig> {
    let relation = obs
        .relation(endpoints::DATABASE)
        .ok_or_else(|| Error::missing_dependency("database"))?;

    let (Some(user), Some(password), Some(raw_endpoints)) = (
        relation.app_value("username"),
        relation.app_value("password"),
        relation.app_value("endpoints"),
    ) else {
        return Err(Error::missing_dependency("database credentials"));
    };

    let mut parsed = raw_endpoints
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(parse_db_endpoint)
        .collect::<Result<Vec<_>>>()?
        .into_iter();

    let primary = parsed
        .next()
        .ok_or_else(|| Error::missing_dependency("database credentials"))?;

    Ok(DatabaseConfig {
        name: database_name(&obs.app),
        user: user.to_string(),
        password: password.to_string(),
        primary,
        standby: parsed.collect(),
    })
}

fn parse_db_endpoint(raw: &str) -> Result<DbEndpoint> {
    let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::validation("database endpoint", format!("'{raw}' is malformed")))?;
        (host, tail.strip_prefix(':'))
    } else {
        match raw.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            _ => (raw, None),
        }
    };

    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(Error::validation(
            "database endpoint",
            format!("'{raw}' has no usable host"),
        ));
    }

    let port = match port {
        None => DEFAULT_DB_PORT,
        Some(p) => p.parse::<u16>().map_err(|e| {
            Error::validation("database endpoint", format!("'{raw}' has a bad port: {e}"))
        })?,
    };

    Ok(DbEndpoint {
        host: host.to_string(),
        port,
    })
}

fn tls_config(obs: &Observation) -> Result<TlsConfig> {
    let mode = obs
        .config
        .string(options::TLS_MODE)?
        .map_or(Ok(TlsMode::Disabled), str::parse)?;

    let material = if mode == TlsMode::Passthrough {
        let cert = obs.config.string(options::SSL_CERT)?;
        let key = obs.config.string(options::SSL_KEY)?;
        let (Some(cert), Some(key)) = (cert, key) else {
            return Err(Error::validation(
                options::TLS_MODE,
                format!(
                    "both {} and {} must be set when using passthrough",
                    options::SSL_CERT,
                    options::SSL_KEY
                ),
            ));
        };
        Some(TlsMaterial {
            cert: cert.to_string(),
            key: key.to_string(),
            cacert: obs.config.string(options::SSL_CACERT)?.map(str::to_string),
        })
    } else {
        None
    };

    Ok(TlsConfig { mode, material })
}

/// Resolve the API endpoint by walking the precedence table.
///
/// # Errors
///
/// - `Validation` if the winning source holds a malformed value
/// - `MissingDependency` if no source yields an endpoint
pub fn resolve_api_endpoint(obs: &Observation, policy: &Policy) -> Result<ApiEndpoint> {
    for source in &policy.precedence {
        if let Some(url) = endpoint_candidate(*source, obs, policy)? {
            return Ok(ApiEndpoint {
                url,
                source: *source,
            });
        }
    }
    Err(Error::missing_dependency("an API endpoint"))
}

fn endpoint_candidate(
    source: EndpointSource,
    obs: &Observation,
    policy: &Policy,
) -> Result<Option<String>> {
    match source {
        EndpointSource::ConfigOverride => obs
            .config
            .string(options::MAAS_URL)?
            .map(|raw| validate_url(options::MAAS_URL, raw))
            .transpose(),
        EndpointSource::Proxy => obs
            .relation(endpoints::PROXY)
            .and_then(|r| r.first_unit_value("public-address"))
            .map(|addr| host_url("proxy public-address", addr, policy.ports.proxy))
            .transpose(),
        EndpointSource::Direct => obs
            .bind_address
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .map(|addr| host_url("bind address", addr, policy.ports.http))
            .transpose(),
    }
}

fn validate_url(field: &str, raw: &str) -> Result<String> {
    let raw = raw.trim();
    let parsed = url::Url::parse(raw).map_err(|e| Error::validation(field, format!("'{raw}': {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::validation(
            field,
            format!("'{raw}' must use http or https"),
        ));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(Error::validation(field, format!("'{raw}' has no host")));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

fn host_url(field: &str, addr: &str, port: u16) -> Result<String> {
    let addr = addr.trim();
    if addr.is_empty() || addr.contains(['/', '?', '#', '@']) || addr.contains(char::is_whitespace)
    {
        return Err(Error::validation(field, format!("'{addr}' is not a host")));
    }
    let host = if addr.contains(':') && !addr.starts_with('[') {
        format!("[{addr}]")
    } else {
        addr.to_string()
    };
    Ok(format!("http://{host}:{port}/MAAS"))
}

fn tracing_endpoint(obs: &Observation) -> Result<Option<String>> {
    obs.relation(endpoints::TRACING)
        .and_then(|r| r.app_value("endpoint"))
        .map(|raw| validate_url("tracing endpoint", raw))
        .transpose()
}

fn object_storage(data: &DataBag) -> Option<ObjectStorage> {
    let get = |key: &str| {
        data.get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    Some(ObjectStorage {
        bucket: get("bucket")?.trim_matches('/').to_string(),
        region: get("region")?,
        endpoint: get("endpoint")?.trim_end_matches('/').to_string(),
        access_key: get("access-key")?,
        secret_key: get("secret-key")?,
        path: get("path")
            .map(|p| p.trim_matches('/').to_string())
            .unwrap_or_default(),
        tls_ca_chain: get("tls-ca-chain"),
    })
}

/// Object storage credentials for backup actions.
///
/// # Errors
///
/// Returns `MissingDependency` when the storage relation is absent or
/// lacks a required key.
pub fn backup_storage(obs: &Observation) -> Result<ObjectStorage> {
    let relation = obs
        .relation(endpoints::OBJECT_STORAGE)
        .ok_or_else(|| Error::missing_dependency("an object storage relation"))?;
    object_storage(&relation.app_data)
        .ok_or_else(|| Error::missing_dependency("object storage credentials"))
}

/// Host names of every region controller: this machine plus its peers.
#[must_use]
pub fn regions(obs: &Observation) -> Vec<String> {
    let mut names: BTreeSet<String> = obs
        .relations_on(endpoints::PEER)
        .flat_map(|r| r.units.values())
        .filter_map(|bag| bag.get("system-name"))
        .filter(|name| !name.trim().is_empty())
        .cloned()
        .collect();
    names.insert(obs.hostname.clone());
    names.into_iter().collect()
}

/// Region units in the deployment, this one included.
#[must_use]
pub fn region_units(obs: &Observation) -> usize {
    obs.relations_on(endpoints::PEER)
        .map(|r| r.units.len())
        .sum::<usize>()
        + 1
}

/// Plain HTTP API URL on this machine, for the operator's own calls.
///
/// # Errors
///
/// Returns `Validation` if the bind address does not form a valid URL.
pub fn local_api_url(obs: &Observation, policy: &Policy) -> Result<String> {
    let local_host = obs.bind_address.as_deref().unwrap_or(&obs.hostname);
    host_url("bind address", local_host, policy.ports.http)
}

/// Agents enrolled over the controller relation, keyed by their URL.
#[must_use]
pub fn rack_agents(obs: &Observation) -> BTreeMap<String, String> {
    obs.relations_on(endpoints::CONTROLLER)
        .flat_map(|r| r.units.iter())
        .filter_map(|(unit, bag)| {
            let url = bag.get("url").filter(|u| !u.trim().is_empty())?;
            bag.get("unit")?;
            Some((url.clone(), unit.clone()))
        })
        .collect()
}

#[derive(Serialize)]
struct ProxyService {
    service_name: String,
    service_host: &'static str,
    service_port: u16,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    service_options: Vec<&'static str>,
    servers: Vec<(String, String, u16, Vec<String>)>,
}

fn proxy_services(obs: &Observation, service: &ServiceConfig, policy: &Policy) -> Result<String> {
    let app_name = format!("api-{}", obs.app);
    let server_name = format!("{app_name}-{}", obs.unit.replace('/', "-"));
    let address = obs
        .bind_address
        .clone()
        .unwrap_or_else(|| obs.hostname.clone());
    let region_port = if service.tls.mode == TlsMode::Passthrough {
        policy.ports.https
    } else {
        policy.ports.http
    };

    let mut services = vec![ProxyService {
        service_name: if policy.ports.proxy == 80 {
            "haproxy_service".to_string()
        } else {
            app_name
        },
        service_host: "0.0.0.0",
        service_port: policy.ports.proxy,
        service_options: vec!["mode http", "balance leastconn"],
        servers: vec![(server_name.clone(), address.clone(), region_port, Vec::new())],
    }];

    if service.tls.mode != TlsMode::Disabled {
        services.push(ProxyService {
            service_name: "agent_service".to_string(),
            service_host: "0.0.0.0",
            service_port: policy.ports.proxy,
            service_options: Vec::new(),
            servers: vec![(server_name, address, policy.ports.http, Vec::new())],
        });
    }

    serde_yaml::to_string(&services).map_err(|e| Error::render("proxy services", e.to_string()))
}

fn unit_publications(
    obs: &Observation,
    service: &ServiceConfig,
    policy: &Policy,
) -> Result<Vec<Publication>> {
    let mut publications: Vec<Publication> = obs
        .relations_on(endpoints::PEER)
        .map(|r| {
            let data = DataBag::from([("system-name".to_string(), obs.hostname.clone())]);
            Publication::unit(endpoints::PEER, r.id, data)
        })
        .collect();

    let proxies: Vec<u32> = obs.relations_on(endpoints::PROXY).map(|r| r.id).collect();
    if !proxies.is_empty() {
        let services = proxy_services(obs, service, policy)?;
        publications.extend(proxies.into_iter().map(|id| {
            let data = DataBag::from([("services".to_string(), services.clone())]);
            Publication::unit(endpoints::PROXY, id, data)
        }));
    }

    Ok(publications)
}

fn leader_duties(
    obs: &Observation,
    facts: &WorkloadFacts,
    service: &ServiceConfig,
    policy: &Policy,
) -> Result<LeaderDuties> {
    let local_api_url = local_api_url(obs, policy)?;

    let tls = match (facts.tls_enabled, service.tls.mode) {
        (Some(false), TlsMode::Passthrough) => TlsAction::Enable,
        (Some(true), TlsMode::Disabled | TlsMode::Termination) => TlsAction::Disable,
        _ => TlsAction::Keep,
    };

    let offers = match &facts.enrollment_secret {
        None => Vec::new(),
        Some(secret) => {
            let regions = regions(obs);
            obs.relations_on(endpoints::CONTROLLER)
                .map(|r| ControllerOffer {
                    relation_id: r.id,
                    api_url: service.api.url.clone(),
                    regions: regions.clone(),
                    enrollment_secret: secret.clone(),
                })
                .collect()
        }
    };

    let site_manager = obs.relation(endpoints::SITE_MANAGER).and_then(|r| {
        Some(SiteEnrollment {
            relation_id: r.id,
            uuid: facts.uuid.clone()?,
            token_id: r.app_value("token_id").map(|t| t.trim().to_string()),
        })
    });

    Ok(LeaderDuties {
        admin_user: INTERNAL_ADMIN_USER.to_string(),
        local_api_url,
        metrics: obs.config.bool(options::METRICS)?.unwrap_or(false),
        tls,
        peers: obs.relations_on(endpoints::PEER).map(|r| r.id).collect(),
        offers,
        site_manager,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::indexing_slicing)]

    use maas_operator_core::RelationRecord;

    use super::*;

    fn facts() -> WorkloadFacts {
        WorkloadFacts {
            installed_channel: Some("3.6/stable".to_string()),
            tls_enabled: Some(false),
            ..WorkloadFacts::default()
        }
    }

    fn db() -> RelationRecord {
        RelationRecord::new(1, endpoints::DATABASE, "postgresql_client", "postgresql")
            .with_app_data("username", "maas")
            .with_app_data("password", "s3cret")
            .with_app_data("endpoints", "10.0.0.5:5432,10.0.0.6")
    }

    fn observation() -> Observation {
        let mut obs = Observation::new("maas-region/0", "maas-region", "region-0.maas");
        obs.bind_address = Some("10.0.0.10".to_string());
        obs.relations.push(db());
        obs
    }

    #[test]
    fn test_missing_database_is_a_missing_dependency() {
        let mut obs = observation();
        obs.relations.clear();
        let err = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap_err();
        assert_eq!(err, Error::missing_dependency("database"));
    }

    #[test]
    fn test_incomplete_database_is_a_missing_dependency() {
        let mut obs = observation();
        obs.relations = vec![RelationRecord::new(1, endpoints::DATABASE, "pg", "postgresql")
            .with_app_data("username", "maas")];
        let err = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap_err();
        assert!(matches!(err, Error::MissingDependency { .. }));
    }

    #[test]
    fn test_uninstalled_workload_blocks() {
        let err = DesiredState::derive(&observation(), &WorkloadFacts::default(), &Policy::default())
            .unwrap_err();
        assert!(matches!(err.status(), Status::Blocked(_)));
    }

    #[test]
    fn test_database_endpoints_parsed() {
        let desired = DesiredState::derive(&observation(), &facts(), &Policy::default()).unwrap();
        let database = &desired.service.database;
        assert_eq!(database.name, "maas_region_db");
        assert_eq!(database.primary, DbEndpoint { host: "10.0.0.5".into(), port: 5432 });
        assert_eq!(database.standby, vec![DbEndpoint { host: "10.0.0.6".into(), port: 5432 }]);
    }

    #[test]
    fn test_ipv6_database_endpoint() {
        let endpoint = parse_db_endpoint("[fd00::5]:6432").unwrap();
        assert_eq!(endpoint.host, "fd00::5");
        assert_eq!(endpoint.port, 6432);
        assert!(parse_db_endpoint("10.0.0.5:notaport").is_err());
    }

    #[test]
    fn test_direct_endpoint_by_default() {
        let desired = DesiredState::derive(&observation(), &facts(), &Policy::default()).unwrap();
        assert_eq!(desired.service.api.url, "http://10.0.0.10:5240/MAAS");
        assert_eq!(desired.service.api.source, EndpointSource::Direct);
    }

    #[test]
    fn test_proxy_beats_direct() {
        let mut obs = observation();
        obs.relations.push(
            RelationRecord::new(2, endpoints::PROXY, "http", "haproxy")
                .with_unit_data("haproxy/0", "public-address", "192.168.1.1"),
        );
        let desired = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap();
        assert_eq!(desired.service.api.url, "http://192.168.1.1:80/MAAS");
        assert_eq!(desired.service.api.source, EndpointSource::Proxy);
    }

    #[test]
    fn test_override_beats_proxy() {
        let mut obs = observation();
        obs.config.set(options::MAAS_URL, "https://maas.example.com/MAAS/");
        obs.relations.push(
            RelationRecord::new(2, endpoints::PROXY, "http", "haproxy")
                .with_unit_data("haproxy/0", "public-address", "192.168.1.1"),
        );
        let desired = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap();
        assert_eq!(desired.service.api.url, "https://maas.example.com/MAAS");
    }

    #[test]
    fn test_precedence_table_is_configurable() {
        let mut obs = observation();
        obs.relations.push(
            RelationRecord::new(2, endpoints::PROXY, "http", "haproxy")
                .with_unit_data("haproxy/0", "public-address", "192.168.1.1"),
        );
        let policy = Policy::default()
            .with_precedence(vec![EndpointSource::Direct, EndpointSource::Proxy]);
        let desired = DesiredState::derive(&obs, &facts(), &policy).unwrap();
        assert_eq!(desired.service.api.source, EndpointSource::Direct);
    }

    #[test]
    fn test_malformed_override_is_validation_error() {
        let mut obs = observation();
        obs.config.set(options::MAAS_URL, "ftp://maas");
        let err = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_no_endpoint_source_available() {
        let mut obs = observation();
        obs.bind_address = None;
        let err = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap_err();
        assert_eq!(err, Error::missing_dependency("an API endpoint"));
    }

    #[test]
    fn test_unknown_tls_mode_rejected() {
        let mut obs = observation();
        obs.config.set(options::TLS_MODE, "mutual");
        let err = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap_err();
        assert!(err.to_string().contains("mutual"));
        assert!(matches!(err.status(), Status::Blocked(_)));
    }

    #[test]
    fn test_passthrough_requires_material() {
        let mut obs = observation();
        obs.config.set(options::TLS_MODE, "passthrough");
        obs.config.set(options::SSL_CERT, "CERT");
        let err = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_operating_mode_detects_colocated_agent() {
        let mut obs = observation();
        obs.relations.push(
            RelationRecord::new(9, endpoints::CONTROLLER, "maas_region", "maas-agent")
                .with_unit_data("maas-agent/0", "unit", "maas-agent/0")
                .with_unit_data("maas-agent/0", "url", "region-0.maas"),
        );
        let desired = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap();
        assert_eq!(desired.service.mode, OperatingMode::RegionRack);
    }

    #[test]
    fn test_partial_object_storage_is_pending() {
        let mut obs = observation();
        obs.relations.push(
            RelationRecord::new(4, endpoints::OBJECT_STORAGE, "s3", "s3-integrator")
                .with_app_data("bucket", "maas-backups"),
        );
        let desired = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap();
        assert!(desired.service.object_storage.is_none());
        assert_eq!(
            desired.status(),
            Status::Waiting("waiting for object storage credentials".to_string())
        );
    }

    #[test]
    fn test_publications_cover_peer_and_proxy() {
        let mut obs = observation();
        obs.config.set(options::TLS_MODE, "termination");
        obs.relations
            .push(RelationRecord::new(3, endpoints::PEER, "maas_peers", "maas-region"));
        obs.relations
            .push(RelationRecord::new(2, endpoints::PROXY, "http", "haproxy"));
        let desired = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap();

        assert_eq!(desired.publications.len(), 2);
        let peer = &desired.publications[0];
        assert_eq!(peer.data["system-name"], "region-0.maas");
        let services = &desired.publications[1].data["services"];
        assert!(services.contains("haproxy_service"));
        assert!(services.contains("agent_service"));
        assert!(services.contains("api-maas-region-maas-region-0"));
    }

    #[test]
    fn test_leader_duties_only_on_leader() {
        let obs = observation();
        let desired = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap();
        assert!(desired.leader.is_none());

        let mut obs = observation();
        obs.is_leader = true;
        obs.config.set(options::METRICS, true);
        let desired = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap();
        let duties = desired.leader.unwrap();
        assert!(duties.metrics);
        assert_eq!(duties.admin_user, INTERNAL_ADMIN_USER);
        assert_eq!(duties.tls, TlsAction::Keep);
    }

    #[test]
    fn test_leader_offers_regions_to_agents() {
        let mut obs = observation();
        obs.is_leader = true;
        obs.relations.push(
            RelationRecord::new(3, endpoints::PEER, "maas_peers", "maas-region")
                .with_unit_data("maas-region/1", "system-name", "region-1.maas"),
        );
        obs.relations
            .push(RelationRecord::new(9, endpoints::CONTROLLER, "maas_region", "maas-agent"));
        let facts = WorkloadFacts {
            enrollment_secret: Some("token".to_string()),
            ..facts()
        };
        let desired = DesiredState::derive(&obs, &facts, &Policy::default()).unwrap();
        let offers = desired.leader.unwrap().offers;
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].regions, vec!["region-0.maas", "region-1.maas"]);
    }

    #[test]
    fn test_leader_waits_for_enrollment_token() {
        let mut obs = observation();
        obs.is_leader = true;
        obs.relations
            .push(RelationRecord::new(9, endpoints::CONTROLLER, "maas_region", "maas-agent"));
        let desired = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap();
        assert_eq!(
            desired.status(),
            Status::Waiting("waiting for enrollment token".to_string())
        );
    }

    #[test]
    fn test_storage_path_and_bucket_are_normalised() {
        let data = DataBag::from([
            ("bucket".to_string(), "/maas-backups/".to_string()),
            ("region".to_string(), "eu-west-1".to_string()),
            ("endpoint".to_string(), "https://s3.example.com/".to_string()),
            ("access-key".to_string(), "AK".to_string()),
            ("secret-key".to_string(), "SK".to_string()),
            ("path".to_string(), "/region/prod/".to_string()),
        ]);
        let storage = object_storage(&data).unwrap();
        assert_eq!(storage.bucket, "maas-backups");
        assert_eq!(storage.endpoint, "https://s3.example.com");
        assert_eq!(storage.path, "region/prod");
    }

    #[test]
    fn test_backup_storage_needs_relation() {
        let err = backup_storage(&observation()).unwrap_err();
        assert_eq!(err, Error::missing_dependency("an object storage relation"));
    }

    #[test]
    fn test_site_manager_enrollment_carries_uuid_and_token() {
        let mut obs = observation();
        obs.is_leader = true;
        obs.relations.push(
            RelationRecord::new(6, endpoints::SITE_MANAGER, "maas_site_manager", "msm")
                .with_app_data("token_id", "secret:msm-token"),
        );
        let facts = WorkloadFacts {
            uuid: Some("8a6c1f02".to_string()),
            ..facts()
        };
        let desired = DesiredState::derive(&obs, &facts, &Policy::default()).unwrap();
        let site = desired.leader.unwrap().site_manager.unwrap();
        assert_eq!(site.relation_id, 6);
        assert_eq!(site.uuid, "8a6c1f02");
        assert_eq!(site.token_id.as_deref(), Some("secret:msm-token"));
    }

    #[test]
    fn test_site_manager_waits_for_deployment_uuid() {
        let mut obs = observation();
        obs.is_leader = true;
        obs.relations
            .push(RelationRecord::new(6, endpoints::SITE_MANAGER, "maas_site_manager", "msm"));
        let desired = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap();
        assert!(desired.leader.unwrap().site_manager.is_none());
        assert_eq!(
            desired.pending,
            vec!["workload deployment UUID".to_string()]
        );
    }

    #[test]
    fn test_tls_action_follows_workload_state() {
        let mut obs = observation();
        obs.is_leader = true;
        let enabled = WorkloadFacts {
            tls_enabled: Some(true),
            ..facts()
        };
        let desired = DesiredState::derive(&obs, &enabled, &Policy::default()).unwrap();
        assert_eq!(desired.leader.unwrap().tls, TlsAction::Disable);

        obs.config.set(options::TLS_MODE, "passthrough");
        obs.config.set(options::SSL_CERT, "CERT");
        obs.config.set(options::SSL_KEY, "KEY");
        let desired = DesiredState::derive(&obs, &facts(), &Policy::default()).unwrap();
        assert_eq!(desired.leader.unwrap().tls, TlsAction::Enable);
    }
}
