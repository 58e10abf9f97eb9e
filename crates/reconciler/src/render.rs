//! Rendering of service configuration into artifact files.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::desired::{ObjectStorage, ServiceConfig};
use crate::error::{Error, Result};
use crate::workload::TlsFiles;

pub const REGIOND_CONF: &str = "regiond.conf";
pub const OBJECT_STORAGE_CONF: &str = "object-storage.yaml";
pub const TLS_CERT: &str = "maas-cert.pem";
pub const TLS_KEY: &str = "maas-key.pem";
pub const TLS_CACERT: &str = "maas-cacert.pem";

const OWNER_ONLY: u32 = 0o600;
const WORLD_READABLE: u32 = 0o644;

/// One file to be written under the config directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Path relative to the config directory.
    pub path: PathBuf,
    pub contents: String,
    /// Unix permission bits.
    pub mode: u32,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode,
        }
    }
}

/// Turns a service configuration into the full set of artifacts.
///
/// Rendering happens entirely in memory so a failure leaves nothing on disk.
pub trait Render: Send + Sync {
    /// # Errors
    ///
    /// Returns `Render` if any artifact cannot be produced.
    fn render(&self, service: &ServiceConfig) -> Result<Vec<Artifact>>;
}

/// Renders `regiond.conf` and friends as YAML.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlRenderer;

#[derive(Serialize)]
struct RegiondConf<'a> {
    maas_url: &'a str,
    database_host: &'a str,
    database_port: u16,
    database_name: &'a str,
    database_user: &'a str,
    database_pass: &'a str,
    operating_mode: &'static str,
    tls_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tracing_endpoint: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ObjectStorageConf<'a> {
    bucket: &'a str,
    region: &'a str,
    endpoint: &'a str,
    access_key: &'a str,
    secret_key: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_ca_chain: Option<&'a str>,
}

impl<'a> From<&'a ObjectStorage> for ObjectStorageConf<'a> {
    fn from(s: &'a ObjectStorage) -> Self {
        Self {
            bucket: &s.bucket,
            region: &s.region,
            endpoint: &s.endpoint,
            access_key: &s.access_key,
            secret_key: &s.secret_key,
            path: &s.path,
            tls_ca_chain: s.tls_ca_chain.as_deref(),
        }
    }
}

fn yaml<T: Serialize>(artifact: &str, value: &T) -> Result<String> {
    serde_yaml::to_string(value).map_err(|e| Error::render(artifact, e.to_string()))
}

impl Render for YamlRenderer {
    fn render(&self, service: &ServiceConfig) -> Result<Vec<Artifact>> {
        let db = &service.database;
        let regiond = RegiondConf {
            maas_url: &service.api.url,
            database_host: &db.primary.host,
            database_port: db.primary.port,
            database_name: &db.name,
            database_user: &db.user,
            database_pass: &db.password,
            operating_mode: service.mode.as_str(),
            tls_mode: service.tls.mode.as_str(),
            tracing_endpoint: service.tracing_endpoint.as_deref(),
        };

        let mut artifacts = vec![Artifact::new(
            REGIOND_CONF,
            yaml(REGIOND_CONF, &regiond)?,
            OWNER_ONLY,
        )];

        if let Some(material) = &service.tls.material {
            artifacts.push(Artifact::new(TLS_CERT, pem(&material.cert), WORLD_READABLE));
            artifacts.push(Artifact::new(TLS_KEY, pem(&material.key), OWNER_ONLY));
            if let Some(cacert) = &material.cacert {
                artifacts.push(Artifact::new(TLS_CACERT, pem(cacert), WORLD_READABLE));
            }
        }

        if let Some(storage) = &service.object_storage {
            artifacts.push(Artifact::new(
                OBJECT_STORAGE_CONF,
                yaml(OBJECT_STORAGE_CONF, &ObjectStorageConf::from(storage))?,
                OWNER_ONLY,
            ));
        }

        Ok(artifacts)
    }
}

fn pem(content: &str) -> String {
    let mut out = content.trim_end().to_string();
    out.push('\n');
    out
}

/// Where the workload finds rendered TLS material, if this set has any.
#[must_use]
pub fn tls_files(config_dir: &Path, artifacts: &[PathBuf]) -> Option<TlsFiles> {
    let has = |name: &str| artifacts.iter().any(|p| p == Path::new(name));
    (has(TLS_CERT) && has(TLS_KEY)).then(|| TlsFiles {
        cert: config_dir.join(TLS_CERT),
        key: config_dir.join(TLS_KEY),
        cacert: has(TLS_CACERT).then(|| config_dir.join(TLS_CACERT)),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use maas_operator_core::EndpointSource;

    use super::*;
    use crate::desired::{
        ApiEndpoint, DatabaseConfig, DbEndpoint, OperatingMode, TlsConfig, TlsMaterial, TlsMode,
    };

    fn service() -> ServiceConfig {
        ServiceConfig {
            api: ApiEndpoint {
                url: "http://10.0.0.10:5240/MAAS".to_string(),
                source: EndpointSource::Direct,
            },
            database: DatabaseConfig {
                name: "maas_region_db".to_string(),
                user: "maas".to_string(),
                password: "s3cret".to_string(),
                primary: DbEndpoint {
                    host: "10.0.0.5".to_string(),
                    port: 5432,
                },
                standby: Vec::new(),
            },
            mode: OperatingMode::Region,
            tls: TlsConfig {
                mode: TlsMode::Disabled,
                material: None,
            },
            tracing_endpoint: None,
            object_storage: None,
        }
    }

    #[test]
    fn test_regiond_conf_contents() {
        let artifacts = YamlRenderer.render(&service()).unwrap();
        assert_eq!(artifacts.len(), 1);
        let conf: serde_yaml::Value = serde_yaml::from_str(&artifacts[0].contents).unwrap();
        assert_eq!(conf["maas_url"], "http://10.0.0.10:5240/MAAS");
        assert_eq!(conf["database_port"], 5432);
        assert_eq!(conf["operating_mode"], "region");
        assert!(conf.get("tracing_endpoint").is_none());
        assert_eq!(artifacts[0].mode, 0o600);
    }

    #[test]
    fn test_tracing_endpoint_rendered() {
        let mut service = service();
        service.tracing_endpoint = Some("http://tempo:4318".to_string());
        let artifacts = YamlRenderer.render(&service).unwrap();
        assert!(artifacts[0].contents.contains("tracing_endpoint: http://tempo:4318"));
    }

    #[test]
    fn test_passthrough_renders_pem_files() {
        let mut service = service();
        service.tls = TlsConfig {
            mode: TlsMode::Passthrough,
            material: Some(TlsMaterial {
                cert: "CERT".to_string(),
                key: "KEY\n\n".to_string(),
                cacert: None,
            }),
        };
        let artifacts = YamlRenderer.render(&service).unwrap();
        let paths: Vec<_> = artifacts.iter().map(|a| a.path.clone()).collect();
        assert_eq!(
            paths,
            vec![PathBuf::from(REGIOND_CONF), TLS_CERT.into(), TLS_KEY.into()]
        );
        assert_eq!(artifacts[2].contents, "KEY\n");

        let files = tls_files(Path::new("/conf"), &paths).unwrap();
        assert_eq!(files.key, PathBuf::from("/conf/maas-key.pem"));
        assert!(files.cacert.is_none());
    }

    #[test]
    fn test_object_storage_owner_only() {
        let mut service = service();
        service.object_storage = Some(ObjectStorage {
            bucket: "backups".to_string(),
            region: "eu-west-1".to_string(),
            endpoint: "https://s3.example.com".to_string(),
            access_key: "AK".to_string(),
            secret_key: "SK".to_string(),
            path: String::new(),
            tls_ca_chain: None,
        });
        let artifacts = YamlRenderer.render(&service).unwrap();
        let storage = artifacts.last().unwrap();
        assert_eq!(storage.path, PathBuf::from(OBJECT_STORAGE_CONF));
        assert!(storage.contents.contains("secret-key: SK"));
        assert_eq!(storage.mode, 0o600);
    }
}
