//! Operator configuration loading and management
//!
//! # Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//! 1. Built-in defaults
//! 2. TOML file: explicit path, or `/etc/maas-operator/config.toml` if present
//! 3. Environment variables: `MAAS_OPERATOR_*`
//!
//! # Example Config
//!
//! ```toml
//! config_dir = "/var/snap/maas/current"
//! snap_channel = "3.6/stable"
//! endpoint_precedence = ["config-override", "proxy", "direct"]
//!
//! [timeouts]
//! restart_ms = 60000
//! transfer_ms = 3600000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// Default location of the operator's own config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/maas-operator/config.toml";

/// Where the externally reachable API endpoint may come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointSource {
    /// The `maas_url` option set by the operator.
    ConfigOverride,
    /// The public address offered by a reverse-proxy relation.
    Proxy,
    /// This machine's bind address.
    Direct,
}

impl std::str::FromStr for EndpointSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "config-override" => Ok(Self::ConfigOverride),
            "proxy" => Ok(Self::Proxy),
            "direct" => Ok(Self::Direct),
            other => Err(Error::invalid_config(format!(
                "unknown endpoint source '{other}' (expected config-override, proxy or direct)"
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION STRUCTURES
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OperatorConfig {
    /// Directory the rendered artifacts are written to.
    pub config_dir: PathBuf,
    /// File name of the applied-state marker inside `config_dir`.
    pub state_file: String,
    /// Directory the file-backed runtime adaptor exchanges data through.
    pub runtime_dir: PathBuf,
    /// Workload administration binary.
    pub workload_bin: PathBuf,
    /// Package channel the workload is installed from.
    pub snap_channel: String,
    /// Command that restarts the supervised service.
    pub restart_command: Vec<String>,
    /// Command that stops the supervised service.
    pub stop_command: Vec<String>,
    pub timeouts: TimeoutConfig,
    pub ports: PortConfig,
    /// API endpoint precedence, first match wins.
    pub endpoint_precedence: Vec<EndpointSource>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub observe_ms: u64,
    pub command_ms: u64,
    pub restart_ms: u64,
    /// Bound on one backup upload or download.
    pub transfer_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortConfig {
    pub http: u16,
    pub https: u16,
    pub proxy: u16,
}

// ═══════════════════════════════════════════════════════════════════════════
// DEFAULT IMPLEMENTATIONS
// ═══════════════════════════════════════════════════════════════════════════

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/var/snap/maas/current"),
            state_file: "applied-state.json".to_string(),
            runtime_dir: PathBuf::from("/var/lib/maas-operator"),
            workload_bin: PathBuf::from("/snap/bin/maas"),
            snap_channel: "3.6/stable".to_string(),
            restart_command: vec!["snap".to_string(), "restart".to_string(), "maas".to_string()],
            stop_command: vec!["snap".to_string(), "stop".to_string(), "maas".to_string()],
            timeouts: TimeoutConfig::default(),
            ports: PortConfig::default(),
            endpoint_precedence: vec![
                EndpointSource::ConfigOverride,
                EndpointSource::Proxy,
                EndpointSource::Direct,
            ],
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            observe_ms: 10_000,
            command_ms: 120_000,
            restart_ms: 60_000,
            transfer_ms: 3_600_000,
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            http: 5240,
            https: 5443,
            proxy: 80,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub const fn observe(&self) -> Duration {
        Duration::from_millis(self.observe_ms)
    }

    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    #[must_use]
    pub const fn restart(&self) -> Duration {
        Duration::from_millis(self.restart_ms)
    }

    #[must_use]
    pub const fn transfer(&self) -> Duration {
        Duration::from_millis(self.transfer_ms)
    }
}

impl OperatorConfig {
    /// Absolute path of the applied-state marker.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.config_dir.join(&self.state_file)
    }

    /// Load configuration from all sources with hierarchy.
    ///
    /// An explicit `path` must exist; the default path is optional.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The config file cannot be read or is malformed TOML
    /// - An environment override cannot be parsed
    /// - The merged values fail validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(explicit) => load_toml_file(explicit)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    load_toml_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        tracing::debug!(config_dir = %config.config_dir.display(), "operator configuration loaded");
        Ok(config)
    }

    /// Apply `MAAS_OPERATOR_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a numeric or list override does not parse.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("MAAS_OPERATOR_CONFIG_DIR") {
            self.config_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("MAAS_OPERATOR_RUNTIME_DIR") {
            self.runtime_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("MAAS_OPERATOR_WORKLOAD_BIN") {
            self.workload_bin = PathBuf::from(value);
        }
        if let Some(value) = lookup("MAAS_OPERATOR_SNAP_CHANNEL") {
            self.snap_channel = value;
        }
        if let Some(value) = lookup("MAAS_OPERATOR_RESTART_COMMAND") {
            self.restart_command = value.split_whitespace().map(String::from).collect();
        }
        if let Some(value) = lookup("MAAS_OPERATOR_COMMAND_TIMEOUT_MS") {
            self.timeouts.command_ms = value.parse().map_err(|e| {
                Error::invalid_config(format!("Invalid MAAS_OPERATOR_COMMAND_TIMEOUT_MS value: {e}"))
            })?;
        }
        if let Some(value) = lookup("MAAS_OPERATOR_RESTART_TIMEOUT_MS") {
            self.timeouts.restart_ms = value.parse().map_err(|e| {
                Error::invalid_config(format!("Invalid MAAS_OPERATOR_RESTART_TIMEOUT_MS value: {e}"))
            })?;
        }
        if let Some(value) = lookup("MAAS_OPERATOR_TRANSFER_TIMEOUT_MS") {
            self.timeouts.transfer_ms = value.parse().map_err(|e| {
                Error::invalid_config(format!("Invalid MAAS_OPERATOR_TRANSFER_TIMEOUT_MS value: {e}"))
            })?;
        }
        if let Some(value) = lookup("MAAS_OPERATOR_ENDPOINT_PRECEDENCE") {
            self.endpoint_precedence = value
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect::<Result<Vec<_>>>()?;
        }
        Ok(())
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_precedence.is_empty() {
            return Err(Error::invalid_config("endpoint_precedence must not be empty"));
        }
        if !self.endpoint_precedence.iter().all_unique() {
            return Err(Error::invalid_config(
                "endpoint_precedence must not list a source twice",
            ));
        }
        if self.restart_command.is_empty() || self.stop_command.is_empty() {
            return Err(Error::invalid_config(
                "restart_command and stop_command must not be empty",
            ));
        }
        if self.timeouts.observe_ms == 0
            || self.timeouts.command_ms == 0
            || self.timeouts.restart_ms == 0
            || self.timeouts.transfer_ms == 0
        {
            return Err(Error::invalid_config("timeouts must be greater than zero"));
        }
        if self.ports.http == self.ports.https {
            return Err(Error::invalid_config("http and https ports must differ"));
        }
        if self.state_file.trim().is_empty() || self.state_file.contains('/') {
            return Err(Error::invalid_config(
                "state_file must be a plain file name",
            ));
        }
        Ok(())
    }
}

/// Load a TOML file; missing keys fall back to defaults.
///
/// # Errors
///
/// Returns error if:
/// - File cannot be read
/// - TOML is malformed
fn load_toml_file(path: &Path) -> Result<OperatorConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::file_read_failed(path, e.to_string()))?;

    toml::from_str(&content).map_err(|e| Error::toml_parse_failed(path, e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(OperatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "snap_channel = \"3.5/stable\"\n[timeouts]\nrestart_ms = 500\n",
        )
        .unwrap();

        let config = OperatorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.snap_channel, "3.5/stable");
        assert_eq!(config.timeouts.restart_ms, 500);
        assert_eq!(config.timeouts.command_ms, 120_000);
        assert_eq!(config.ports.http, 5240);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = OperatorConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(Error::FileReadFailed { .. })));
    }

    #[test]
    fn test_malformed_toml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "config_dir = [").unwrap();
        let result = OperatorConfig::load(Some(&path));
        assert!(matches!(result, Err(Error::TomlParseFailed { .. })));
    }

    #[test]
    fn test_env_overrides_precedence() {
        let mut config = OperatorConfig::default();
        config
            .apply_env(env(&[("MAAS_OPERATOR_ENDPOINT_PRECEDENCE", "direct, proxy")]))
            .unwrap();
        assert_eq!(
            config.endpoint_precedence,
            vec![EndpointSource::Direct, EndpointSource::Proxy]
        );
    }

    #[test]
    fn test_env_rejects_bad_timeout() {
        let mut config = OperatorConfig::default();
        let result = config.apply_env(env(&[("MAAS_OPERATOR_COMMAND_TIMEOUT_MS", "soon")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_env_sets_transfer_timeout() {
        let mut config = OperatorConfig::default();
        config
            .apply_env(env(&[("MAAS_OPERATOR_TRANSFER_TIMEOUT_MS", "90000")]))
            .unwrap();
        assert_eq!(config.timeouts.transfer(), Duration::from_secs(90));
    }

    #[test]
    fn test_zero_transfer_timeout_fails_validation() {
        let mut config = OperatorConfig::default();
        config.timeouts.transfer_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_rejects_unknown_source() {
        let mut config = OperatorConfig::default();
        let result = config.apply_env(env(&[("MAAS_OPERATOR_ENDPOINT_PRECEDENCE", "dns")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_precedence_fails_validation() {
        let config = OperatorConfig {
            endpoint_precedence: vec![EndpointSource::Proxy, EndpointSource::Proxy],
            ..OperatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_state_file_must_be_plain_name() {
        let config = OperatorConfig {
            state_file: "../escape.json".to_string(),
            ..OperatorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
