//! Raw inputs observed from the orchestration runtime and the workload.
//!
//! Everything here is loosely typed on purpose: relation data arrives as
//! string maps and option values as untyped scalars. The reconciler
//! validates these into strongly typed desired state at its boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// A single key/value data bag on a relation.
pub type DataBag = BTreeMap<String, String>;

/// A configuration option value as delivered by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Named configuration options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigOptions(BTreeMap<String, OptionValue>);

impl ConfigOptions {
    /// Create an empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set an option in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw access to an option.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    /// Read a string option. Empty strings read as unset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOption` if the option holds a non-string value.
    pub fn string(&self, key: &str) -> Result<Option<&str>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(OptionValue::Str(s)) if s.trim().is_empty() => Ok(None),
            Some(OptionValue::Str(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(Error::invalid_option(
                key,
                format!("expected a string, got {other:?}"),
            )),
        }
    }

    /// Read a boolean option. Accepts the strings `true`/`false` too.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOption` if the value cannot be read as a boolean.
    pub fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(OptionValue::Bool(b)) => Ok(Some(*b)),
            Some(OptionValue::Str(s)) => s
                .trim()
                .parse::<bool>()
                .map(Some)
                .map_err(|e| Error::invalid_option(key, e.to_string())),
            Some(OptionValue::Int(i)) => Err(Error::invalid_option(
                key,
                format!("expected a boolean, got {i}"),
            )),
        }
    }

    /// Read an integer option.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOption` if the value cannot be read as an integer.
    pub fn int(&self, key: &str) -> Result<Option<i64>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(OptionValue::Int(i)) => Ok(Some(*i)),
            Some(OptionValue::Str(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|e| Error::invalid_option(key, e.to_string())),
            Some(OptionValue::Bool(b)) => Err(Error::invalid_option(
                key,
                format!("expected an integer, got {b}"),
            )),
        }
    }
}

/// Whether a relation is still established.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Liveness {
    #[default]
    Joined,
    Departed,
}

/// One integrated remote application as seen during a single event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRecord {
    /// Runtime-assigned relation id.
    pub id: u32,
    /// Local endpoint name the relation is bound to.
    pub endpoint: String,
    /// Interface name.
    pub interface: String,
    /// Remote application name.
    pub remote_app: String,
    /// Application-scoped data published by the remote side.
    #[serde(default)]
    pub app_data: DataBag,
    /// Unit-scoped data, keyed by remote unit name.
    #[serde(default)]
    pub units: BTreeMap<String, DataBag>,
    #[serde(default)]
    pub liveness: Liveness,
}

impl RelationRecord {
    /// Create a joined relation without data.
    pub fn new(
        id: u32,
        endpoint: impl Into<String>,
        interface: impl Into<String>,
        remote_app: impl Into<String>,
    ) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            interface: interface.into(),
            remote_app: remote_app.into(),
            app_data: DataBag::new(),
            units: BTreeMap::new(),
            liveness: Liveness::Joined,
        }
    }

    /// Builder-style application data setter.
    #[must_use]
    pub fn with_app_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.app_data.insert(key.into(), value.into());
        self
    }

    /// Builder-style unit data setter.
    #[must_use]
    pub fn with_unit_data(
        mut self,
        unit: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.units
            .entry(unit.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Mark the relation as departed.
    #[must_use]
    pub const fn departed(mut self) -> Self {
        self.liveness = Liveness::Departed;
        self
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.liveness == Liveness::Joined
    }

    /// Non-empty application value for `key`.
    #[must_use]
    pub fn app_value(&self, key: &str) -> Option<&str> {
        self.app_data
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// First non-empty unit value for `key`, in unit-name order.
    #[must_use]
    pub fn first_unit_value(&self, key: &str) -> Option<&str> {
        self.units
            .values()
            .filter_map(|bag| bag.get(key))
            .map(String::as_str)
            .find(|v| !v.trim().is_empty())
    }
}

/// Snapshot of everything the runtime tells us for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Local unit name, e.g. `maas-region/0`.
    pub unit: String,
    /// Local application name.
    pub app: String,
    /// Fully qualified host name of this machine.
    pub hostname: String,
    /// Address the workload should bind to, if the runtime knows it.
    #[serde(default)]
    pub bind_address: Option<String>,
    #[serde(default)]
    pub is_leader: bool,
    #[serde(default)]
    pub config: ConfigOptions,
    #[serde(default)]
    pub relations: Vec<RelationRecord>,
}

impl Observation {
    /// Create an observation with no config and no relations.
    pub fn new(
        unit: impl Into<String>,
        app: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            unit: unit.into(),
            app: app.into(),
            hostname: hostname.into(),
            bind_address: None,
            is_leader: false,
            config: ConfigOptions::new(),
            relations: Vec::new(),
        }
    }

    /// Live relations on `endpoint`, lowest id first.
    pub fn relations_on<'a>(
        &'a self,
        endpoint: &'a str,
    ) -> impl Iterator<Item = &'a RelationRecord> + 'a {
        use itertools::Itertools;

        self.relations
            .iter()
            .filter(move |r| r.endpoint == endpoint && r.is_live())
            .sorted_by_key(|r| r.id)
    }

    /// The lowest-id live relation on `endpoint`.
    #[must_use]
    pub fn relation<'a>(&'a self, endpoint: &'a str) -> Option<&'a RelationRecord> {
        self.relations_on(endpoint).next()
    }
}

/// Facts read from the installed workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadFacts {
    /// Channel the workload package is installed from, `None` if absent.
    pub installed_channel: Option<String>,
    pub version: Option<String>,
    /// Token agents use to enroll against this region.
    pub enrollment_secret: Option<String>,
    /// Deployment UUID, available once initialised.
    pub uuid: Option<String>,
    /// Whether TLS is currently served, `None` if not yet initialised.
    pub tls_enabled: Option<bool>,
}

impl WorkloadFacts {
    #[must_use]
    pub const fn is_installed(&self) -> bool {
        self.installed_channel.is_some()
    }
}
