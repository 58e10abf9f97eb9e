//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use maas_operator_reconciler::{
    ActionError, ActionOutput, ActionRequest, Event, Handled, RelationRef, Status,
};
use serde::Serialize;
use thiserror::Error;

/// maas-operator - reconcile a MAAS region controller unit
#[derive(Parser, Debug)]
#[command(name = "maas-operator")]
#[command(version)]
#[command(about = "Event-driven reconciliation controller for MAAS region controllers")]
#[command(
    long_about = "Handles lifecycle events for one MAAS region unit: derives the desired configuration from relations and options, writes it atomically, restarts the service only on change and carries out leader-only duties."
)]
pub struct Cli {
    /// Operator config file (defaults to /etc/maas-operator/config.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Handle a single lifecycle event and print the resulting status
    Handle {
        /// Event kind
        #[arg(short, long, value_enum)]
        event: EventKind,

        /// Relation endpoint, for relation events
        #[arg(long)]
        relation: Option<String>,

        /// Relation id, for relation events
        #[arg(long)]
        relation_id: Option<u32>,

        /// Remote unit the relation event concerns
        #[arg(long)]
        unit: Option<String>,
    },

    /// Run an action and print its result as JSON
    Action {
        /// Action name, e.g. create-admin
        name: String,

        /// Action parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Read JSON events from stdin, one per line, and handle them in order
    Run,

    /// Print the artifacts the current inputs would produce, without writing
    Render,
}

/// Lifecycle event kinds accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventKind {
    Install,
    ConfigChanged,
    RelationJoined,
    RelationChanged,
    RelationDeparted,
    RelationBroken,
    LeaderElected,
    Upgrade,
    UpdateStatus,
    Remove,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("relation events need --relation and --relation-id")]
    MissingRelation,

    #[error("--relation, --relation-id and --unit only apply to relation events")]
    UnexpectedRelation,
}

impl EventKind {
    const fn is_relation(self) -> bool {
        matches!(
            self,
            Self::RelationJoined
                | Self::RelationChanged
                | Self::RelationDeparted
                | Self::RelationBroken
        )
    }
}

/// Build the event described by the `handle` arguments.
///
/// # Errors
///
/// Returns `CliError` when relation arguments are missing for a relation
/// event or given for any other.
pub fn build_event(
    kind: EventKind,
    relation: Option<String>,
    relation_id: Option<u32>,
    unit: Option<String>,
) -> Result<Event, CliError> {
    if !kind.is_relation() {
        if relation.is_some() || relation_id.is_some() || unit.is_some() {
            return Err(CliError::UnexpectedRelation);
        }
        return Ok(match kind {
            EventKind::Install => Event::Install,
            EventKind::ConfigChanged => Event::ConfigChanged,
            EventKind::LeaderElected => Event::LeaderElected,
            EventKind::Upgrade => Event::Upgrade,
            EventKind::Remove => Event::Remove,
            _ => Event::UpdateStatus,
        });
    }

    let (Some(endpoint), Some(id)) = (relation, relation_id) else {
        return Err(CliError::MissingRelation);
    };
    let mut rel = RelationRef::new(endpoint, id);
    rel.unit = unit;
    Ok(match kind {
        EventKind::RelationJoined => Event::RelationJoined(rel),
        EventKind::RelationChanged => Event::RelationChanged(rel),
        EventKind::RelationDeparted => Event::RelationDeparted(rel),
        _ => Event::RelationBroken(rel),
    })
}

/// Build an action request from `action` arguments.
#[must_use]
pub fn build_action(name: String, params: Vec<(String, String)>) -> ActionRequest {
    params
        .into_iter()
        .fold(ActionRequest::new(name), |req, (k, v)| req.with_param(k, v))
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// JSON shape printed for each handled event.
#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub status: &'a Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<&'a ActionOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a ActionError>,
}

impl<'a> From<&'a Handled> for Report<'a> {
    fn from(handled: &'a Handled) -> Self {
        let (output, error) = match &handled.action {
            Some(Ok(output)) => (Some(output), None),
            Some(Err(error)) => (None, Some(error)),
            None => (None, None),
        };
        Self {
            status: &handled.status,
            output,
            error,
        }
    }
}
