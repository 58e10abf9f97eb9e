//! Integration tests for convergence of the service configuration.
//!
//! These tests verify that:
//! - Repeating an event with unchanged inputs does nothing
//! - Nothing is written until required inputs are present
//! - A failed apply leaves the previous artifacts and applied state intact
//! - Files written before a failed restart are rewritten on the next pass
//! - Stalled collaborators surface as a status instead of hanging

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, bare, database, ready};
use maas_operator_reconciler::desired::{ServiceConfig, endpoints, options};
use maas_operator_reconciler::{
    Artifact, Error, Event, RelationRef, Render, Result, Status, YamlRenderer,
};

/// Test that handling the same event twice restarts the service once.
///
/// # GIVEN
/// A unit with a complete database relation
///
/// # WHEN
/// `config-changed` is handled twice with unchanged inputs
///
/// # THEN
/// Artifacts are byte-identical and there is exactly one restart
#[tokio::test]
async fn test_repeated_event_is_idempotent() {
    let mut h = Harness::new(ready());

    let first = h.reconciler.handle(Event::ConfigChanged).await;
    assert_eq!(first.status, Status::active());
    let conf = h.read("regiond.conf").expect("regiond.conf written");
    let applied = h.reconciler.applied().clone();

    let second = h.reconciler.handle(Event::ConfigChanged).await;
    assert_eq!(second.status, Status::active());
    assert_eq!(h.read("regiond.conf").as_deref(), Some(conf.as_str()));
    assert_eq!(h.reconciler.applied(), &applied);
    assert_eq!(h.supervisor.restarts().await, 1);
}

/// Test that the applied marker survives a process restart.
#[tokio::test]
async fn test_marker_prevents_restart_in_new_process() {
    let mut h = Harness::new(ready());
    h.reconciler.handle(Event::ConfigChanged).await;

    h.restart_process();
    let handled = h.reconciler.handle(Event::UpdateStatus).await;

    assert!(handled.status.is_active());
    assert_eq!(h.supervisor.restarts().await, 1);
}

/// Test that a unit stays blocked and untouched until the database appears.
///
/// # GIVEN
/// A unit without a database relation
///
/// # WHEN
/// Several events arrive, then the database relation is joined
///
/// # THEN
/// Nothing is written while blocked, then exactly one restart happens
#[tokio::test]
async fn test_blocked_until_database_ready() {
    let mut h = Harness::new(bare());

    for event in [Event::Install, Event::ConfigChanged, Event::UpdateStatus] {
        let handled = h.reconciler.handle(event).await;
        assert_eq!(
            handled.status,
            Status::Blocked("waiting for database".to_string())
        );
    }
    assert!(h.file_names().is_empty());
    assert_eq!(h.supervisor.restarts().await, 0);

    h.runtime
        .update(|obs| {
            obs.relations.push(
                maas_operator_core::RelationRecord::new(
                    1,
                    endpoints::DATABASE,
                    "postgresql_client",
                    "postgresql",
                )
                .with_app_data("username", "maas"),
            );
        })
        .await;
    let partial = h
        .reconciler
        .handle(Event::RelationChanged(RelationRef::new(endpoints::DATABASE, 1)))
        .await;
    assert_eq!(
        partial.status,
        Status::Blocked("waiting for database credentials".to_string())
    );
    assert!(h.file_names().is_empty());

    h.runtime
        .update(|obs| {
            obs.relations.clear();
            obs.relations.push(database());
        })
        .await;
    let joined = h
        .reconciler
        .handle(Event::RelationChanged(RelationRef::new(endpoints::DATABASE, 1)))
        .await;
    assert!(joined.status.is_active());
    assert_eq!(h.supervisor.restarts().await, 1);

    h.reconciler.handle(Event::UpdateStatus).await;
    assert_eq!(h.supervisor.restarts().await, 1);
}

/// Test that a changed input is applied and stale artifacts are removed.
#[tokio::test]
async fn test_changed_input_rewrites_and_prunes() {
    let mut h = Harness::new(ready());
    h.runtime
        .update(|obs| {
            obs.config.set(options::TLS_MODE, "passthrough");
            obs.config.set(options::SSL_CERT, "CERT");
            obs.config.set(options::SSL_KEY, "KEY");
        })
        .await;
    h.reconciler.handle(Event::ConfigChanged).await;
    assert!(h.read("maas-key.pem").is_some());

    h.runtime
        .update(|obs| obs.config.set(options::TLS_MODE, "disabled"))
        .await;
    let handled = h.reconciler.handle(Event::ConfigChanged).await;

    assert!(handled.status.is_active());
    assert!(h.read("maas-key.pem").is_none());
    assert!(h.read("maas-cert.pem").is_none());
    assert!(h.read("regiond.conf").unwrap().contains("tls_mode: disabled"));
    assert_eq!(h.supervisor.restarts().await, 2);
}

/// Renders once, then fails on every later call.
struct FailAfterFirst {
    calls: std::sync::atomic::AtomicUsize,
}

impl Render for FailAfterFirst {
    fn render(&self, service: &ServiceConfig) -> Result<Vec<Artifact>> {
        let call = self
            .calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if call == 0 {
            YamlRenderer.render(service)
        } else {
            Err(Error::render("regiond.conf", "template exploded"))
        }
    }
}

/// Test that a render failure leaves the previous artifact byte-identical.
///
/// # GIVEN
/// A unit that has applied its configuration once
///
/// # WHEN
/// The configuration changes and rendering fails
///
/// # THEN
/// The old artifact is untouched, the applied state is unchanged and the
/// status is Error
#[tokio::test]
async fn test_render_failure_is_atomic() {
    let renderer = Arc::new(FailAfterFirst {
        calls: std::sync::atomic::AtomicUsize::new(0),
    });
    let mut h = Harness::with_renderer(ready(), renderer);
    h.reconciler.handle(Event::ConfigChanged).await;
    let before = h.read("regiond.conf").expect("first render written");
    let applied = h.reconciler.applied().clone();

    h.runtime
        .update(|obs| obs.config.set(options::MAAS_URL, "http://maas.example.com/MAAS"))
        .await;
    let handled = h.reconciler.handle(Event::ConfigChanged).await;

    assert!(matches!(handled.status, Status::Error(ref m) if m.contains("template exploded")));
    assert_eq!(h.read("regiond.conf"), Some(before));
    assert_eq!(h.reconciler.applied(), &applied);
    assert_eq!(h.supervisor.restarts().await, 1);
}

/// Test that a failed restart is retried on the next event.
#[tokio::test]
async fn test_restart_failure_retries_next_event() {
    let mut h = Harness::new(ready());
    h.supervisor.state().await.fail = true;

    let failed = h.reconciler.handle(Event::ConfigChanged).await;
    assert!(matches!(failed.status, Status::Error(_)));
    assert!(!h.reconciler.applied().is_service_applied());

    h.supervisor.state().await.fail = false;
    let recovered = h.reconciler.handle(Event::UpdateStatus).await;
    assert!(recovered.status.is_active());
    assert_eq!(h.supervisor.restarts().await, 1);
}

/// Test that reverting an input after a failed restart rewrites the files.
///
/// # GIVEN
/// A unit that has applied its configuration once
///
/// # WHEN
/// `maas_url` changes while restarts fail, then reverts once restarts work
///
/// # THEN
/// The file on disk carries the reverted value, not the one from the
/// failed pass, and the service is restarted for it
#[tokio::test]
async fn test_revert_after_failed_restart_rewrites_files() {
    let mut h = Harness::new(ready());
    h.reconciler.handle(Event::ConfigChanged).await;
    assert!(h.read("regiond.conf").unwrap().contains("http://10.0.0.10:5240/MAAS"));

    h.supervisor.state().await.fail = true;
    h.runtime
        .update(|obs| obs.config.set(options::MAAS_URL, "https://changed.example.com/MAAS"))
        .await;
    let failed = h.reconciler.handle(Event::ConfigChanged).await;
    assert!(matches!(failed.status, Status::Error(_)));
    assert!(h.read("regiond.conf").unwrap().contains("changed.example.com"));
    assert!(!h.reconciler.applied().is_service_applied());

    h.supervisor.state().await.fail = false;
    h.runtime.set_observation(ready()).await;
    let reverted = h.reconciler.handle(Event::ConfigChanged).await;

    assert!(reverted.status.is_active());
    let conf = h.read("regiond.conf").unwrap();
    assert!(conf.contains("http://10.0.0.10:5240/MAAS"));
    assert!(!conf.contains("changed.example.com"));
    assert_eq!(h.supervisor.restarts().await, 2);
}

/// Test that a failed restart survives a process restart as unapplied.
#[tokio::test]
async fn test_failed_restart_is_remembered_across_processes() {
    let mut h = Harness::new(ready());
    h.reconciler.handle(Event::ConfigChanged).await;

    h.supervisor.state().await.fail = true;
    h.runtime
        .update(|obs| obs.config.set(options::MAAS_URL, "https://changed.example.com/MAAS"))
        .await;
    h.reconciler.handle(Event::ConfigChanged).await;

    h.supervisor.state().await.fail = false;
    h.runtime.set_observation(ready()).await;
    h.restart_process();
    assert!(!h.reconciler.applied().is_service_applied());
    assert!(
        h.reconciler
            .applied()
            .artifacts
            .iter()
            .any(|p| p.ends_with("regiond.conf"))
    );

    h.reconciler.handle(Event::UpdateStatus).await;
    assert!(!h.read("regiond.conf").unwrap().contains("changed.example.com"));
}

/// Test that the installed workload version is reported to the runtime.
#[tokio::test]
async fn test_workload_version_is_reported() {
    let mut h = Harness::new(bare());
    h.reconciler.handle(Event::UpdateStatus).await;
    assert_eq!(h.runtime.workload_version().await.as_deref(), Some("3.6"));
}

/// Test that a stalled runtime reports Waiting rather than hanging.
#[tokio::test(start_paused = true)]
async fn test_observe_timeout_is_waiting() {
    let mut h = Harness::new(ready());
    h.runtime.state().await.observe_delay = Some(Duration::from_secs(3600));

    let handled = h.reconciler.handle(Event::UpdateStatus).await;

    assert!(matches!(handled.status, Status::Waiting(ref m) if m.contains("runtime")));
    assert!(h.file_names().is_empty());
}

/// Test that a stalled restart reports Error and records nothing.
#[tokio::test(start_paused = true)]
async fn test_restart_timeout_is_error() {
    let mut h = Harness::new(ready());
    h.supervisor.state().await.delay = Some(Duration::from_secs(3600));

    let handled = h.reconciler.handle(Event::ConfigChanged).await;

    assert!(matches!(handled.status, Status::Error(ref m) if m.contains("restart")));
    assert!(!h.reconciler.applied().is_service_applied());
}

/// Test that a broken database relation blocks the unit again.
#[tokio::test]
async fn test_relation_broken_blocks() {
    let mut h = Harness::new(ready());
    h.reconciler.handle(Event::ConfigChanged).await;

    let handled = h
        .reconciler
        .handle(Event::RelationBroken(RelationRef::new(endpoints::DATABASE, 1)))
        .await;

    assert_eq!(
        handled.status,
        Status::Blocked("waiting for database".to_string())
    );
}

/// Test that a bad option blocks with a message naming it.
#[tokio::test]
async fn test_invalid_option_blocks() {
    let mut h = Harness::new(ready());
    h.runtime
        .update(|obs| obs.config.set(options::TLS_MODE, "mutual"))
        .await;

    let handled = h.reconciler.handle(Event::ConfigChanged).await;

    assert!(matches!(handled.status, Status::Blocked(ref m) if m.contains("tls_mode")));
    assert!(h.file_names().is_empty());
}

/// Test that incomplete object storage reports Waiting after applying the rest.
#[tokio::test]
async fn test_partial_object_storage_waits() {
    let mut h = Harness::new(ready());
    h.runtime
        .update(|obs| {
            obs.relations.push(
                maas_operator_core::RelationRecord::new(
                    4,
                    endpoints::OBJECT_STORAGE,
                    "s3",
                    "s3-integrator",
                )
                .with_app_data("bucket", "backups"),
            );
        })
        .await;

    let handled = h.reconciler.handle(Event::ConfigChanged).await;

    assert_eq!(
        handled.status,
        Status::Waiting("waiting for object storage credentials".to_string())
    );
    assert!(h.read("regiond.conf").is_some());
    assert!(h.read("object-storage.yaml").is_none());
}
