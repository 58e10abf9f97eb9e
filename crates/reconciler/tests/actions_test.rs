//! Integration tests for operator actions.
//!
//! These tests verify that:
//! - Invalid requests are rejected before anything runs
//! - Preconditions are enforced with descriptive errors
//! - Actions never change reconciler state or status

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::indexing_slicing)]

mod common;

use common::{Harness, controller, peers, ready};
use maas_operator_reconciler::desired::options;
use maas_operator_reconciler::{ActionError, ActionRequest, Event, Handled};

fn create_admin() -> ActionRequest {
    ActionRequest::new("create-admin")
        .with_param("username", "admin")
        .with_param("password", "hunter2")
        .with_param("email", "admin@example.com")
}

fn action_result(handled: Handled) -> Result<std::collections::BTreeMap<String, String>, ActionError> {
    handled.action.expect("action events carry a result")
}

/// Test that a missing required parameter is rejected without side effects.
///
/// # GIVEN
/// A configured leader
///
/// # WHEN
/// `create-admin` is invoked without an email
///
/// # THEN
/// An error names the parameter and nothing changes
#[tokio::test]
async fn test_missing_parameter_changes_nothing() {
    let mut obs = ready();
    obs.is_leader = true;
    let mut h = Harness::new(obs);
    h.reconciler.handle(Event::ConfigChanged).await;
    let applied = h.reconciler.applied().clone();
    let status = h.reconciler.status().clone();
    let calls = h.workload.calls().await;

    let request = ActionRequest::new("create-admin")
        .with_param("username", "admin")
        .with_param("password", "hunter2");
    let handled = h.reconciler.handle(Event::ActionInvoked(request)).await;

    assert_eq!(handled.status, status);
    assert_eq!(
        action_result(handled),
        Err(ActionError::MissingParameter {
            action: "create-admin".to_string(),
            parameter: "email".to_string(),
        })
    );
    assert_eq!(h.reconciler.applied(), &applied);
    assert_eq!(h.reconciler.status(), &status);
    assert_eq!(h.workload.calls().await, calls);
}

#[tokio::test]
async fn test_unknown_action() {
    let mut h = Harness::new(ready());
    let handled = h
        .reconciler
        .handle(Event::ActionInvoked(ActionRequest::new("reboot")))
        .await;
    assert!(matches!(action_result(handled), Err(ActionError::Unknown { .. })));
}

/// Test that admin creation waits for the service to be configured.
#[tokio::test]
async fn test_create_admin_requires_configured_service() {
    let mut obs = ready();
    obs.is_leader = true;
    let mut h = Harness::new(obs);

    let handled = h.reconciler.handle(Event::ActionInvoked(create_admin())).await;

    assert!(matches!(action_result(handled), Err(ActionError::Precondition { .. })));
    assert!(h.workload.state().await.admins.is_empty());
}

#[tokio::test]
async fn test_create_admin_requires_leader() {
    let mut h = Harness::new(ready());
    h.reconciler.handle(Event::ConfigChanged).await;

    let handled = h.reconciler.handle(Event::ActionInvoked(create_admin())).await;

    let err = action_result(handled).unwrap_err();
    assert!(err.to_string().contains("leader"));
}

/// Test the happy path for admin creation and key retrieval.
#[tokio::test]
async fn test_create_admin_then_fetch_key() {
    let mut obs = ready();
    obs.is_leader = true;
    let mut h = Harness::new(obs);
    h.reconciler.handle(Event::ConfigChanged).await;

    let created = action_result(h.reconciler.handle(Event::ActionInvoked(create_admin())).await)
        .expect("admin created");
    assert_eq!(created["info"], "user admin successfully created");

    let request = ActionRequest::new("get-api-key").with_param("username", "admin");
    let key = action_result(h.reconciler.handle(Event::ActionInvoked(request)).await)
        .expect("key returned");
    assert_eq!(key["api-key"], "key-admin");
}

#[tokio::test]
async fn test_workload_failure_is_reported() {
    let mut obs = ready();
    obs.is_leader = true;
    let mut h = Harness::new(obs);
    h.reconciler.handle(Event::ConfigChanged).await;

    let request = ActionRequest::new("get-api-key").with_param("username", "nobody");
    let handled = h.reconciler.handle(Event::ActionInvoked(request)).await;

    assert!(matches!(action_result(handled), Err(ActionError::Failed { .. })));
}

/// Test that controllers are listed as JSON arrays.
#[tokio::test]
async fn test_list_controllers() {
    let mut obs = ready();
    obs.relations.push(peers(&[
        ("maas-region/2", "region-2.maas"),
        ("maas-region/1", "region-1.maas"),
    ]));
    obs.relations.push(controller());
    let mut h = Harness::new(obs);

    let output = action_result(
        h.reconciler
            .handle(Event::ActionInvoked(ActionRequest::new("list-controllers")))
            .await,
    )
    .expect("controllers listed");

    assert_eq!(
        output["regions"],
        r#"["region-0.maas","region-1.maas","region-2.maas"]"#
    );
    assert_eq!(output["agents"], r#"["maas-agent/0"]"#);
}

#[tokio::test]
async fn test_get_api_endpoint_follows_precedence() {
    let mut obs = ready();
    obs.config.set(options::MAAS_URL, "https://maas.example.com/MAAS");
    let mut h = Harness::new(obs);

    let output = action_result(
        h.reconciler
            .handle(Event::ActionInvoked(ActionRequest::new("get-api-endpoint")))
            .await,
    )
    .expect("endpoint resolved");

    assert_eq!(output["api-url"], "https://maas.example.com/MAAS");
}

#[tokio::test]
async fn test_get_api_endpoint_without_source() {
    let mut obs = ready();
    obs.bind_address = None;
    let mut h = Harness::new(obs);

    let handled = h
        .reconciler
        .handle(Event::ActionInvoked(ActionRequest::new("get-api-endpoint")))
        .await;

    assert!(matches!(action_result(handled), Err(ActionError::Precondition { .. })));
}
