#![forbid(unsafe_code)]

use appdeploy_core::{AppDeploymentSpec, Error, Phase};
use appdeploy_kubehub::{EventSeverity, MockClient};
use appdeploy_reconcile::{
    build_desired, check_replicas, on_create, on_delete, on_update, RECHECK_DELAY,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

const NS: &str = "default";
const NAME: &str = "test-app";

fn spec(replicas: i32, expose: bool) -> AppDeploymentSpec {
    AppDeploymentSpec {
        image: Some("nginx".into()),
        port: Some(80),
        replicas: Some(replicas),
        expose: Some(expose),
        check_interval_seconds: Some(30),
    }
}

fn owner() -> OwnerReference {
    OwnerReference {
        api_version: "myorg.io/v1".into(),
        kind: "AppDeployment".into(),
        name: NAME.into(),
        uid: "7b1e79cc-21d5-4b33-8a7e-92b4a0f2a111".into(),
        controller: Some(true),
        ..Default::default()
    }
}

fn subject() -> ObjectReference {
    ObjectReference {
        api_version: Some("myorg.io/v1".into()),
        kind: Some("AppDeployment".into()),
        name: Some(NAME.into()),
        namespace: Some(NS.into()),
        ..Default::default()
    }
}

/// Seed a mock cluster as if `spec` had already been reconciled once.
fn seeded(spec: &AppDeploymentSpec) -> MockClient {
    let app = spec.validate().unwrap();
    let (deployment, service) = build_desired(&app, NAME, NS, &owner());
    let mock = MockClient::new().with_deployment(NS, deployment);
    match service {
        Some(svc) => mock.with_service(NS, svc),
        None => mock,
    }
}

fn with_ready(mock: MockClient, ready: i32) -> MockClient {
    let mut map = mock.deployments.lock().unwrap();
    let d = map.get_mut(&(NS.to_string(), NAME.to_string())).unwrap();
    d.status = Some(DeploymentStatus { ready_replicas: Some(ready), ..Default::default() });
    drop(map);
    mock
}

#[tokio::test]
async fn create_without_expose_issues_single_create() {
    let mock = MockClient::new();
    let res = on_create(&mock, &spec(1, false), NAME, NS, &owner()).await.unwrap();
    assert_eq!(res.phase, Phase::Created);
    assert_eq!(mock.call_log(), vec!["create Deployment default/test-app"]);
}

#[tokio::test]
async fn create_with_expose_issues_deployment_then_service() {
    let mock = MockClient::new();
    let res = on_create(&mock, &spec(2, true), NAME, NS, &owner()).await.unwrap();
    assert_eq!(res.phase, Phase::Created);
    assert_eq!(
        mock.call_log(),
        vec!["create Deployment default/test-app", "create Service default/test-app"]
    );

    let deployments = mock.deployments.lock().unwrap();
    let d = deployments.get(&(NS.to_string(), NAME.to_string())).unwrap();
    let d_spec = d.spec.as_ref().unwrap();
    assert_eq!(d_spec.replicas, Some(2));
    let container = &d_spec.template.spec.as_ref().unwrap().containers[0];
    assert_eq!(container.image.as_deref(), Some("nginx"));
    assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 80);

    let services = mock.services.lock().unwrap();
    let s = services.get(&(NS.to_string(), NAME.to_string())).unwrap();
    let s_spec = s.spec.as_ref().unwrap();
    assert_eq!(s_spec.type_.as_deref(), Some("ClusterIP"));
    assert_eq!(s_spec.ports.as_ref().unwrap()[0].port, 80);
}

#[tokio::test]
async fn create_surfaces_already_exists() {
    let mock = seeded(&spec(1, false));
    let e = on_create(&mock, &spec(1, false), NAME, NS, &owner()).await.unwrap_err();
    assert!(matches!(e, Error::AlreadyExists { .. }), "e={}", e);
}

#[tokio::test]
async fn create_rejects_invalid_spec_before_any_call() {
    let mock = MockClient::new();
    let bad = AppDeploymentSpec {
        image: None,
        port: Some(80),
        replicas: None,
        expose: None,
        check_interval_seconds: None,
    };
    let e = on_create(&mock, &bad, NAME, NS, &owner()).await.unwrap_err();
    assert!(matches!(e, Error::Validation(_)), "e={}", e);
    assert!(mock.call_log().is_empty());
}

#[tokio::test]
async fn update_expose_withdrawn_deletes_service() {
    let mock = seeded(&spec(2, true));
    let res = on_update(&mock, &spec(2, false), None, NAME, NS, &owner()).await.unwrap();
    assert_eq!(res.phase, Phase::Updated);
    assert!(mock.services.lock().unwrap().is_empty());
    assert!(mock.call_log().contains(&"delete Service default/test-app".to_string()));
}

#[tokio::test]
async fn update_expose_requested_creates_service() {
    let mock = seeded(&spec(2, false));
    let res = on_update(&mock, &spec(2, true), None, NAME, NS, &owner()).await.unwrap();
    assert_eq!(res.phase, Phase::Updated);
    assert_eq!(mock.services.lock().unwrap().len(), 1);
    assert!(mock.call_log().contains(&"create Service default/test-app".to_string()));
}

#[tokio::test]
async fn update_expose_kept_patches_port_only() {
    let mock = seeded(&spec(2, true));
    let mut next = spec(2, true);
    next.port = Some(8080);
    on_update(&mock, &next, None, NAME, NS, &owner()).await.unwrap();

    let log = mock.call_log();
    assert!(log.contains(&"patch Service default/test-app".to_string()), "log={:?}", log);
    assert!(!log.iter().any(|l| l.starts_with("create Service")), "log={:?}", log);
    assert!(!log.iter().any(|l| l.starts_with("delete Service")), "log={:?}", log);

    let services = mock.services.lock().unwrap();
    let s = services.get(&(NS.to_string(), NAME.to_string())).unwrap();
    assert_eq!(s.spec.as_ref().unwrap().ports.as_ref().unwrap()[0].port, 8080);
}

#[tokio::test]
async fn update_without_service_and_without_expose_is_noop_on_service() {
    let mock = seeded(&spec(2, false));
    on_update(&mock, &spec(3, false), None, NAME, NS, &owner()).await.unwrap();
    let log = mock.call_log();
    assert!(!log.iter().any(|l| l.contains("Service") && !l.starts_with("get")), "log={:?}", log);
}

#[tokio::test]
async fn update_applies_new_replicas_image_and_port() {
    let mock = seeded(&spec(2, false));
    let mut next = spec(3, false);
    next.image = Some("nginx:1.27".into());
    next.port = Some(8080);
    on_update(&mock, &next, None, NAME, NS, &owner()).await.unwrap();

    let deployments = mock.deployments.lock().unwrap();
    let d_spec = deployments
        .get(&(NS.to_string(), NAME.to_string()))
        .unwrap()
        .spec
        .as_ref()
        .unwrap();
    assert_eq!(d_spec.replicas, Some(3));
    let container = &d_spec.template.spec.as_ref().unwrap().containers[0];
    assert_eq!(container.image.as_deref(), Some("nginx:1.27"));
    assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);
}

#[tokio::test]
async fn update_fails_fast_when_deployment_is_gone() {
    let mock = MockClient::new();
    let e = on_update(&mock, &spec(2, false), None, NAME, NS, &owner()).await.unwrap_err();
    assert!(matches!(e, Error::NotFound { kind: "Deployment", .. }), "e={}", e);
    // no further mutation was attempted past the point of failure
    assert_eq!(mock.call_log(), vec!["get Deployment default/test-app"]);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let mock = MockClient::new();
    let res = on_delete(&mock, NAME, NS).await.unwrap();
    assert_eq!(res.phase, Phase::Deleted);
}

#[tokio::test]
async fn delete_removes_both_entities() {
    let mock = seeded(&spec(2, true));
    let res = on_delete(&mock, NAME, NS).await.unwrap();
    assert_eq!(res.phase, Phase::Deleted);
    assert!(mock.deployments.lock().unwrap().is_empty());
    assert!(mock.services.lock().unwrap().is_empty());
}

#[tokio::test]
async fn drift_shortfall_warns_and_emits_event() {
    let mock = with_ready(seeded(&spec(2, false)), 1);
    let res = check_replicas(&mock, &spec(2, false), NAME, NS, &subject()).await.unwrap();
    assert_eq!(res.phase, Phase::Warning);
    assert!(res.message.contains('1') && res.message.contains('2'), "msg={}", res.message);

    let events = mock.recorded_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, "MissingReplicas");
    assert_eq!(events[0].severity, EventSeverity::Warning);
}

#[tokio::test]
async fn drift_healthy_count_reports_ok() {
    let mock = with_ready(seeded(&spec(2, false)), 2);
    let res = check_replicas(&mock, &spec(2, false), NAME, NS, &subject()).await.unwrap();
    assert_eq!(res.phase, Phase::Ok);
    assert!(mock.recorded_events().is_empty());
}

#[tokio::test]
async fn drift_missing_deployment_is_retryable() {
    let mock = MockClient::new();
    let e = check_replicas(&mock, &spec(2, false), NAME, NS, &subject()).await.unwrap_err();
    match e {
        Error::Retryable { delay, .. } => assert_eq!(delay, RECHECK_DELAY),
        other => panic!("expected retryable, got {}", other),
    }
}

#[tokio::test]
async fn drift_counts_missing_status_as_zero_ready() {
    let mock = seeded(&spec(2, false));
    let res = check_replicas(&mock, &spec(2, false), NAME, NS, &subject()).await.unwrap();
    assert_eq!(res.phase, Phase::Warning);
}

#[tokio::test]
async fn repeated_update_with_same_spec_is_stable() {
    let mock = seeded(&spec(2, true));
    on_update(&mock, &spec(2, true), None, NAME, NS, &owner()).await.unwrap();
    let after_first: Vec<Deployment> =
        mock.deployments.lock().unwrap().values().cloned().collect();
    on_update(&mock, &spec(2, true), None, NAME, NS, &owner()).await.unwrap();
    let after_second: Vec<Deployment> =
        mock.deployments.lock().unwrap().values().cloned().collect();
    assert_eq!(
        serde_json::to_vec(&after_first).unwrap(),
        serde_json::to_vec(&after_second).unwrap()
    );
}

#[tokio::test]
async fn service_metadata_carries_owner_for_cascade() {
    let mock = MockClient::new();
    on_create(&mock, &spec(1, true), NAME, NS, &owner()).await.unwrap();
    let services = mock.services.lock().unwrap();
    let svc = services.get(&(NS.to_string(), NAME.to_string())).unwrap();
    let owners = svc.metadata.owner_references.as_ref().unwrap();
    assert_eq!(owners[0].kind, "AppDeployment");
    assert_eq!(owners[0].controller, Some(true));
}
