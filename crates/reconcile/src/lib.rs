//! Reconciliation core: desired-state building, the create/update/delete
//! handlers, and the replica drift check.
//!
//! Handlers are plain async functions taking the cluster adapter as an
//! explicit argument; nothing here registers itself anywhere, and every
//! cluster call is issued sequentially and awaited before the next one.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use appdeploy_core::{
    AppDeploymentSpec, AppDeploymentStatus, DesiredApp, Error, Phase, Result, StatusResult,
};
use appdeploy_kubehub::{ClusterClient, EventSeverity};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, ObjectReference, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use metrics::{counter, histogram};
use tracing::{info, warn};

/// Fixed backoff before re-checking a Deployment that went missing under
/// the drift monitor.
pub const RECHECK_DELAY: Duration = Duration::from_secs(60);

fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

/// Map a validated spec to the Deployment and (iff `expose`) Service
/// manifests. Pure, no I/O, deterministic. Both manifests carry an owner
/// reference back to the AppDeployment so the cluster garbage collector
/// cascades deletion of the parent.
pub fn build_desired(
    app: &DesiredApp,
    name: &str,
    namespace: &str,
    owner: &OwnerReference,
) -> (Deployment, Option<Service>) {
    let labels = app_labels(name);
    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(app.replicas),
            // Selector and pod-template labels must stay identical or the
            // apiserver rejects the manifest.
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some(app.image.clone()),
                        ports: Some(vec![ContainerPort {
                            container_port: app.port,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    let service = if app.expose { Some(build_service(app, name, namespace, owner)) } else { None };
    (deployment, service)
}

fn build_service(app: &DesiredApp, name: &str, namespace: &str, owner: &OwnerReference) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(app_labels(name)),
            ports: Some(vec![service_port(app.port)]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service_port(port: i32) -> ServicePort {
    ServicePort { port, target_port: Some(IntOrString::Int(port)), ..Default::default() }
}

/// In-place mutation of the managed fields on a live Deployment: replica
/// count, container image, container port. Everything else stays as the
/// cluster returned it.
fn apply_app(deployment: &mut Deployment, app: &DesiredApp) {
    let spec = deployment.spec.get_or_insert_with(Default::default);
    spec.replicas = Some(app.replicas);
    if let Some(pod) = spec.template.spec.as_mut() {
        if let Some(container) = pod.containers.first_mut() {
            container.image = Some(app.image.clone());
            let ports = container.ports.get_or_insert_with(Vec::new);
            if ports.is_empty() {
                ports.push(ContainerPort { container_port: app.port, ..Default::default() });
            } else {
                ports[0].container_port = app.port;
            }
        }
    }
}

/// First reconciliation of a new AppDeployment: create the Deployment,
/// then the Service when exposure is requested. No pre-existence check on
/// this path; an `AlreadyExists` from the cluster is surfaced as-is.
pub async fn on_create(
    client: &dyn ClusterClient,
    spec: &AppDeploymentSpec,
    name: &str,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<StatusResult> {
    let t0 = Instant::now();
    counter!("reconcile_create_attempts", 1u64);
    let app = spec.validate()?;
    let (deployment, service) = build_desired(&app, name, namespace, owner);
    client.create_deployment(namespace, &deployment).await?;
    if let Some(svc) = &service {
        client.create_service(namespace, svc).await?;
    }
    histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("reconcile_create_ok", 1u64);
    info!(name = %name, ns = %namespace, replicas = app.replicas, expose = app.expose, "reconcile: created");
    Ok(StatusResult::new(Phase::Created, format!("AppDeployment {} created", name)))
}

/// Converge the managed entities after a spec change. The Deployment must
/// already exist (no auto-recreate on this path), and Service existence is
/// reconciled against `expose`: created when newly requested, port-patched
/// when kept, deleted when withdrawn.
pub async fn on_update(
    client: &dyn ClusterClient,
    spec: &AppDeploymentSpec,
    _status: Option<&AppDeploymentStatus>,
    name: &str,
    namespace: &str,
    owner: &OwnerReference,
) -> Result<StatusResult> {
    let t0 = Instant::now();
    counter!("reconcile_update_attempts", 1u64);
    let app = spec.validate()?;

    let mut deployment = client.get_deployment(namespace, name).await?;
    apply_app(&mut deployment, &app);
    client.patch_deployment(namespace, name, &deployment).await?;

    match client.get_service(namespace, name).await {
        Ok(mut svc) if app.expose => {
            // Selector and type are invariant; only the port moves.
            let svc_spec = svc.spec.get_or_insert_with(Default::default);
            svc_spec.ports = Some(vec![service_port(app.port)]);
            client.patch_service(namespace, name, &svc).await?;
        }
        Ok(_) => {
            client.delete_service(namespace, name).await?;
        }
        Err(Error::NotFound { .. }) if app.expose => {
            let svc = build_service(&app, name, namespace, owner);
            client.create_service(namespace, &svc).await?;
        }
        Err(Error::NotFound { .. }) => {}
        Err(e) => return Err(e),
    }

    histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("reconcile_update_ok", 1u64);
    info!(name = %name, ns = %namespace, replicas = app.replicas, expose = app.expose, "reconcile: updated");
    Ok(StatusResult::new(Phase::Updated, format!("AppDeployment {} updated", name)))
}

/// Tear down the managed entities. Absence is an acceptable end state on
/// this path: cluster GC may have cascaded ahead of us, and the Service
/// may never have existed.
pub async fn on_delete(
    client: &dyn ClusterClient,
    name: &str,
    namespace: &str,
) -> Result<StatusResult> {
    counter!("reconcile_delete_attempts", 1u64);
    match client.delete_deployment(namespace, name).await {
        Ok(()) => info!(name = %name, ns = %namespace, "reconcile: deployment deleted"),
        Err(Error::NotFound { .. }) => {
            warn!(name = %name, ns = %namespace, "deployment not found, already deleted")
        }
        Err(e) => return Err(e),
    }
    match client.delete_service(namespace, name).await {
        Ok(()) => info!(name = %name, ns = %namespace, "reconcile: service deleted"),
        Err(Error::NotFound { .. }) => {}
        Err(e) => return Err(e),
    }
    counter!("reconcile_delete_ok", 1u64);
    Ok(StatusResult::new(Phase::Deleted, format!("AppDeployment {} deleted", name)))
}

/// Compare observed ready replicas against the desired count, emitting a
/// warning event on a shortfall. A missing Deployment is recoverable: the
/// caller gets `Retryable` carrying [`RECHECK_DELAY`] and is expected to
/// try again once it elapses.
pub async fn check_replicas(
    client: &dyn ClusterClient,
    spec: &AppDeploymentSpec,
    name: &str,
    namespace: &str,
    subject: &ObjectReference,
) -> Result<StatusResult> {
    let app = spec.validate()?;
    let deployment = match client.get_deployment(namespace, name).await {
        Ok(d) => d,
        Err(Error::NotFound { .. }) => {
            counter!("drift_check_retry", 1u64);
            return Err(Error::Retryable {
                message: format!("deployment {} not found", name),
                delay: RECHECK_DELAY,
            });
        }
        Err(e) => return Err(e),
    };

    let ready = deployment.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
    if ready < app.replicas {
        let message = format!(
            "deployment {} has {} ready pods, but {} are expected",
            name, ready, app.replicas
        );
        warn!(name = %name, ns = %namespace, ready, want = app.replicas, "drift: missing replicas");
        // Fire-and-forget: a failed publish never fails the check.
        if let Err(e) = client
            .emit_event(subject, EventSeverity::Warning, "MissingReplicas", &message)
            .await
        {
            warn!(error = %e, "event publish failed");
        }
        counter!("drift_check_warn", 1u64);
        Ok(StatusResult::new(Phase::Warning, message))
    } else {
        counter!("drift_check_ok", 1u64);
        Ok(StatusResult::new(Phase::Ok, format!("ok: {} pods ready", ready)))
    }
}
