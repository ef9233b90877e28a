//! Watcher-driven dispatch: classifies AppDeployment changes into explicit
//! event kinds, routes them to the reconcile handlers, persists the result
//! onto the status subresource, and schedules per-object drift timers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use appdeploy_core::{AppDeployment, AppDeploymentStatus, Error, Phase, StatusResult};
use appdeploy_kubehub::{watch_appdeployments, AppWatchEvent, ClusterClient, KubeClient};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, Patch, PatchParams},
    Client, Resource, ResourceExt,
};
use serde_json::json;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Trigger classification for one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Timer,
}

/// Route one event to its handler. A plain function call per kind, no
/// registration side effects anywhere.
pub async fn dispatch(
    client: &dyn ClusterClient,
    kind: EventKind,
    obj: &AppDeployment,
) -> appdeploy_core::Result<StatusResult> {
    let name = obj.name_any();
    let ns = obj.namespace().unwrap_or_else(|| "default".to_string());
    match kind {
        EventKind::Created => {
            let owner = owner_ref(obj)?;
            appdeploy_reconcile::on_create(client, &obj.spec, &name, &ns, &owner).await
        }
        EventKind::Updated => {
            let owner = owner_ref(obj)?;
            appdeploy_reconcile::on_update(
                client,
                &obj.spec,
                obj.status.as_ref(),
                &name,
                &ns,
                &owner,
            )
            .await
        }
        EventKind::Deleted => appdeploy_reconcile::on_delete(client, &name, &ns).await,
        EventKind::Timer => {
            let subject = subject_ref(obj);
            appdeploy_reconcile::check_replicas(client, &obj.spec, &name, &ns, &subject).await
        }
    }
}

/// First-creation vs update: a pass has run before iff a phase was
/// persisted on status.
fn classify(obj: &AppDeployment) -> EventKind {
    match obj.status.as_ref().and_then(|s| s.phase) {
        Some(_) => EventKind::Updated,
        None => EventKind::Created,
    }
}

fn owner_ref(obj: &AppDeployment) -> appdeploy_core::Result<OwnerReference> {
    obj.controller_owner_ref(&())
        .ok_or_else(|| Error::Validation("object missing metadata.uid".into()))
}

fn subject_ref(obj: &AppDeployment) -> ObjectReference {
    obj.object_ref(&())
}

fn obj_key(obj: &AppDeployment) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

fn status_of(res: &appdeploy_core::Result<StatusResult>) -> AppDeploymentStatus {
    match res {
        Ok(r) => r.clone().into(),
        Err(e) => AppDeploymentStatus {
            phase: Some(Phase::Error),
            message: Some(e.to_string()),
        },
    }
}

async fn write_status(client: &Client, obj: &AppDeployment, status: AppDeploymentStatus) {
    let name = obj.name_any();
    let Some(ns) = obj.namespace() else { return };
    let api: Api<AppDeployment> = Api::namespaced(client.clone(), &ns);
    let patch = json!({ "status": status });
    if let Err(e) = api
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        warn!(name = %name, ns = %ns, error = %e, "status update failed");
    }
}

/// Per-object drift loop. Runs at the spec's own cadence; a recoverable
/// failure defers the next attempt by the carried delay instead.
async fn drift_loop(hub: Arc<KubeClient>, client: Client, obj: AppDeployment, interval: Duration) {
    let name = obj.name_any();
    let mut next_delay = interval;
    loop {
        tokio::time::sleep(next_delay).await;
        next_delay = interval;
        match dispatch(hub.as_ref(), EventKind::Timer, &obj).await {
            Ok(res) => write_status(&client, &obj, status_of(&Ok(res))).await,
            Err(Error::Retryable { message, delay }) => {
                warn!(name = %name, message = %message, delay_secs = delay.as_secs(), "drift check deferred");
                next_delay = delay;
            }
            Err(e) => {
                error!(name = %name, error = %e, "drift check failed");
                write_status(&client, &obj, status_of(&Err(e))).await;
            }
        }
    }
}

/// Replace the drift timer for an object. The interval is data carried by
/// the spec, so every accepted pass re-arms with the freshest copy.
fn arm_timer(
    timers: &mut HashMap<String, JoinHandle<()>>,
    hub: Arc<KubeClient>,
    client: Client,
    obj: &AppDeployment,
) {
    let key = obj_key(obj);
    if let Some(old) = timers.remove(&key) {
        old.abort();
    }
    let interval = match obj.spec.validate() {
        Ok(app) => app.check_interval,
        Err(_) => return,
    };
    let obj = obj.clone();
    timers.insert(key, tokio::spawn(drift_loop(hub, client, obj, interval)));
}

/// Controller loop: consume watch events, dedup by resourceVersion, route
/// through [`dispatch`], persist status, keep drift timers in step.
pub async fn run(namespace: Option<&str>) -> Result<()> {
    let client = Client::try_default().await?;
    let hub = Arc::new(KubeClient::new(client.clone()));

    let cap = std::env::var("APPDEPLOY_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1024);
    let (tx, mut rx) = mpsc::channel::<AppWatchEvent>(cap);
    let ns_owned = namespace.map(|s| s.to_string());
    let watcher = tokio::spawn({
        let client = client.clone();
        async move {
            if let Err(e) = watch_appdeployments(client, ns_owned.as_deref(), tx).await {
                error!(error = %e, "watcher ended with error");
            }
        }
    });

    let mut last_rv: HashMap<String, String> = HashMap::new();
    let mut timers: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        let ev = tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            ev = rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };

        match ev {
            AppWatchEvent::Applied(obj) => {
                let rv = obj.resource_version().unwrap_or_default();
                if let Some(uid) = obj.uid() {
                    if last_rv.get(&uid).is_some_and(|prev| prev == &rv) {
                        continue;
                    }
                    last_rv.insert(uid, rv);
                }
                let kind = classify(&obj);
                let res = dispatch(hub.as_ref(), kind, &obj).await;
                if let Err(e) = &res {
                    error!(key = %obj_key(&obj), kind = ?kind, error = %e, "reconcile pass failed");
                }
                write_status(&client, &obj, status_of(&res)).await;
                if res.is_ok() {
                    arm_timer(&mut timers, hub.clone(), client.clone(), &obj);
                }
            }
            AppWatchEvent::Deleted(obj) => {
                if let Some(task) = timers.remove(&obj_key(&obj)) {
                    task.abort();
                }
                if let Some(uid) = obj.uid() {
                    last_rv.remove(&uid);
                }
                if let Err(e) = dispatch(hub.as_ref(), EventKind::Deleted, &obj).await {
                    error!(key = %obj_key(&obj), error = %e, "delete pass failed");
                }
            }
        }
    }

    for (_, task) in timers.drain() {
        task.abort();
    }
    watcher.abort();
    Ok(())
}
