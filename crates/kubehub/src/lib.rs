//! AppDeploy kube integration: the typed cluster client adapter and the
//! AppDeployment watcher wiring.
//!
//! The adapter owns single-call semantics only; errors are surfaced to the
//! caller, never retried here.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use appdeploy_core::{AppDeployment, Error, Result};
use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ObjectReference, Service};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
    runtime::watcher::{self, Event as WatcherEvent},
    Client,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Severity of a domain event published against an AppDeployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Typed get/create/patch/delete against the managed kinds, plus domain
/// event emission. One trait object per reconciliation pass; implementations
/// must be safe to share across passes for different objects.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;
    async fn create_deployment(&self, namespace: &str, manifest: &Deployment)
        -> Result<Deployment>;
    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        desired: &Deployment,
    ) -> Result<Deployment>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;
    async fn create_service(&self, namespace: &str, manifest: &Service) -> Result<Service>;
    async fn patch_service(&self, namespace: &str, name: &str, desired: &Service)
        -> Result<Service>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    /// Publish a Kubernetes Event attached to `subject`. Callers treat this
    /// as fire-and-forget; a failed publish must not fail the pass.
    async fn emit_event(
        &self,
        subject: &ObjectReference,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

fn classify_status(kind: &'static str, name: &str, code: u16, detail: String) -> Error {
    match code {
        404 => Error::NotFound { kind, name: name.to_string() },
        409 => Error::AlreadyExists { kind, name: name.to_string() },
        _ => Error::Api(detail),
    }
}

fn map_kube_err(kind: &'static str, name: &str, e: kube::Error) -> Error {
    match &e {
        kube::Error::Api(ae) => classify_status(kind, name, ae.code, e.to_string()),
        _ => Error::Api(e.to_string()),
    }
}

/// Adapter backed by a real kube client.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
    reporter: Reporter,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: "appdeployd".into(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self { client, reporter }
    }

    fn deployments(&self, ns: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn services(&self, ns: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), ns)
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClient {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        self.deployments(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_err("Deployment", name, e))
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        manifest: &Deployment,
    ) -> Result<Deployment> {
        let name = manifest.metadata.name.clone().unwrap_or_default();
        self.deployments(namespace)
            .create(&PostParams::default(), manifest)
            .await
            .map_err(|e| map_kube_err("Deployment", &name, e))
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        desired: &Deployment,
    ) -> Result<Deployment> {
        self.deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(desired))
            .await
            .map_err(|e| map_kube_err("Deployment", name, e))
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        self.deployments(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err("Deployment", name, e))
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.services(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_err("Service", name, e))
    }

    async fn create_service(&self, namespace: &str, manifest: &Service) -> Result<Service> {
        let name = manifest.metadata.name.clone().unwrap_or_default();
        self.services(namespace)
            .create(&PostParams::default(), manifest)
            .await
            .map_err(|e| map_kube_err("Service", &name, e))
    }

    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        desired: &Service,
    ) -> Result<Service> {
        self.services(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(desired))
            .await
            .map_err(|e| map_kube_err("Service", name, e))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        self.services(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err("Service", name, e))
    }

    async fn emit_event(
        &self,
        subject: &ObjectReference,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), subject.clone());
        recorder
            .publish(Event {
                type_: match severity {
                    EventSeverity::Normal => EventType::Normal,
                    EventSeverity::Warning => EventType::Warning,
                },
                reason: reason.to_string(),
                note: Some(message.to_string()),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await
            .map_err(|e| Error::Api(e.to_string()))
    }
}

// ---- watcher wiring ----

/// Raw change notification for one AppDeployment.
#[derive(Debug, Clone)]
pub enum AppWatchEvent {
    Applied(AppDeployment),
    Deleted(AppDeployment),
}

/// Start list+watch over AppDeployments and forward events into `tx`.
/// Restart lists are replayed as `Applied`, mirroring the server state.
pub async fn watch_appdeployments(
    client: Client,
    namespace: Option<&str>,
    tx: mpsc::Sender<AppWatchEvent>,
) -> Result<()> {
    let api: Api<AppDeployment> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "appdeployment watcher started");
    while let Some(ev) = stream
        .try_next()
        .await
        .map_err(|e| Error::Api(e.to_string()))?
    {
        match ev {
            WatcherEvent::Applied(o) => {
                let _ = tx.send(AppWatchEvent::Applied(o)).await;
            }
            WatcherEvent::Deleted(o) => {
                let _ = tx.send(AppWatchEvent::Deleted(o)).await;
            }
            WatcherEvent::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                for o in list {
                    let _ = tx.send(AppWatchEvent::Applied(o)).await;
                }
            }
        }
    }
    warn!("appdeployment watcher stream ended");
    Ok(())
}

// ----------------- Mock implementation -----------------

/// Event captured by [`MockClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

/// In-memory cluster for tests: entities live in maps keyed by
/// `(namespace, name)` and every call is journaled in order.
#[derive(Default)]
pub struct MockClient {
    pub deployments: Mutex<HashMap<(String, String), Deployment>>,
    pub services: Mutex<HashMap<(String, String), Service>>,
    pub calls: Mutex<Vec<String>>,
    pub events: Mutex<Vec<RecordedEvent>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deployment(self, namespace: &str, manifest: Deployment) -> Self {
        let name = manifest.metadata.name.clone().unwrap_or_default();
        self.deployments
            .lock()
            .unwrap()
            .insert(key(namespace, &name), manifest);
        self
    }

    pub fn with_service(self, namespace: &str, manifest: Service) -> Self {
        let name = manifest.metadata.name.clone().unwrap_or_default();
        self.services
            .lock()
            .unwrap()
            .insert(key(namespace, &name), manifest);
        self
    }

    /// Journal of calls in invocation order, e.g. `"create Deployment default/web"`.
    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn recorded_events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    fn log(&self, line: String) {
        self.calls.lock().unwrap().push(line);
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

#[async_trait::async_trait]
impl ClusterClient for MockClient {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        self.log(format!("get Deployment {}/{}", namespace, name));
        self.deployments
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
            .ok_or(Error::NotFound { kind: "Deployment", name: name.to_string() })
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        manifest: &Deployment,
    ) -> Result<Deployment> {
        let name = manifest.metadata.name.clone().unwrap_or_default();
        self.log(format!("create Deployment {}/{}", namespace, name));
        let mut map = self.deployments.lock().unwrap();
        if map.contains_key(&key(namespace, &name)) {
            return Err(Error::AlreadyExists { kind: "Deployment", name });
        }
        map.insert(key(namespace, &name), manifest.clone());
        Ok(manifest.clone())
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        desired: &Deployment,
    ) -> Result<Deployment> {
        self.log(format!("patch Deployment {}/{}", namespace, name));
        let mut map = self.deployments.lock().unwrap();
        if !map.contains_key(&key(namespace, name)) {
            return Err(Error::NotFound { kind: "Deployment", name: name.to_string() });
        }
        map.insert(key(namespace, name), desired.clone());
        Ok(desired.clone())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        self.log(format!("delete Deployment {}/{}", namespace, name));
        self.deployments
            .lock()
            .unwrap()
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or(Error::NotFound { kind: "Deployment", name: name.to_string() })
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.log(format!("get Service {}/{}", namespace, name));
        self.services
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
            .ok_or(Error::NotFound { kind: "Service", name: name.to_string() })
    }

    async fn create_service(&self, namespace: &str, manifest: &Service) -> Result<Service> {
        let name = manifest.metadata.name.clone().unwrap_or_default();
        self.log(format!("create Service {}/{}", namespace, name));
        let mut map = self.services.lock().unwrap();
        if map.contains_key(&key(namespace, &name)) {
            return Err(Error::AlreadyExists { kind: "Service", name });
        }
        map.insert(key(namespace, &name), manifest.clone());
        Ok(manifest.clone())
    }

    async fn patch_service(
        &self,
        namespace: &str,
        name: &str,
        desired: &Service,
    ) -> Result<Service> {
        self.log(format!("patch Service {}/{}", namespace, name));
        let mut map = self.services.lock().unwrap();
        if !map.contains_key(&key(namespace, name)) {
            return Err(Error::NotFound { kind: "Service", name: name.to_string() });
        }
        map.insert(key(namespace, name), desired.clone());
        Ok(desired.clone())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        self.log(format!("delete Service {}/{}", namespace, name));
        self.services
            .lock()
            .unwrap()
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or(Error::NotFound { kind: "Service", name: name.to_string() })
    }

    async fn emit_event(
        &self,
        _subject: &ObjectReference,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        self.log(format!("event {}", reason));
        self.events.lock().unwrap().push(RecordedEvent {
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}
