//! AppDeploy core types: the AppDeployment custom resource, its validated
//! desired state, status results, and the shared error taxonomy.

#![forbid(unsafe_code)]

use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default replica count when `spec.replicas` is unset.
pub const DEFAULT_REPLICAS: i32 = 1;
/// Default drift-check cadence when `spec.checkIntervalSeconds` is unset.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Spec of the `AppDeployment` custom resource (`myorg.io/v1`).
///
/// Every field is optional at the wire so that malformed objects still
/// deserialize; [`AppDeploymentSpec::validate`] is the only path into the
/// reconciliation core and rejects anything incomplete.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "myorg.io",
    version = "v1",
    kind = "AppDeployment",
    namespaced,
    status = "AppDeploymentStatus",
    shortname = "appdep"
)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploymentSpec {
    pub image: Option<String>,
    pub port: Option<i32>,
    pub replicas: Option<i32>,
    pub expose: Option<bool>,
    pub check_interval_seconds: Option<u64>,
}

/// Validated desired state for one AppDeployment, defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredApp {
    pub image: String,
    pub port: i32,
    pub replicas: i32,
    pub expose: bool,
    pub check_interval: Duration,
}

impl AppDeploymentSpec {
    /// Check required fields and apply documented defaults
    /// (replicas 1, expose false, check interval 60s).
    pub fn validate(&self) -> Result<DesiredApp> {
        let image = match self.image.as_deref() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return Err(Error::Validation("spec.image is required".into())),
        };
        let port = self
            .port
            .ok_or_else(|| Error::Validation("spec.port is required".into()))?;
        if !(1..=65535).contains(&port) {
            return Err(Error::Validation(format!("spec.port {} out of range", port)));
        }
        let replicas = self.replicas.unwrap_or(DEFAULT_REPLICAS);
        if replicas < 0 {
            return Err(Error::Validation(format!(
                "spec.replicas {} must be >= 0",
                replicas
            )));
        }
        let check_interval = match self.check_interval_seconds {
            Some(0) => {
                return Err(Error::Validation(
                    "spec.checkIntervalSeconds must be > 0".into(),
                ))
            }
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_CHECK_INTERVAL,
        };
        Ok(DesiredApp {
            image,
            port,
            replicas,
            expose: self.expose.unwrap_or(false),
            check_interval,
        })
    }
}

/// Status subresource written back after every reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppDeploymentStatus {
    /// Outcome of the most recent pass. Absent until the first pass has
    /// run; the dispatch loop uses that absence to tell creation from
    /// update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcome classification of a reconciliation or drift-check pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Created,
    Updated,
    Deleted,
    Warning,
    Ok,
    Error,
}

/// Result of one pass, persisted onto the AppDeployment status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResult {
    pub phase: Phase,
    pub message: String,
}

impl StatusResult {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self { phase, message: message.into() }
    }
}

impl From<StatusResult> for AppDeploymentStatus {
    fn from(r: StatusResult) -> Self {
        Self { phase: Some(r.phase), message: Some(r.message) }
    }
}

/// Errors surfaced by the reconciliation core and the cluster adapter.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },
    /// Recoverable failure; the caller should wait `delay` and try again.
    #[error("{message} (retry in {delay:?})")]
    Retryable { message: String, delay: Duration },
    #[error("cluster api: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use super::{
        AppDeployment, AppDeploymentSpec, AppDeploymentStatus, DesiredApp, Error, Phase, Result,
        StatusResult,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(image: Option<&str>, port: Option<i32>) -> AppDeploymentSpec {
        AppDeploymentSpec {
            image: image.map(|s| s.to_string()),
            port,
            replicas: None,
            expose: None,
            check_interval_seconds: None,
        }
    }

    #[test]
    fn validate_applies_defaults() {
        let app = spec(Some("nginx"), Some(80)).validate().unwrap();
        assert_eq!(app.image, "nginx");
        assert_eq!(app.port, 80);
        assert_eq!(app.replicas, DEFAULT_REPLICAS);
        assert!(!app.expose);
        assert_eq!(app.check_interval, DEFAULT_CHECK_INTERVAL);
    }

    #[test]
    fn validate_requires_image_and_port() {
        let e = spec(None, Some(80)).validate().unwrap_err();
        assert!(matches!(e, Error::Validation(_)), "e={}", e);
        assert!(e.to_string().contains("image"), "e={}", e);

        let e = spec(Some("nginx"), None).validate().unwrap_err();
        assert!(e.to_string().contains("port"), "e={}", e);

        // empty image is as good as absent
        let e = spec(Some(""), Some(80)).validate().unwrap_err();
        assert!(e.to_string().contains("image"), "e={}", e);
    }

    #[test]
    fn validate_rejects_bad_ranges() {
        let mut s = spec(Some("nginx"), Some(80));
        s.replicas = Some(-1);
        assert!(s.validate().is_err());

        let mut s = spec(Some("nginx"), Some(80));
        s.check_interval_seconds = Some(0);
        assert!(s.validate().is_err());

        let s = spec(Some("nginx"), Some(70000));
        assert!(s.validate().is_err());
    }

    #[test]
    fn phase_wire_format_is_lowercase() {
        assert_eq!(serde_json::to_string(&Phase::Created).unwrap(), "\"created\"");
        assert_eq!(serde_json::to_string(&Phase::Warning).unwrap(), "\"warning\"");
        let p: Phase = serde_json::from_str("\"ok\"").unwrap();
        assert_eq!(p, Phase::Ok);
    }

    #[test]
    fn status_result_converts_to_status() {
        let st: AppDeploymentStatus = StatusResult::new(Phase::Updated, "done").into();
        assert_eq!(st.phase, Some(Phase::Updated));
        assert_eq!(st.message.as_deref(), Some("done"));
    }
}
