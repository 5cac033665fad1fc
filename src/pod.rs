use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    conditions,
    config::DriverConfig,
    error::{Error, Result},
    job::validate_name,
    logs::{self, LogOptions},
    resource::{self, managed_labels},
    session::ClusterSession,
    watch, RunResult,
};

#[derive(Debug, Clone)]
pub struct PodRunSpec {
    /// Pod name; derived from the current time when not supplied.
    pub name: Option<String>,
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
    pub container: String,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl PodRunSpec {
    pub fn new(config: &DriverConfig, image: impl Into<String>) -> Self {
        PodRunSpec {
            name: None,
            namespace: config.default_namespace.clone(),
            image: image.into(),
            command: Vec::new(),
            container: "runner".to_string(),
            timeout: config.wait_timeout(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Run a throwaway pod to completion and capture its output.
///
/// The pod is deleted afterwards no matter how the run went; a failed delete
/// is logged and reported through `cleaned`, it never replaces the run's
/// outcome.
pub async fn run_pod(session: &ClusterSession, spec: &PodRunSpec) -> Result<RunResult> {
    let name = match &spec.name {
        Some(name) => {
            validate_name(name)?;
            name.clone()
        }
        None => derived_pod_name(),
    };

    let pods = session.pods(&spec.namespace);
    pods.create(&PostParams::default(), &build_pod(&name, spec))
        .await
        .map_err(|e| Error::cluster("create", "Pod", &name, &spec.namespace, e))?;

    info!("created pod '{}' in namespace '{}'", name, spec.namespace);

    let api = session.dynamic(&spec.namespace, &resource::api_resource("v1", "Pod"));
    let outcome = watch::wait_for(
        api,
        "Pod",
        &name,
        conditions::pod_finished,
        spec.timeout,
        &spec.cancel,
    )
    .await;

    let mut result = match outcome.into_waited("Pod", &name, "Succeeded or Failed", spec.timeout) {
        Ok(Some(pod)) => {
            let status = conditions::pod_terminal_status(&pod);
            let opts = LogOptions {
                container: Some(spec.container.clone()),
                ..Default::default()
            };
            logs::collect(session, &spec.namespace, &name, &opts)
                .await
                .map(|text| RunResult::finished(&name, &spec.namespace, status, text))
        }
        Ok(None) => {
            warn!("run of pod '{name}' was aborted; returning an empty result");
            Ok(RunResult::unknown(&name, &spec.namespace))
        }
        Err(e) => Err(e),
    };

    // Unconditional cleanup, even when the wait or the log collection failed.
    match pods.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {
            if let Ok(result) = &mut result {
                result.cleaned = true;
            }
        }
        Err(e) => warn!("failed to delete pod '{}' in namespace '{}': {e}", name, spec.namespace),
    }

    result
}

fn derived_pod_name() -> String {
    format!("workflow-run-{}", Utc::now().timestamp())
}

fn build_pod(name: &str, spec: &PodRunSpec) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: spec.container.clone(),
                image: Some(spec.image.clone()),
                command: (!spec.command.is_empty()).then(|| spec.command.clone()),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
