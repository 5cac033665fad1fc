use std::time::Duration;

use k8s_openapi::api::{
    batch::v1::{Job, JobSpec},
    core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec},
};
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use log::{debug, info, warn};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::{
    conditions,
    config::DriverConfig,
    error::{Error, Result},
    logs::{self, LogOptions},
    resource::{self, managed_labels},
    session::ClusterSession,
    watch, RunResult, TerminalStatus,
};

const RUNNER_CONTAINER: &str = "runner";
const NAME_SUFFIX_LEN: usize = 5;
const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Clone)]
pub struct JobRunSpec {
    /// Base for the generated job name; a random suffix is appended.
    pub base_name: String,
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
    pub restart_policy: String,
    /// Delete the job once its output has been collected.
    pub cleanup: bool,
    pub ttl_seconds_after_finished: Option<i32>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl JobRunSpec {
    pub fn new(
        config: &DriverConfig,
        base_name: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        JobRunSpec {
            base_name: base_name.into(),
            namespace: config.default_namespace.clone(),
            image: image.into(),
            command: Vec::new(),
            restart_policy: "Never".to_string(),
            cleanup: true,
            ttl_seconds_after_finished: Some(60),
            timeout: config.wait_timeout(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Check a name against the DNS-1123 label rules the cluster will enforce,
/// so that a bad name fails here instead of as an opaque API rejection.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    };

    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("must be at most 63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid(
            "may only contain lowercase letters, digits and '-'",
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("must start and end with an alphanumeric character"));
    }

    Ok(())
}

/// Derive a unique job name from the base: `<base>-<5 random chars>`.
pub fn derive_job_name(base: &str) -> Result<String> {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

    let mut rng = rand::rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect();

    let name = format!("{base}-{suffix}");
    validate_name(&name)?;

    Ok(name)
}

/**
 * This function takes the run parameters and creates the kubernetes Job
 * object to execute them
 */
fn build_job(job_name: &str, spec: &JobRunSpec) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(job_name.to_owned()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: spec.ttl_seconds_after_finished,
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(managed_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: RUNNER_CONTAINER.to_string(),
                        image: Some(spec.image.clone()),
                        command: (!spec.command.is_empty()).then(|| spec.command.clone()),
                        ..Default::default()
                    }],
                    restart_policy: Some(spec.restart_policy.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create a Job, wait for it to finish, collect the output of its pod and
/// optionally delete it.
pub async fn run_job(session: &ClusterSession, spec: &JobRunSpec) -> Result<RunResult> {
    let name = derive_job_name(&spec.base_name)?;
    let job = build_job(&name, spec);

    session
        .jobs(&spec.namespace)
        .create(&PostParams::default(), &job)
        .await
        .map_err(|e| Error::cluster("create", "Job", &name, &spec.namespace, e))?;

    info!("created job '{}' in namespace '{}'", name, spec.namespace);

    finish_job_run(
        session,
        &name,
        &spec.namespace,
        spec.cleanup,
        spec.timeout,
        &spec.cancel,
    )
    .await
}

/// The tail shared by direct job runs and cronjob triggers: wait until the
/// job reports a finished pod, pull the logs, clean up if asked to.
pub(crate) async fn finish_job_run(
    session: &ClusterSession,
    name: &str,
    namespace: &str,
    cleanup: bool,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<RunResult> {
    let api = session.dynamic(namespace, &resource::api_resource("batch/v1", "Job"));
    let outcome = watch::wait_for(api, "Job", name, conditions::job_finished, timeout, cancel).await;

    let mut result = match outcome.into_waited("Job", name, "completion", timeout) {
        Ok(Some(job)) => {
            let status = conditions::job_terminal_status(&job);
            collect_job_result(session, namespace, name, status).await
        }
        // The wait was consumed by an external abort. Reporting unknown
        // status instead of failing mirrors the historical behavior; keep it
        // loud until that call is revisited.
        Ok(None) => {
            warn!("wait for job '{name}' was aborted; reporting unknown status instead of failing");
            Ok(RunResult::unknown(name, namespace))
        }
        Err(e) => Err(e),
    };

    if cleanup {
        match session
            .jobs(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                if let Ok(result) = &mut result {
                    result.cleaned = true;
                }
            }
            // A leaked job must not replace the run's outcome.
            Err(e) => warn!("failed to delete job '{name}' in namespace '{namespace}': {e}"),
        }
    }

    result
}

async fn collect_job_result(
    session: &ClusterSession,
    namespace: &str,
    name: &str,
    status: TerminalStatus,
) -> Result<RunResult> {
    let pod_name = find_job_pod(session, namespace, name).await?;
    let text = logs::collect(session, namespace, &pod_name, &LogOptions::default()).await?;

    Ok(RunResult::finished(name, namespace, status, text))
}

/// Find the pod a job spawned. Two label conventions for this exist across
/// cluster versions, so the legacy selector is tried first and the prefixed
/// one second.
async fn find_job_pod(session: &ClusterSession, namespace: &str, job: &str) -> Result<String> {
    let pods = session.pods(namespace);

    let selectors = [
        format!("job-name={job}"),
        format!("batch.kubernetes.io/job-name={job}"),
    ];

    for selector in &selectors {
        let list = pods
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| Error::cluster("list pods of", "Job", job, namespace, e))?;

        match list.items.into_iter().find_map(|pod| pod.metadata.name) {
            Some(name) => return Ok(name),
            None => debug!("selector '{selector}' matched no pods for job '{job}'"),
        }
    }

    Err(Error::NoPodsForJob {
        job: job.to_owned(),
        namespace: namespace.to_owned(),
    })
}

/// Merge override env entries into a container's env list: entries with a
/// matching name are replaced in place, new ones are appended in order.
pub(crate) fn merge_env(env: &mut Vec<EnvVar>, overrides: &[(String, String)]) {
    for (name, value) in overrides {
        match env.iter_mut().find(|entry| entry.name == *name) {
            Some(entry) => entry.value = Some(value.clone()),
            None => env.push(EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_env(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_well_formed_names() {
        assert!(validate_name("my-job").is_ok());
        assert!(validate_name("job123").is_ok());
        assert!(validate_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn rejects_names_the_cluster_would_reject() {
        assert!(validate_name("MyJob").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("trailing-").is_err());
        assert!(validate_name("under_score").is_err());
        assert!(validate_name(&format!("my-job-{}", "a".repeat(58))).is_err());
    }

    #[test]
    fn derived_names_carry_a_short_suffix() {
        let name = derive_job_name("my-job").unwrap();

        assert_eq!(name.len(), "my-job".len() + 1 + NAME_SUFFIX_LEN);
        assert!(name.starts_with("my-job-"));
        let suffix = &name["my-job-".len()..];
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn derivation_fails_fast_on_bad_bases() {
        // The suffix would push this over 63 characters.
        assert!(derive_job_name(&"a".repeat(58)).is_err());
        assert!(derive_job_name(&"a".repeat(57)).is_ok());
        assert!(derive_job_name("MyJob").is_err());
    }

    #[test]
    fn built_jobs_are_labelled_and_run_once() {
        let config = DriverConfig::default();
        let mut spec = JobRunSpec::new(&config, "my-job", "alpine:latest");
        spec.command = vec!["echo".to_string(), "hi".to_string()];

        let job = build_job("my-job-abc12", &spec);

        assert_eq!(job.metadata.name.as_deref(), Some("my-job-abc12"));
        assert_eq!(job.metadata.labels, Some(managed_labels()));

        let job_spec = job.spec.unwrap();
        assert_eq!(job_spec.backoff_limit, Some(0));
        assert_eq!(job_spec.ttl_seconds_after_finished, Some(60));

        let template = job_spec.template;
        assert_eq!(template.metadata.unwrap().labels, Some(managed_labels()));

        let pod_spec = template.spec.unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod_spec.containers.len(), 1);
        assert_eq!(
            pod_spec.containers[0].command,
            Some(vec!["echo".to_string(), "hi".to_string()])
        );
    }

    #[test]
    fn empty_command_is_left_to_the_image() {
        let config = DriverConfig::default();
        let spec = JobRunSpec::new(&config, "my-job", "alpine:latest");

        let job = build_job("my-job-abc12", &spec);
        let pod_spec = job.spec.unwrap().template.spec.unwrap();

        assert_eq!(pod_spec.containers[0].command, None);
    }

    #[test]
    fn env_merge_updates_matches_and_appends_the_rest() {
        let mut env = vec![plain_env("A", "1"), plain_env("B", "2")];

        merge_env(
            &mut env,
            &[
                ("B".to_string(), "9".to_string()),
                ("C".to_string(), "3".to_string()),
            ],
        );

        let flat: Vec<(&str, &str)> = env
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_deref().unwrap()))
            .collect();
        assert_eq!(flat, vec![("A", "1"), ("B", "9"), ("C", "3")]);
    }
}
