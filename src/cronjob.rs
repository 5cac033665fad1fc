use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::{Job, JobSpec, JobTemplateSpec};
use kube::api::{ObjectMeta, PostParams};
use log::info;
use tokio_util::sync::CancellationToken;

use crate::{
    config::DriverConfig,
    error::{Error, Result},
    job::{self, merge_env, validate_name},
    resource::managed_labels,
    session::ClusterSession,
    RunResult,
};

const SOURCE_LABEL: &str = "workflow.automation/source-cronjob";
const MANUAL_TRIGGER_ANNOTATION: &str = "workflow.automation/manual-trigger";
const TRIGGER_TIME_ANNOTATION: &str = "workflow.automation/trigger-time";
const OVERRIDES_ANNOTATION: &str = "workflow.automation/overrides-applied";

/// Tweaks applied to the cronjob's template before it runs. Command and args
/// replace the template's values wholesale when non-empty; env entries merge
/// by name.
#[derive(Debug, Clone, Default)]
pub struct JobOverrides {
    pub command: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    pub env: Option<Vec<(String, String)>>,
}

#[derive(Debug, Clone)]
pub struct CronJobTriggerSpec {
    /// Name of the CronJob to fire.
    pub name: String,
    pub namespace: String,
    pub cleanup: bool,
    pub overrides: Option<JobOverrides>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl CronJobTriggerSpec {
    pub fn new(config: &DriverConfig, name: impl Into<String>) -> Self {
        CronJobTriggerSpec {
            name: name.into(),
            namespace: config.default_namespace.clone(),
            cleanup: false,
            overrides: None,
            timeout: config.wait_timeout(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Fire a CronJob by hand: clone its job template, apply the overrides, and
/// run the resulting job through the usual wait/log/cleanup tail.
pub async fn trigger_cron_job(
    session: &ClusterSession,
    spec: &CronJobTriggerSpec,
) -> Result<RunResult> {
    // Derive and check the job name up front so a bad name never reaches the
    // cluster.
    let job_name = trigger_job_name(&spec.name)?;

    let cron = session
        .cron_jobs(&spec.namespace)
        .get(&spec.name)
        .await
        .map_err(|e| Error::cluster("get", "CronJob", &spec.name, &spec.namespace, e))?;

    let mut template = cron
        .spec
        .ok_or(Error::MissingField("spec.jobTemplate"))?
        .job_template;

    let overrides_applied = match (&spec.overrides, template.spec.as_mut()) {
        (Some(overrides), Some(job_spec)) => apply_overrides(job_spec, overrides),
        (_, None) => return Err(Error::MissingField("jobTemplate.spec")),
        _ => false,
    };

    let job = build_triggered_job(&job_name, &spec.name, template, overrides_applied);

    session
        .jobs(&spec.namespace)
        .create(&PostParams::default(), &job)
        .await
        .map_err(|e| Error::cluster("create", "Job", &job_name, &spec.namespace, e))?;

    info!(
        "triggered cronjob '{}' in namespace '{}' as job '{}'",
        spec.name, spec.namespace, job_name
    );

    job::finish_job_run(
        session,
        &job_name,
        &spec.namespace,
        spec.cleanup,
        spec.timeout,
        &spec.cancel,
    )
    .await
}

/// Manually triggered jobs are named `<cronjob>-<unix seconds>`.
pub(crate) fn trigger_job_name(cron_name: &str) -> Result<String> {
    let name = format!("{cron_name}-{}", Utc::now().timestamp());
    validate_name(&name)?;

    Ok(name)
}

fn apply_overrides(job_spec: &mut JobSpec, overrides: &JobOverrides) -> bool {
    let mut applied = false;

    let Some(pod_spec) = job_spec.template.spec.as_mut() else {
        return false;
    };

    for container in pod_spec.containers.iter_mut() {
        if let Some(command) = &overrides.command {
            if !command.is_empty() {
                container.command = Some(command.clone());
                applied = true;
            }
        }
        if let Some(args) = &overrides.args {
            if !args.is_empty() {
                container.args = Some(args.clone());
                applied = true;
            }
        }
        if let Some(env) = &overrides.env {
            if !env.is_empty() {
                let mut merged = container.env.take().unwrap_or_default();
                merge_env(&mut merged, env);
                container.env = Some(merged);
                applied = true;
            }
        }
    }

    applied
}

/// Turn the cloned template into a Job, keeping whatever metadata the
/// template carried and stamping provenance on top of it.
fn build_triggered_job(
    job_name: &str,
    source: &str,
    mut template: JobTemplateSpec,
    overrides_applied: bool,
) -> Job {
    // The pod template is labelled too, so the spawned pods are identifiable.
    if let Some(job_spec) = template.spec.as_mut() {
        let pod_meta = job_spec
            .template
            .metadata
            .get_or_insert_with(ObjectMeta::default);
        pod_meta
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(managed_labels());
    }

    let mut metadata = template.metadata.unwrap_or_default();
    metadata.name = Some(job_name.to_owned());

    let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.extend(managed_labels());
    labels.insert(SOURCE_LABEL.to_string(), source.to_string());

    metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .extend([
            (MANUAL_TRIGGER_ANNOTATION.to_string(), "true".to_string()),
            (TRIGGER_TIME_ANNOTATION.to_string(), Utc::now().to_rfc3339()),
            (
                OVERRIDES_ANNOTATION.to_string(),
                overrides_applied.to_string(),
            ),
        ]);

    Job {
        metadata,
        spec: template.spec,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE};
    use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};

    fn template_with_env(env: Vec<(&str, &str)>) -> JobTemplateSpec {
        let env = env
            .into_iter()
            .map(|(name, value)| EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                ..Default::default()
            })
            .collect();

        JobTemplateSpec {
            metadata: None,
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "worker".to_string(),
                            image: Some("busybox".to_string()),
                            command: Some(vec!["run".to_string()]),
                            env: Some(env),
                            ..Default::default()
                        }],
                        restart_policy: Some("Never".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
        }
    }

    fn container(template: &JobTemplateSpec) -> &Container {
        &template
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0]
    }

    #[test]
    fn env_overrides_update_in_place_and_append() {
        let mut template = template_with_env(vec![("A", "1"), ("B", "2")]);
        let overrides = JobOverrides {
            env: Some(vec![
                ("B".to_string(), "9".to_string()),
                ("C".to_string(), "3".to_string()),
            ]),
            ..Default::default()
        };

        assert!(apply_overrides(template.spec.as_mut().unwrap(), &overrides));

        let env = container(&template).env.as_ref().unwrap();
        let flat: Vec<(&str, &str)> = env
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_deref().unwrap()))
            .collect();
        assert_eq!(flat, vec![("A", "1"), ("B", "9"), ("C", "3")]);
    }

    #[test]
    fn command_and_args_replace_wholesale() {
        let mut template = template_with_env(vec![]);
        let overrides = JobOverrides {
            command: Some(vec!["other".to_string()]),
            args: Some(vec!["--fast".to_string()]),
            ..Default::default()
        };

        assert!(apply_overrides(template.spec.as_mut().unwrap(), &overrides));

        let container = container(&template);
        assert_eq!(container.command, Some(vec!["other".to_string()]));
        assert_eq!(container.args, Some(vec!["--fast".to_string()]));
    }

    #[test]
    fn empty_override_lists_leave_the_template_alone() {
        let mut template = template_with_env(vec![]);
        let overrides = JobOverrides {
            command: Some(vec![]),
            args: Some(vec![]),
            env: Some(vec![]),
        };

        assert!(!apply_overrides(template.spec.as_mut().unwrap(), &overrides));
        assert_eq!(container(&template).command, Some(vec!["run".to_string()]));
    }

    #[test]
    fn triggered_jobs_are_stamped_with_provenance() {
        let template = template_with_env(vec![]);
        let job = build_triggered_job("nightly-1700000000", "nightly", template, true);

        assert_eq!(job.metadata.name.as_deref(), Some("nightly-1700000000"));

        let labels = job.metadata.labels.unwrap();
        assert_eq!(
            labels.get(MANAGED_BY_LABEL_KEY).map(String::as_str),
            Some(MANAGED_BY_LABEL_VALUE)
        );
        assert_eq!(labels.get(SOURCE_LABEL).map(String::as_str), Some("nightly"));

        let annotations = job.metadata.annotations.unwrap();
        assert_eq!(
            annotations.get(MANUAL_TRIGGER_ANNOTATION).map(String::as_str),
            Some("true")
        );
        assert_eq!(
            annotations.get(OVERRIDES_ANNOTATION).map(String::as_str),
            Some("true")
        );
        assert!(annotations.contains_key(TRIGGER_TIME_ANNOTATION));

        // The pod template picked up the managed label as well.
        let pod_labels = job
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .labels
            .unwrap();
        assert_eq!(
            pod_labels.get(MANAGED_BY_LABEL_KEY).map(String::as_str),
            Some(MANAGED_BY_LABEL_VALUE)
        );
    }

    #[test]
    fn trigger_names_embed_a_timestamp_and_stay_valid() {
        let name = trigger_job_name("nightly").unwrap();

        assert!(name.starts_with("nightly-"));
        assert!(validate_name(&name).is_ok());

        // A unix timestamp adds 11 characters; long cronjob names overflow
        // the 63-character cap and must be rejected up front.
        assert!(trigger_job_name(&"a".repeat(53)).is_err());
        assert!(trigger_job_name(&"a".repeat(52)).is_ok());
    }
}
