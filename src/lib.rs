//! Drive a Kubernetes cluster from an automation workflow: run throwaway
//! pods and jobs to completion, fire cronjobs by hand, and wait for arbitrary
//! resources to reach a named condition.

use serde::Serialize;
use serde_json::Value;

pub mod conditions;
pub mod config;
pub mod cronjob;
pub mod error;
pub mod job;
pub mod logs;
pub mod pod;
pub mod resource;
pub mod session;
pub mod watch;

pub use crate::config::{ClusterConfigSource, DriverConfig};
pub use crate::cronjob::{trigger_cron_job, CronJobTriggerSpec, JobOverrides};
pub use crate::error::Error;
pub use crate::job::{run_job, JobRunSpec};
pub use crate::logs::LogOptions;
pub use crate::pod::{run_pod, PodRunSpec};
pub use crate::session::ClusterSession;
pub use crate::watch::{wait_for_condition, ConditionOutcome, WatchRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Succeeded,
    Failed,
    /// Only produced when a wait was abandoned from outside; a timed-out run
    /// is an error, not an unknown result.
    Unknown,
}

/// What a run produced, whichever pipeline executed it.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub name: String,
    pub namespace: String,
    pub status: TerminalStatus,
    /// Captured output exactly as it came from the container.
    pub raw_output: String,
    /// The same output, parsed as JSON when it parses and kept as a string
    /// otherwise.
    pub output: Value,
    /// Whether the created object was deleted again.
    pub cleaned: bool,
}

impl RunResult {
    pub(crate) fn finished(
        name: &str,
        namespace: &str,
        status: TerminalStatus,
        raw_output: String,
    ) -> Self {
        let output = logs::parse_maybe_json(&raw_output);
        RunResult {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            status,
            raw_output,
            output,
            cleaned: false,
        }
    }

    pub(crate) fn unknown(name: &str, namespace: &str) -> Self {
        RunResult::finished(name, namespace, TerminalStatus::Unknown, String::new())
    }
}
