use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// How to reach the cluster. The selection is always explicit, never guessed
/// from the shape of the input.
#[derive(Debug, Clone)]
pub enum ClusterConfigSource {
    /// Environment discovery: in-cluster service account or local kubeconfig,
    /// whatever the kube client infers by default.
    Ambient,
    /// A kubeconfig file on disk.
    File(PathBuf),
    /// Kubeconfig YAML passed in as a string.
    Inline(String),
}

pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_LOG_GRACE_SECS: u64 = 10;
pub const DEFAULT_FOLLOW_LOG_GRACE_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub default_namespace: String,
    pub wait_timeout_secs: u64,
    pub log_grace_secs: u64,
    pub follow_log_grace_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            default_namespace: "default".to_string(),
            wait_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
            log_grace_secs: DEFAULT_LOG_GRACE_SECS,
            follow_log_grace_secs: DEFAULT_FOLLOW_LOG_GRACE_SECS,
        }
    }
}

impl DriverConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Grace period for log collection, depending on whether the stream is
    /// followed or read to its natural end.
    pub fn log_grace(&self, follow: bool) -> Duration {
        if follow {
            Duration::from_secs(self.follow_log_grace_secs)
        } else {
            Duration::from_secs(self.log_grace_secs)
        }
    }
}

/**
 * This function parses the environment variables and returns a configuration
 */
pub fn get_config_from_env() -> DriverConfig {
    let defaults = DriverConfig::default();

    DriverConfig {
        default_namespace: env::var("NAMESPACE").unwrap_or(defaults.default_namespace),
        wait_timeout_secs: env_seconds("WAIT_TIMEOUT_SECONDS", defaults.wait_timeout_secs),
        log_grace_secs: env_seconds("LOG_GRACE_SECONDS", defaults.log_grace_secs),
        follow_log_grace_secs: env_seconds(
            "FOLLOW_LOG_GRACE_SECONDS",
            defaults.follow_log_grace_secs,
        ),
    }
}

fn env_seconds(var: &str, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
