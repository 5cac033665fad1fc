#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid sinceTime '{0}': expected an RFC 3339 timestamp")]
    InvalidTimestamp(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("cannot load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("cannot parse inline kubeconfig: {0}")]
    KubeconfigParse(#[from] serde_yaml::Error),

    #[error("cannot build cluster client: {0}")]
    ClientBuild(#[source] kube::Error),

    #[error("{operation} {kind} '{name}' in namespace '{namespace}' failed: {source}")]
    ClusterCall {
        operation: &'static str,
        kind: String,
        name: String,
        namespace: String,
        #[source]
        source: kube::Error,
    },

    #[error("timed out after {timeout_secs}s waiting for {kind} '{name}' to reach '{condition}'")]
    WatchTimeout {
        kind: String,
        name: String,
        condition: String,
        timeout_secs: u64,
    },

    #[error("watch stream for {kind} '{name}' failed: {message}")]
    WatchStream {
        kind: String,
        name: String,
        message: String,
    },

    #[error("no pods found for job '{job}' in namespace '{namespace}'")]
    NoPodsForJob { job: String, namespace: String },
}

impl Error {
    /// Wrap a failed API call with enough context to act on.
    pub(crate) fn cluster(
        operation: &'static str,
        kind: &str,
        name: &str,
        namespace: &str,
        source: kube::Error,
    ) -> Self {
        Error::ClusterCall {
            operation,
            kind: kind.to_owned(),
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
