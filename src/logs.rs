use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{AsyncBufReadExt, TryStreamExt};
use kube::api::LogParams;
use log::{debug, warn};
use serde_json::Value;

use crate::{
    config::{DEFAULT_FOLLOW_LOG_GRACE_SECS, DEFAULT_LOG_GRACE_SECS},
    error::{Error, Result},
    session::ClusterSession,
};

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub container: Option<String>,
    pub tail_lines: Option<i64>,
    /// RFC 3339 timestamp. Validated before any stream is opened.
    pub since_time: Option<String>,
    pub follow: bool,
    /// Overrides the watchdog. Without it, follow mode gets the longer
    /// default cap and plain collection the shorter one.
    pub grace: Option<Duration>,
}

impl LogOptions {
    fn grace(&self) -> Duration {
        self.grace.unwrap_or_else(|| {
            if self.follow {
                Duration::from_secs(DEFAULT_FOLLOW_LOG_GRACE_SECS)
            } else {
                Duration::from_secs(DEFAULT_LOG_GRACE_SECS)
            }
        })
    }
}

/// Stream a container's logs and return whatever accumulated by the time the
/// stream ends or the watchdog fires. Logs can legitimately stop flowing
/// before the stream formally closes, so hitting the watchdog is a normal way
/// to finish, not an error.
pub async fn collect(
    session: &ClusterSession,
    namespace: &str,
    pod_name: &str,
    opts: &LogOptions,
) -> Result<String> {
    let mut params = LogParams {
        container: opts.container.clone(),
        follow: opts.follow,
        tail_lines: opts.tail_lines,
        ..LogParams::default()
    };

    // Validate before touching the cluster.
    if let Some(raw) = &opts.since_time {
        params.since_time = Some(parse_since_time(raw)?);
    }

    let pods = session.pods(namespace);
    let reader = pods
        .log_stream(pod_name, &params)
        .await
        .map_err(|e| Error::cluster("read logs of", "Pod", pod_name, namespace, e))?;

    let mut lines = reader.lines();
    let mut buffer = String::new();

    let drain = async {
        loop {
            match lines.try_next().await {
                Ok(Some(line)) => {
                    buffer.push_str(&line);
                    buffer.push('\n');
                }
                Ok(None) => break,
                Err(e) => {
                    // Keep what we have; a torn log stream should not erase
                    // the output that already arrived.
                    warn!("log stream for pod '{pod_name}' ended early: {e}");
                    break;
                }
            }
        }
    };

    let grace = opts.grace();
    if tokio::time::timeout(grace, drain).await.is_err() {
        debug!(
            "log collection for pod '{pod_name}' stopped by the {}s watchdog",
            grace.as_secs()
        );
    }

    Ok(buffer)
}

/// Captured output is handed back as JSON when it parses as JSON and as the
/// raw string otherwise. Applied uniformly to everything we collect.
pub fn parse_maybe_json(text: &str) -> Value {
    serde_json::from_str(text.trim()).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn parse_since_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| Error::InvalidTimestamp(raw.to_string()))
}
