use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::{
    api::{Api, DynamicObject},
    runtime::watcher,
};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    conditions,
    config::DEFAULT_WAIT_TIMEOUT_SECS,
    error::{Error, Result},
    resource,
    session::ClusterSession,
};

/// One wait for one object to reach one condition.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub condition: String,
    pub timeout: Duration,
    /// Fired by the caller to abandon the wait early.
    pub cancel: CancellationToken,
}

impl WatchRequest {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        WatchRequest {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            condition: condition.into(),
            timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
            cancel: CancellationToken::new(),
        }
    }

    /// Timeouts are expressed in whole seconds at the boundary.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

/// How a wait ended. Every wait produces exactly one of these.
#[derive(Debug)]
pub enum ConditionOutcome {
    /// The condition held; carries the object observed at that moment.
    Met(Box<DynamicObject>),
    /// The deadline elapsed first.
    TimedOut,
    /// The watch stream failed in a way the client does not retry.
    StreamError(String),
    /// The caller cancelled the wait. Not a failure.
    Aborted,
}

impl ConditionOutcome {
    /// Collapse an outcome into the hard-error form used by the run
    /// pipelines: `Met` yields the object, `Aborted` yields `None` (the
    /// caller decided to stop, which is not an error), everything else is
    /// promoted to an error carrying the wait's identity.
    pub fn into_waited(
        self,
        kind: &str,
        name: &str,
        condition: &str,
        timeout: Duration,
    ) -> Result<Option<Box<DynamicObject>>> {
        match self {
            ConditionOutcome::Met(obj) => Ok(Some(obj)),
            ConditionOutcome::Aborted => Ok(None),
            ConditionOutcome::TimedOut => Err(Error::WatchTimeout {
                kind: kind.to_owned(),
                name: name.to_owned(),
                condition: condition.to_owned(),
                timeout_secs: timeout.as_secs(),
            }),
            ConditionOutcome::StreamError(message) => Err(Error::WatchStream {
                kind: kind.to_owned(),
                name: name.to_owned(),
                message,
            }),
        }
    }
}

/// Wait until the named object satisfies the named condition, as judged by
/// [`conditions::evaluate`].
pub async fn wait_for_condition(session: &ClusterSession, req: &WatchRequest) -> ConditionOutcome {
    let ar = resource::api_resource(&req.api_version, &req.kind);
    let api = session.dynamic(&req.namespace, &ar);
    let eval_kind = ar.kind.clone();
    let condition = req.condition.clone();

    wait_for(
        api,
        &ar.kind,
        &req.name,
        move |obj| conditions::evaluate(&eval_kind, obj, &condition),
        req.timeout,
        &req.cancel,
    )
    .await
}

/// Open a watch on the object's collection and drive [`wait_on_events`] over
/// it. The watch is collection-scoped because that is what the cluster offers;
/// filtering down to the one object we care about happens per event.
pub(crate) async fn wait_for<P>(
    api: Api<DynamicObject>,
    kind: &str,
    name: &str,
    predicate: P,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ConditionOutcome
where
    P: Fn(&DynamicObject) -> bool,
{
    debug!("watching {kind} '{name}' for up to {}s", timeout.as_secs());

    let events = watcher(api, watcher::Config::default()).boxed();
    let outcome = wait_on_events(events, name, predicate, timeout, cancel).await;

    match &outcome {
        ConditionOutcome::Met(_) => info!("{kind} '{name}' reached the awaited state"),
        ConditionOutcome::TimedOut => warn!("gave up waiting for {kind} '{name}'"),
        ConditionOutcome::StreamError(e) => warn!("watch stream for {kind} '{name}' failed: {e}"),
        ConditionOutcome::Aborted => debug!("wait for {kind} '{name}' was cancelled"),
    }

    outcome
}

/// The wait loop itself, factored over an arbitrary event stream.
///
/// Three things race: the cancellation token, the deadline, and the next
/// stream event. The loop has a single exit per outcome, so a wait resolves
/// exactly once no matter how many further events the stream could produce;
/// whatever is still buffered is dropped with the stream.
async fn wait_on_events<S, P, E>(
    mut events: S,
    name: &str,
    predicate: P,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ConditionOutcome
where
    S: Stream<Item = Result<watcher::Event<DynamicObject>, E>> + Unpin,
    P: Fn(&DynamicObject) -> bool,
    E: std::fmt::Display,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return ConditionOutcome::Aborted,
            _ = &mut deadline => return ConditionOutcome::TimedOut,
            event = events.next() => match event {
                Some(Ok(event)) => {
                    if let Some(obj) = matching_object(event, name) {
                        if predicate(&obj) {
                            return ConditionOutcome::Met(Box::new(obj));
                        }
                    }
                }
                Some(Err(e)) => return ConditionOutcome::StreamError(e.to_string()),
                None => {
                    return ConditionOutcome::StreamError(
                        "watch stream ended unexpectedly".to_string(),
                    )
                }
            }
        }
    }
}

/// Pick the watched object out of a collection event, if this event is about
/// it. Deletions don't count: an object that is gone can no longer meet a
/// condition.
fn matching_object(event: watcher::Event<DynamicObject>, name: &str) -> Option<DynamicObject> {
    match event {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj)
            if obj.metadata.name.as_deref() == Some(name) =>
        {
            Some(obj)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::api_resource;
    use futures::stream;
    use serde_json::json;

    type SyntheticEvent = Result<watcher::Event<DynamicObject>, &'static str>;

    fn pod(name: &str, phase: &str) -> DynamicObject {
        DynamicObject::new(name, &api_resource("v1", "Pod"))
            .data(json!({ "status": { "phase": phase } }))
    }

    fn succeeded_pod(obj: &DynamicObject) -> bool {
        conditions::evaluate("Pod", obj, "Succeeded")
    }

    #[tokio::test]
    async fn resolves_met_once_despite_trailing_events() {
        // Duplicate matches and a stream error follow the first match. None
        // of them may change the outcome.
        let events = stream::iter(vec![
            Ok(watcher::Event::Apply(pod("other", "Succeeded"))),
            Ok(watcher::Event::Apply(pod("target", "Running"))),
            Ok(watcher::Event::Apply(pod("target", "Succeeded"))),
            Err("watch connection reset"),
            Ok(watcher::Event::Apply(pod("target", "Succeeded"))),
        ]);

        let outcome = wait_on_events(
            events,
            "target",
            succeeded_pod,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await;

        match outcome {
            ConditionOutcome::Met(obj) => {
                assert_eq!(obj.metadata.name.as_deref(), Some("target"));
            }
            other => panic!("expected Met, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_for_other_objects_are_ignored() {
        let events = stream::iter::<Vec<SyntheticEvent>>(vec![
            Ok(watcher::Event::Apply(pod("decoy", "Succeeded"))),
            Ok(watcher::Event::InitApply(pod("target", "Succeeded"))),
        ]);

        let outcome = wait_on_events(
            events,
            "target",
            succeeded_pod,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(outcome, ConditionOutcome::Met(_)));
    }

    #[tokio::test]
    async fn deletions_never_satisfy_the_wait() {
        let events = stream::iter(vec![
            Ok(watcher::Event::Delete(pod("target", "Succeeded"))),
            Err("watch connection reset"),
        ]);

        let outcome = wait_on_events(
            events,
            "target",
            succeeded_pod,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(outcome, ConditionOutcome::StreamError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_the_deadline_not_before() {
        let start = tokio::time::Instant::now();

        let outcome = wait_on_events(
            stream::pending::<SyntheticEvent>(),
            "target",
            succeeded_pod,
            Duration::from_secs(300),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(outcome, ConditionOutcome::TimedOut));
        assert!(start.elapsed() >= Duration::from_secs(300));
    }

    #[tokio::test]
    async fn cancellation_wins_over_a_silent_stream() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = wait_on_events(
            stream::pending::<SyntheticEvent>(),
            "target",
            succeeded_pod,
            Duration::from_secs(300),
            &cancel,
        )
        .await;

        assert!(matches!(outcome, ConditionOutcome::Aborted));
    }

    #[tokio::test]
    async fn stream_errors_surface_as_stream_error() {
        let events = stream::iter::<Vec<SyntheticEvent>>(vec![Err("watch connection reset")]);

        let outcome = wait_on_events(
            events,
            "target",
            succeeded_pod,
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(outcome, ConditionOutcome::StreamError(_)));
    }

    #[test]
    fn outcomes_collapse_into_pipeline_results() {
        let met = ConditionOutcome::Met(Box::new(pod("target", "Succeeded")))
            .into_waited("Pod", "target", "Succeeded", Duration::from_secs(1));
        assert!(matches!(met, Ok(Some(_))));

        let aborted = ConditionOutcome::Aborted.into_waited(
            "Pod",
            "target",
            "Succeeded",
            Duration::from_secs(1),
        );
        assert!(matches!(aborted, Ok(None)));

        let timed_out = ConditionOutcome::TimedOut.into_waited(
            "Pod",
            "target",
            "Succeeded",
            Duration::from_secs(1),
        );
        assert!(matches!(timed_out, Err(Error::WatchTimeout { .. })));

        let failed = ConditionOutcome::StreamError("boom".into()).into_waited(
            "Pod",
            "target",
            "Succeeded",
            Duration::from_secs(1),
        );
        assert!(matches!(failed, Err(Error::WatchStream { .. })));
    }
}
