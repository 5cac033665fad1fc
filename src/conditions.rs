use kube::api::DynamicObject;
use serde_json::Value;

use crate::resource::canonical_kind;
use crate::TerminalStatus;

/// Decide whether an observed object satisfies a named condition.
///
/// Pure and infallible: anything missing, malformed, or unknown evaluates to
/// `false` so a watch loop can feed it raw objects without crashing. Per-kind
/// rules, in priority order:
///
/// - Pod: `Ready` reads `status.conditions`; `Succeeded` and `Failed` compare
///   `status.phase`.
/// - Deployment: `Available` reads `status.conditions`.
/// - Job: `Complete` and `Failed` read `status.conditions`.
/// - StatefulSet has no native conditions, so readiness is derived from the
///   replica counters: `Ready`/`Available` means all replicas are ready,
///   `Complete` additionally requires current and updated to match, and
///   `Succeeded` means ready, updated and desired all agree.
/// - Anything else falls back to a `status.conditions` lookup by type.
pub fn evaluate(kind: &str, obj: &DynamicObject, condition: &str) -> bool {
    match (canonical_kind(kind).as_str(), condition) {
        ("Pod", "Ready") => condition_is_true(obj, "Ready"),
        ("Pod", "Succeeded" | "Failed") => phase(obj) == Some(condition),
        ("Deployment", "Available") => condition_is_true(obj, "Available"),
        ("Job", "Complete" | "Failed") => condition_is_true(obj, condition),
        ("StatefulSet", _) => stateful_set_condition(obj, condition),
        _ => condition_is_true(obj, condition),
    }
}

fn stateful_set_condition(obj: &DynamicObject, condition: &str) -> bool {
    let replicas = status_counter(obj, "replicas");
    let ready = status_counter(obj, "readyReplicas");
    let current = status_counter(obj, "currentReplicas");
    let updated = status_counter(obj, "updatedReplicas");

    match condition {
        "Ready" | "Available" => replicas > 0 && ready == replicas,
        "Complete" => {
            replicas > 0 && ready == replicas && current == updated && updated == replicas
        }
        "Succeeded" => ready == updated && updated == replicas,
        _ => condition_is_true(obj, condition),
    }
}

/// The completion predicate for a batch Job: at least one pod finished,
/// successfully or not.
pub fn job_finished(obj: &DynamicObject) -> bool {
    status_counter(obj, "succeeded") > 0 || status_counter(obj, "failed") > 0
}

/// The completion predicate for a run-to-completion Pod.
pub fn pod_finished(obj: &DynamicObject) -> bool {
    matches!(phase(obj), Some("Succeeded") | Some("Failed"))
}

pub(crate) fn pod_terminal_status(obj: &DynamicObject) -> TerminalStatus {
    match phase(obj) {
        Some("Succeeded") => TerminalStatus::Succeeded,
        Some("Failed") => TerminalStatus::Failed,
        _ => TerminalStatus::Unknown,
    }
}

pub(crate) fn job_terminal_status(obj: &DynamicObject) -> TerminalStatus {
    if status_counter(obj, "succeeded") > 0 {
        TerminalStatus::Succeeded
    } else if status_counter(obj, "failed") > 0 {
        TerminalStatus::Failed
    } else {
        TerminalStatus::Unknown
    }
}

fn status(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("status")
}

fn phase(obj: &DynamicObject) -> Option<&str> {
    status(obj)?.get("phase")?.as_str()
}

fn status_counter(obj: &DynamicObject, field: &str) -> i64 {
    status(obj)
        .and_then(|s| s.get(field))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn condition_is_true(obj: &DynamicObject, condition: &str) -> bool {
    let Some(conditions) = status(obj).and_then(|s| s.get("conditions")).and_then(Value::as_array)
    else {
        return false;
    };

    conditions.iter().any(|c| {
        c.get("type").and_then(Value::as_str) == Some(condition)
            && c.get("status").and_then(Value::as_str) == Some("True")
    })
}
