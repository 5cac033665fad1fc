use std::collections::BTreeMap;

use kube::api::{ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use log::debug;
use serde_json::Value;

use crate::{
    error::{Error, Result},
    session::ClusterSession,
};

/// Every object this crate creates carries this label so it can be found and
/// filtered from outside.
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_LABEL_VALUE: &str = "managed-by-automation";

pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        MANAGED_BY_LABEL_KEY.to_string(),
        MANAGED_BY_LABEL_VALUE.to_string(),
    )])
}

// The kinds we route natively, with their canonical casing and plural.
// Everything else falls through to the naive rule below.
fn builtin_kind(kind_lower: &str) -> Option<(&'static str, &'static str)> {
    let entry = match kind_lower {
        "pod" => ("Pod", "pods"),
        "service" => ("Service", "services"),
        "configmap" => ("ConfigMap", "configmaps"),
        "secret" => ("Secret", "secrets"),
        "persistentvolumeclaim" => ("PersistentVolumeClaim", "persistentvolumeclaims"),
        "namespace" => ("Namespace", "namespaces"),
        "deployment" => ("Deployment", "deployments"),
        "replicaset" => ("ReplicaSet", "replicasets"),
        "daemonset" => ("DaemonSet", "daemonsets"),
        "statefulset" => ("StatefulSet", "statefulsets"),
        "job" => ("Job", "jobs"),
        "cronjob" => ("CronJob", "cronjobs"),
        "ingress" => ("Ingress", "ingresses"),
        "networkpolicy" => ("NetworkPolicy", "networkpolicies"),
        _ => return None,
    };
    Some(entry)
}

/// Canonical casing for a kind, matched case-insensitively. Unknown kinds are
/// returned as given.
pub fn canonical_kind(kind: &str) -> String {
    match builtin_kind(&kind.to_lowercase()) {
        Some((canonical, _)) => canonical.to_string(),
        None => kind.to_string(),
    }
}

/// Build the routing entry for a resource from its apiVersion and kind.
///
/// Kinds outside the built-in table are pluralized as `lowercase + "s"`. That
/// heuristic is wrong for irregular plurals; it matches the behavior custom
/// resources have always had here and is kept on purpose.
pub fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };

    let kind_lower = kind.to_lowercase();
    let (kind, plural) = match builtin_kind(&kind_lower) {
        Some((canonical, plural)) => (canonical.to_string(), plural.to_string()),
        None => (kind.to_string(), format!("{kind_lower}s")),
    };

    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: api_version.to_string(),
        kind,
        plural,
    }
}

pub async fn get_resource(
    session: &ClusterSession,
    api_version: &str,
    kind: &str,
    name: &str,
    namespace: &str,
) -> Result<DynamicObject> {
    let ar = api_resource(api_version, kind);
    let api = session.dynamic(namespace, &ar);

    api.get(name)
        .await
        .map_err(|e| Error::cluster("get", &ar.kind, name, namespace, e))
}

pub async fn list_resources(
    session: &ClusterSession,
    api_version: &str,
    kind: &str,
    namespace: &str,
    label_selector: Option<&str>,
) -> Result<Vec<DynamicObject>> {
    let ar = api_resource(api_version, kind);
    let api = session.dynamic(namespace, &ar);

    let mut params = ListParams::default();
    if let Some(selector) = label_selector {
        params = params.labels(selector);
    }

    let list = api
        .list(&params)
        .await
        .map_err(|e| Error::cluster("list", &ar.kind, "*", namespace, e))?;

    debug!(
        "listed {} {} object(s) in namespace '{}'",
        list.items.len(),
        ar.kind,
        namespace
    );

    Ok(list.items)
}

/// Partial update with merge-patch semantics: supplied fields overwrite,
/// omitted fields are untouched.
pub async fn patch_resource(
    session: &ClusterSession,
    api_version: &str,
    kind: &str,
    name: &str,
    namespace: &str,
    patch: Value,
) -> Result<DynamicObject> {
    let ar = api_resource(api_version, kind);
    let api = session.dynamic(namespace, &ar);

    api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
        .await
        .map_err(|e| Error::cluster("patch", &ar.kind, name, namespace, e))
}

pub async fn delete_resource(
    session: &ClusterSession,
    api_version: &str,
    kind: &str,
    name: &str,
    namespace: &str,
) -> Result<()> {
    let ar = api_resource(api_version, kind);
    let api = session.dynamic(namespace, &ar);

    api.delete(name, &DeleteParams::default())
        .await
        .map_err(|e| Error::cluster("delete", &ar.kind, name, namespace, e))?;

    Ok(())
}
