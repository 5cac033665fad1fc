use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
    batch::v1::{CronJob, Job},
    core::v1::{ConfigMap, Namespace, PersistentVolumeClaim, Pod, Secret, Service},
    networking::v1::{Ingress, NetworkPolicy},
};
use kube::{
    api::{ApiResource, DynamicObject},
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config,
};
use log::debug;

use crate::{
    config::ClusterConfigSource,
    error::{Error, Result},
};

/// A resolved cluster connection. Built once per invocation, immutable after,
/// and handed to every operation that talks to the cluster.
#[derive(Clone)]
pub struct ClusterSession {
    client: Client,
}

impl ClusterSession {
    pub async fn connect(source: &ClusterConfigSource) -> Result<Self> {
        let client = match source {
            ClusterConfigSource::Ambient => {
                Client::try_default().await.map_err(Error::ClientBuild)?
            }
            ClusterConfigSource::File(path) => {
                debug!("loading kubeconfig from {}", path.display());
                let kubeconfig = Kubeconfig::read_from(path)?;
                Self::client_from_kubeconfig(kubeconfig).await?
            }
            ClusterConfigSource::Inline(content) => {
                let kubeconfig: Kubeconfig = serde_yaml::from_str(content)?;
                Self::client_from_kubeconfig(kubeconfig).await?
            }
        };

        Ok(ClusterSession { client })
    }

    async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client> {
        let config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        Client::try_from(config).map_err(Error::ClientBuild)
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    // core

    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn persistent_volume_claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    // apps

    pub fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn replica_sets(&self, namespace: &str) -> Api<ReplicaSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn daemon_sets(&self, namespace: &str) -> Api<DaemonSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn stateful_sets(&self, namespace: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    // batch

    pub fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn cron_jobs(&self, namespace: &str) -> Api<CronJob> {
        Api::namespaced(self.client.clone(), namespace)
    }

    // networking

    pub fn ingresses(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn network_policies(&self, namespace: &str) -> Api<NetworkPolicy> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Untyped access for custom resources and for the generic watch path.
    pub fn dynamic(&self, namespace: &str, resource: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}
