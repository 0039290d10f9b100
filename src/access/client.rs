//! Read-only Kubernetes capabilities the probes need

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod};
use k8s_openapi::apimachinery::pkg::version::Info;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Workload kinds the readiness probes understand
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 ReplicaSet
    ReplicaSet,
    /// apps/v1 DaemonSet
    DaemonSet,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// v1 Pod
    Pod,
}

impl WorkloadKind {
    /// Kinds checked in system namespaces by the smoke test
    pub const SYSTEM: [WorkloadKind; 3] = [
        WorkloadKind::Deployment,
        WorkloadKind::DaemonSet,
        WorkloadKind::ReplicaSet,
    ];
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::Pod => "Pod",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkloadKind {
    type Err = Error;

    /// Accepts kind names, plurals, and kubectl short names
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => Ok(WorkloadKind::Deployment),
            "replicaset" | "replicasets" | "rs" => Ok(WorkloadKind::ReplicaSet),
            "daemonset" | "daemonsets" | "ds" => Ok(WorkloadKind::DaemonSet),
            "statefulset" | "statefulsets" | "sts" => Ok(WorkloadKind::StatefulSet),
            "pod" | "pods" | "po" => Ok(WorkloadKind::Pod),
            other => Err(Error::probe(format!("unknown kind type: {other}"))),
        }
    }
}

/// A listed workload object
#[derive(Clone, Debug)]
pub enum Workload {
    /// Deployment
    Deployment(Deployment),
    /// ReplicaSet
    ReplicaSet(ReplicaSet),
    /// DaemonSet
    DaemonSet(DaemonSet),
    /// StatefulSet
    StatefulSet(StatefulSet),
    /// Pod
    Pod(Pod),
}

impl Workload {
    /// Kind of the wrapped object
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::ReplicaSet(_) => WorkloadKind::ReplicaSet,
            Workload::DaemonSet(_) => WorkloadKind::DaemonSet,
            Workload::StatefulSet(_) => WorkloadKind::StatefulSet,
            Workload::Pod(_) => WorkloadKind::Pod,
        }
    }

    /// Object name
    pub fn name(&self) -> String {
        match self {
            Workload::Deployment(o) => o.name_any(),
            Workload::ReplicaSet(o) => o.name_any(),
            Workload::DaemonSet(o) => o.name_any(),
            Workload::StatefulSet(o) => o.name_any(),
            Workload::Pod(o) => o.name_any(),
        }
    }
}

/// Cluster queries used by the probes
///
/// This trait abstracts the Kubernetes API for testability.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// API server version
    async fn server_version(&self) -> Result<Info>;

    /// All nodes
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Names of all namespaces
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    /// Objects of `kind` in `namespace`
    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>>;

    /// A ConfigMap, `None` if it does not exist
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// A DaemonSet, `None` if it does not exist
    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>>;
}

/// [`ClusterClient`] backed by a kube client
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn list_in<K>(&self, namespace: &str) -> Result<Vec<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn server_version(&self) -> Result<Info> {
        Ok(self.client.apiserver_version().await?)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .map(|ns| ns.name_any())
            .collect())
    }

    async fn list_workloads(&self, kind: WorkloadKind, namespace: &str) -> Result<Vec<Workload>> {
        let items = match kind {
            WorkloadKind::Deployment => self
                .list_in::<Deployment>(namespace)
                .await?
                .into_iter()
                .map(Workload::Deployment)
                .collect(),
            WorkloadKind::ReplicaSet => self
                .list_in::<ReplicaSet>(namespace)
                .await?
                .into_iter()
                .map(Workload::ReplicaSet)
                .collect(),
            WorkloadKind::DaemonSet => self
                .list_in::<DaemonSet>(namespace)
                .await?
                .into_iter()
                .map(Workload::DaemonSet)
                .collect(),
            WorkloadKind::StatefulSet => self
                .list_in::<StatefulSet>(namespace)
                .await?
                .into_iter()
                .map(Workload::StatefulSet)
                .collect(),
            WorkloadKind::Pod => self
                .list_in::<Pod>(namespace)
                .await?
                .into_iter()
                .map(Workload::Pod)
                .collect(),
        };
        Ok(items)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}
