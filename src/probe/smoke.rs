//! Cluster smoke test
//!
//! One pass per cluster: log the API server version, check `aws-auth`
//! against the authentication mode, wait for the desired number of Ready
//! nodes, then wait for every system workload to report ready. All checks
//! share one deadline.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::time::Instant;
use tracing::{info, warn};

use super::readiness::{node_ready, workload_ready};
use super::topology::{authentication_modes, desired_node_counts, AuthenticationMode};
use super::{poll_until_deadline, DEFAULT_POLL_INTERVAL};
use crate::access::{ClusterAccess, ClusterClient, WorkloadKind};
use crate::stack::Resource;
use crate::Result;

const AWS_AUTH_NAMESPACE: &str = "kube-system";
const AWS_AUTH_NAME: &str = "aws-auth";

/// What a cluster should look like once it is healthy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterExpectation {
    /// Worker nodes that must be Ready; zero skips the count check
    pub desired_nodes: u32,
    /// Decides whether `aws-auth` must exist
    pub auth_mode: AuthenticationMode,
}

/// Smoke test settings
#[derive(Clone, Debug)]
pub struct SmokeTest {
    /// Deadline shared by all checks of one cluster
    pub timeout: Duration,
    /// Delay between polls
    pub poll_interval: Duration,
    /// Namespaces whose workloads must be ready
    pub system_namespaces: Vec<String>,
}

impl Default for SmokeTest {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10 * 60),
            poll_interval: DEFAULT_POLL_INTERVAL,
            system_namespaces: vec!["kube-system".to_string()],
        }
    }
}

impl SmokeTest {
    /// Smoke test every cluster, deriving expectations from the stack resources
    ///
    /// Clusters are checked concurrently; the first failure is returned.
    pub async fn run(&self, resources: &[Resource], accesses: &[ClusterAccess]) -> Result<()> {
        let counts = desired_node_counts(resources)?;
        let modes = authentication_modes(resources)?;

        let checks = accesses.iter().map(|access| {
            let expect = expectation_for(access, &counts, &modes);
            self.check_cluster(access, expect)
        });
        try_join_all(checks).await?;
        Ok(())
    }

    /// Smoke test one cluster
    pub async fn check_cluster(
        &self,
        access: &ClusterAccess,
        expect: ClusterExpectation,
    ) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let cluster = access.cluster_name.as_deref().unwrap_or("<unnamed>");

        let version = access.client.server_version().await?;
        info!(
            cluster,
            version = %version.git_version,
            platform = %version.platform,
            "API server reachable"
        );

        self.check_aws_auth(access, expect.auth_mode, deadline).await?;
        self.check_nodes(access, expect.desired_nodes, deadline).await?;
        self.check_system_workloads(access, deadline).await?;

        info!(cluster, nodes = expect.desired_nodes, "Smoke test passed");
        Ok(())
    }

    async fn check_aws_auth(
        &self,
        access: &ClusterAccess,
        mode: AuthenticationMode,
        deadline: Instant,
    ) -> Result<()> {
        let client = access.client.clone();
        let what = format!("aws-auth ConfigMap ({mode})");
        poll_until_deadline(deadline, self.poll_interval, &what, || {
            let client = client.clone();
            async move {
                let cm = client
                    .get_config_map(AWS_AUTH_NAMESPACE, AWS_AUTH_NAME)
                    .await
                    .map_err(|e| e.to_string())?;
                match (cm, mode.uses_config_map()) {
                    (Some(cm), true) if cm.data.as_ref().is_some_and(|d| !d.is_empty()) => Ok(()),
                    (Some(_), true) => Err("ConfigMap exists but has no data".to_string()),
                    (None, true) => Err(format!(
                        "ConfigMap {AWS_AUTH_NAME} not found in {AWS_AUTH_NAMESPACE}"
                    )),
                    (Some(_), false) => {
                        Err("ConfigMap exists but authentication mode is API".to_string())
                    }
                    (None, false) => Ok(()),
                }
            }
        })
        .await
    }

    async fn check_nodes(&self, access: &ClusterAccess, desired: u32, deadline: Instant) -> Result<()> {
        let client = access.client.clone();
        poll_until_deadline(deadline, self.poll_interval, "worker nodes", || {
            let client = client.clone();
            async move { nodes_ready(client.as_ref(), desired).await }
        })
        .await
    }

    async fn check_system_workloads(&self, access: &ClusterAccess, deadline: Instant) -> Result<()> {
        for namespace in &self.system_namespaces {
            for kind in WorkloadKind::SYSTEM {
                let client = access.client.clone();
                let what = format!("{kind}s in {namespace}");
                poll_until_deadline(deadline, self.poll_interval, &what, || {
                    let client = client.clone();
                    let namespace = namespace.clone();
                    async move {
                        let workloads = client
                            .list_workloads(kind, &namespace)
                            .await
                            .map_err(|e| e.to_string())?;
                        for w in &workloads {
                            workload_ready(w).map_err(|reason| {
                                format!("{kind} {namespace}/{} not ready: {reason}", w.name())
                            })?;
                        }
                        Ok(())
                    }
                })
                .await?;
            }
        }
        Ok(())
    }
}

async fn nodes_ready(client: &dyn ClusterClient, desired: u32) -> std::result::Result<(), String> {
    let nodes = client.list_nodes().await.map_err(|e| e.to_string())?;
    let count = u32::try_from(nodes.len()).unwrap_or(u32::MAX);
    if desired > 0 && count != desired {
        return Err(format!(
            "{count} out of {desired} desired worker nodes are registered"
        ));
    }
    for node in &nodes {
        node_ready(node).map_err(|reason| {
            format!(
                "node {} not ready: {reason}",
                node.metadata.name.as_deref().unwrap_or("<unnamed>")
            )
        })?;
    }
    Ok(())
}

fn expectation_for(
    access: &ClusterAccess,
    counts: &BTreeMap<String, u32>,
    modes: &BTreeMap<String, AuthenticationMode>,
) -> ClusterExpectation {
    let Some(name) = access.cluster_name.as_deref() else {
        warn!("Kubeconfig carries no cluster name, skipping node count and aws-auth mode lookup");
        return ClusterExpectation::default();
    };
    ClusterExpectation {
        desired_nodes: counts.get(name).copied().unwrap_or_default(),
        auth_mode: modes.get(name).copied().unwrap_or_default(),
    }
}
