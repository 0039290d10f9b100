//! Every object of one kind, in every namespace, is ready

use std::time::Duration;

use tracing::info;

use super::readiness::workload_ready;
use super::{poll_until, DEFAULT_POLL_INTERVAL};
use crate::access::{ClusterAccess, ClusterClient, WorkloadKind};
use crate::Result;

/// Readiness probe for one workload kind across the cluster
#[derive(Clone, Debug)]
pub struct KindReadyProbe {
    /// Kind to check
    pub kind: WorkloadKind,
    /// How long objects get to become ready
    pub grace: Duration,
    /// Delay between polls
    pub poll_interval: Duration,
    /// Whether a cluster without any object of the kind passes
    pub allow_empty: bool,
}

impl KindReadyProbe {
    /// Probe with the per-kind defaults
    ///
    /// Clusters always run Deployments, ReplicaSets and Pods, so finding none
    /// of those is a failure. DaemonSets and StatefulSets may legitimately be
    /// absent.
    pub fn new(kind: WorkloadKind) -> Self {
        Self {
            kind,
            grace: Duration::from_secs(5 * 60),
            poll_interval: DEFAULT_POLL_INTERVAL,
            allow_empty: matches!(kind, WorkloadKind::DaemonSet | WorkloadKind::StatefulSet),
        }
    }

    /// Probe for a kind given by name or alias (`deploy`, `rs`, `ds`, `sts`, `po`)
    pub fn for_kind(name: &str) -> Result<Self> {
        Ok(Self::new(name.parse()?))
    }

    /// Poll until every object of the kind is ready
    pub async fn check(&self, access: &ClusterAccess) -> Result<()> {
        let client = access.client.clone();
        let what = format!("{}s ready in all namespaces", self.kind);
        let (kind, allow_empty) = (self.kind, self.allow_empty);

        poll_until(self.grace, self.poll_interval, &what, || {
            let client = client.clone();
            async move { all_ready(client.as_ref(), kind, allow_empty).await }
        })
        .await?;

        info!(kind = %self.kind, cluster = ?access.cluster_name, "All objects ready");
        Ok(())
    }
}

async fn all_ready(
    client: &dyn ClusterClient,
    kind: WorkloadKind,
    allow_empty: bool,
) -> std::result::Result<(), String> {
    let namespaces = client.list_namespaces().await.map_err(|e| e.to_string())?;

    let mut seen = 0usize;
    for namespace in &namespaces {
        let workloads = client
            .list_workloads(kind, namespace)
            .await
            .map_err(|e| e.to_string())?;
        for w in &workloads {
            workload_ready(w)
                .map_err(|reason| format!("{kind} {namespace}/{} not ready: {reason}", w.name()))?;
        }
        seen += workloads.len();
    }

    if seen == 0 && !allow_empty {
        return Err(format!("no {kind} objects found in any namespace"));
    }
    Ok(())
}
