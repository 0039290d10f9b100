//! Single-object checks
//!
//! [`wait_for_absent`] replaces fixed sleeps after asynchronous deletes: it
//! polls until the object is really gone.

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Node;
use tracing::info;

use super::poll_until;
use crate::access::ClusterAccess;
use crate::{Error, Result};

/// An object expected to disappear
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Absent {
    /// A DaemonSet in a namespace
    DaemonSet {
        /// Namespace
        namespace: String,
        /// Name
        name: String,
    },
    /// A namespace
    Namespace(String),
}

impl fmt::Display for Absent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Absent::DaemonSet { namespace, name } => write!(f, "DaemonSet {namespace}/{name}"),
            Absent::Namespace(name) => write!(f, "Namespace {name}"),
        }
    }
}

/// Poll until `target` no longer exists
pub async fn wait_for_absent(
    access: &ClusterAccess,
    target: &Absent,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let client = access.client.clone();
    let what = format!("{target} removed");

    poll_until(timeout, poll_interval, &what, || {
        let client = client.clone();
        let target = target.clone();
        async move {
            let present = match &target {
                Absent::DaemonSet { namespace, name } => client
                    .get_daemon_set(namespace, name)
                    .await
                    .map_err(|e| e.to_string())?
                    .is_some(),
                Absent::Namespace(name) => client
                    .list_namespaces()
                    .await
                    .map_err(|e| e.to_string())?
                    .contains(name),
            };
            if present {
                Err("still present".to_string())
            } else {
                Ok(())
            }
        }
    })
    .await?;

    info!(%target, "Object removed");
    Ok(())
}

/// Fetch a DaemonSet and run `check` on it
///
/// A missing DaemonSet is a validation failure.
pub async fn validate_daemon_set<F>(
    access: &ClusterAccess,
    namespace: &str,
    name: &str,
    check: F,
) -> Result<()>
where
    F: FnOnce(&DaemonSet) -> Result<()>,
{
    let ds = access
        .client
        .get_daemon_set(namespace, name)
        .await?
        .ok_or_else(|| Error::validation(format!("DaemonSet {namespace}/{name} not found")))?;
    check(&ds)
}

/// List nodes and run `check` on them
pub async fn validate_nodes<F>(access: &ClusterAccess, check: F) -> Result<()>
where
    F: FnOnce(&[Node]) -> Result<()>,
{
    let nodes = access.client.list_nodes().await?;
    check(&nodes)
}

/// Parse a Kubernetes quantity (`104845292Ki`, `50G`, `110`) into whole units
///
/// Fractional and milli quantities are rejected; node capacities never use them.
pub fn parse_quantity(quantity: &str) -> Result<u128> {
    const SUFFIXES: &[(&str, u128)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("Ei", 1 << 60),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("E", 1_000_000_000_000_000_000),
    ];

    let quantity = quantity.trim();
    let (digits, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, m)| quantity.strip_suffix(suffix).map(|d| (d, *m)))
        .unwrap_or((quantity, 1));
    let value: u128 = digits
        .parse()
        .map_err(|_| Error::validation(format!("unsupported quantity {quantity:?}")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::validation(format!("quantity {quantity:?} overflows")))
}

/// Reported capacity of `resource` on `node`, `None` if the node lacks it
pub fn node_capacity(node: &Node, resource: &str) -> Result<Option<u128>> {
    node.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get(resource))
        .map(|q| parse_quantity(&q.0))
        .transpose()
}

/// Nodes labelled `label=true`
pub fn labelled_nodes<'a>(nodes: &'a [Node], label: &str) -> Vec<&'a Node> {
    nodes
        .iter()
        .filter(|n| {
            n.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(label))
                .is_some_and(|v| v == "true")
        })
        .collect()
}
