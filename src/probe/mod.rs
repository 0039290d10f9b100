//! Probe Library
//!
//! Read-only assertions against a deployed system. Every probe polls until its
//! condition holds or its deadline elapses, then reports the last violation it
//! observed. Probes never mutate the cluster.
//!
//! - [`smoke`] - nodes Ready, system workloads Available, aws-auth as expected
//! - [`kind`] - every object of one kind across all namespaces is ready
//! - [`http`] - GET with backoff until a body predicate holds
//! - [`objects`] - single-object checks and absence waits
//! - [`readiness`] - per-kind readiness rules
//! - [`topology`] - expected node counts and auth modes from stack resources

pub mod http;
pub mod kind;
pub mod objects;
pub mod readiness;
pub mod smoke;
pub mod topology;

pub use http::{HttpProbe, HttpResponse};
pub use kind::KindReadyProbe;
pub use objects::{
    labelled_nodes, node_capacity, parse_quantity, validate_daemon_set, validate_nodes,
    wait_for_absent, Absent,
};
pub use smoke::{ClusterExpectation, SmokeTest};
pub use topology::AuthenticationMode;

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::{Error, Result};

/// Poll interval used by the cluster probes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Poll until `check` succeeds or `timeout` elapses
///
/// `check` returns `Err(violation)` while the condition does not hold. On
/// timeout the last violation becomes the failure message.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    what: &str,
    check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), String>>,
{
    poll_until_deadline(Instant::now() + timeout, poll_interval, what, check).await
}

/// Like [`poll_until`] against an absolute deadline shared by several checks
///
/// The check always runs at least once, even if the deadline has passed.
pub async fn poll_until_deadline<F, Fut>(
    deadline: Instant,
    poll_interval: Duration,
    what: &str,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), String>>,
{
    loop {
        let violation = match check().await {
            Ok(()) => return Ok(()),
            Err(v) => v,
        };

        if Instant::now() + poll_interval > deadline {
            return Err(Error::validation(format!("{what}: {violation}")));
        }
        trace!(check = %what, violation = %violation, "Condition not yet met, retrying");
        tokio::time::sleep(poll_interval).await;
    }
}
