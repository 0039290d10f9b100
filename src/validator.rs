//! Validators: per-phase checks run against the phase's StackInfo
//!
//! The driver calls [`Validator::validate`] after a phase succeeds. A
//! validator owns its retry behaviour; the driver never retries one.
//!
//! - [`SmokeValidator`] - smoke test every cluster named by kubeconfig outputs
//! - [`KindReadyValidator`] - every object of one kind is ready
//! - [`HttpValidator`] - GET a URL taken from an output until a predicate holds
//! - [`RejectedKubeconfigValidator`] - a kubeconfig output must not work
//! - [`CompositeValidator`] - run several validators in order
//! - [`FnValidator`] - arbitrary async closure

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::info;

use crate::access::{ClusterAccess, ClusterConnector, KubeConnector};
use crate::probe::{HttpProbe, HttpResponse, KindReadyProbe, SmokeTest};
use crate::stack::StackInfo;
use crate::{Error, Result};

/// A check run after a successful phase
#[async_trait]
pub trait Validator: Send + Sync {
    /// Short name used in logs and reports
    fn name(&self) -> &str;

    /// Check the deployed system
    async fn validate(&self, info: &StackInfo) -> Result<()>;
}

async fn connect_outputs(
    connector: &dyn ClusterConnector,
    info: &StackInfo,
    outputs: &[String],
) -> Result<Vec<ClusterAccess>> {
    let mut accesses = Vec::with_capacity(outputs.len());
    for name in outputs {
        let output = info.require_output(name)?;
        let access = connector
            .connect(output)
            .await
            .map_err(|e| Error::kubeconfig(format!("output {name:?}: {e}")))?;
        accesses.push(access);
    }
    Ok(accesses)
}

// =============================================================================
// Smoke
// =============================================================================

/// Smoke test the clusters behind one or more kubeconfig outputs
pub struct SmokeValidator {
    outputs: Vec<String>,
    smoke: SmokeTest,
    connector: Arc<dyn ClusterConnector>,
}

impl SmokeValidator {
    /// Smoke test the cluster behind the `kubeconfig` output
    pub fn new() -> Self {
        Self::for_outputs(["kubeconfig"])
    }

    /// Smoke test the clusters behind the named outputs
    pub fn for_outputs<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            outputs: outputs.into_iter().map(Into::into).collect(),
            smoke: SmokeTest::default(),
            connector: Arc::new(KubeConnector),
        }
    }

    /// Override how clusters are reached
    pub fn with_connector(mut self, connector: Arc<dyn ClusterConnector>) -> Self {
        self.connector = connector;
        self
    }
}

impl Default for SmokeValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Validator for SmokeValidator {
    fn name(&self) -> &str {
        "smoke"
    }

    async fn validate(&self, info: &StackInfo) -> Result<()> {
        let accesses = connect_outputs(self.connector.as_ref(), info, &self.outputs).await?;
        self.smoke.run(&info.deployment.resources, &accesses).await
    }
}

// =============================================================================
// Kind ready
// =============================================================================

/// Every object of one kind in the cluster behind a kubeconfig output is ready
pub struct KindReadyValidator {
    name: String,
    output: String,
    probe: KindReadyProbe,
    connector: Arc<dyn ClusterConnector>,
}

impl KindReadyValidator {
    /// Check `probe.kind` in the cluster behind `output`
    pub fn new(output: impl Into<String>, probe: KindReadyProbe) -> Self {
        Self {
            name: format!("{}-ready", probe.kind).to_lowercase(),
            output: output.into(),
            probe,
            connector: Arc::new(KubeConnector),
        }
    }

    /// Override how the cluster is reached
    pub fn with_connector(mut self, connector: Arc<dyn ClusterConnector>) -> Self {
        self.connector = connector;
        self
    }
}

#[async_trait]
impl Validator for KindReadyValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, info: &StackInfo) -> Result<()> {
        let accesses =
            connect_outputs(self.connector.as_ref(), info, std::slice::from_ref(&self.output))
                .await?;
        for access in &accesses {
            self.probe.check(access).await?;
        }
        Ok(())
    }
}

// =============================================================================
// HTTP
// =============================================================================

type Predicate = Arc<dyn Fn(&HttpResponse) -> bool + Send + Sync>;

/// GET `<output><path>` until the response satisfies a predicate
pub struct HttpValidator {
    url_output: String,
    path: String,
    template: HttpProbe,
    predicate: Predicate,
}

impl HttpValidator {
    /// Probe the URL in `url_output`; succeeds on a non-empty 2xx body by default
    pub fn new(url_output: impl Into<String>) -> Self {
        Self {
            url_output: url_output.into(),
            path: String::new(),
            template: HttpProbe::new(""),
            predicate: Arc::new(|r: &HttpResponse| !r.body.is_empty()),
        }
    }

    /// Path appended to the output URL
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.template = self.template.header(name, value);
        self
    }

    /// Deadline and backoff from an existing probe; its URL is ignored
    pub fn with_probe(mut self, probe: HttpProbe) -> Self {
        self.template = probe;
        self
    }

    /// Body predicate
    pub fn predicate(mut self, predicate: impl Fn(&HttpResponse) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }
}

#[async_trait]
impl Validator for HttpValidator {
    fn name(&self) -> &str {
        "http"
    }

    async fn validate(&self, info: &StackInfo) -> Result<()> {
        let base = info.output_str(&self.url_output)?;
        let probe = HttpProbe {
            url: format!("{base}{}", self.path),
            ..self.template.clone()
        };
        let predicate = self.predicate.clone();
        probe.wait_for(move |r| predicate(r)).await?;
        Ok(())
    }
}

// =============================================================================
// Rejected credentials
// =============================================================================

/// The cluster behind a kubeconfig output must refuse its credentials
///
/// Used for kubeconfigs that depend on an AWS profile the harness does not
/// set: building the client succeeds, but the API server must not answer.
pub struct RejectedKubeconfigValidator {
    output: String,
    connector: Arc<dyn ClusterConnector>,
}

impl RejectedKubeconfigValidator {
    /// Expect the cluster behind `output` to reject requests
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            connector: Arc::new(KubeConnector),
        }
    }

    /// Override how the cluster is reached
    pub fn with_connector(mut self, connector: Arc<dyn ClusterConnector>) -> Self {
        self.connector = connector;
        self
    }
}

#[async_trait]
impl Validator for RejectedKubeconfigValidator {
    fn name(&self) -> &str {
        "rejected-kubeconfig"
    }

    async fn validate(&self, info: &StackInfo) -> Result<()> {
        let output = info.require_output(&self.output)?;
        let access = self
            .connector
            .connect(output)
            .await
            .map_err(|e| Error::kubeconfig(format!("output {:?}: {e}", self.output)))?;

        match access.client.server_version().await {
            Ok(version) => Err(Error::validation(format!(
                "expected kubeconfig {:?} to fail, but the server returned version {}",
                self.output, version.git_version
            ))),
            Err(e) => {
                info!(output = %self.output, error = %e, "Kubeconfig rejected as expected");
                Ok(())
            }
        }
    }
}

// =============================================================================
// Composite and closures
// =============================================================================

/// Runs validators in order, stopping at the first failure
pub struct CompositeValidator {
    name: String,
    validators: Vec<Arc<dyn Validator>>,
}

impl CompositeValidator {
    /// Empty composite
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            validators: Vec::new(),
        }
    }

    /// Append a validator
    pub fn then(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }
}

#[async_trait]
impl Validator for CompositeValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, info: &StackInfo) -> Result<()> {
        for v in &self.validators {
            v.validate(info)
                .await
                .map_err(|e| Error::validation(format!("{}: {e}", v.name())))?;
            info!(validator = v.name(), composite = %self.name, "Validator passed");
        }
        Ok(())
    }
}

type BoxedCheck = Box<dyn Fn(StackInfo) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Validator built from an async closure
///
/// The closure receives its own copy of the StackInfo so it can move it into
/// spawned work.
pub struct FnValidator {
    name: String,
    check: BoxedCheck,
}

impl FnValidator {
    /// Wrap `check` under `name`
    pub fn new<F, Fut>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(StackInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            check: Box::new(move |info| check(info).boxed()),
        }
    }
}

impl fmt::Debug for FnValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnValidator").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Validator for FnValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, info: &StackInfo) -> Result<()> {
        (self.check)(info.clone()).await
    }
}
