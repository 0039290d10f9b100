//! Scenario report sinks
//!
//! Reports are fire-and-forget: [`publish_in_background`] spawns the upload
//! and only logs when it fails. A broken sink never fails a scenario.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::StatsTarget;
use crate::error::ProvisionerFailure;
use crate::{Error, Result};

/// Destination for JSON scenario reports
#[async_trait]
pub trait StatsSink: Send + Sync {
    /// Store `report` under `name`
    async fn publish(&self, name: &str, report: &Value) -> Result<()>;
}

/// Uploads reports with `aws s3 cp - s3://<bucket>/<prefix>/<name>.json`
#[derive(Clone, Debug)]
pub struct S3CliSink {
    target: StatsTarget,
    aws_bin: PathBuf,
}

impl S3CliSink {
    /// Sink for `target` using the `aws` CLI on PATH
    pub fn new(target: StatsTarget) -> Self {
        Self {
            target,
            aws_bin: PathBuf::from("aws"),
        }
    }

    /// Use a specific `aws` binary
    pub fn with_aws_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.aws_bin = bin.into();
        self
    }

    /// Object URL for a report name
    pub fn object_url(&self, name: &str) -> String {
        let prefix = self.target.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("s3://{}/{name}.json", self.target.bucket)
        } else {
            format!("s3://{}/{prefix}/{name}.json", self.target.bucket)
        }
    }
}

#[async_trait]
impl StatsSink for S3CliSink {
    async fn publish(&self, name: &str, report: &Value) -> Result<()> {
        let url = self.object_url(name);
        let body = serde_json::to_vec(report)?;
        let display = format!(
            "{} s3 cp - {url} --region {}",
            self.aws_bin.display(),
            self.target.region
        );

        let mut child = Command::new(&self.aws_bin)
            .args(["s3", "cp", "-", url.as_str(), "--region", self.target.region.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::io(format!("spawning {display}"), e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&body)
                .await
                .map_err(|e| Error::io("writing report to aws s3 cp", e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::io(format!("waiting for {display}"), e))?;
        if !output.status.success() {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            return Err(ProvisionerFailure::new(display, output.status.code(), &combined).into());
        }
        debug!(url = %url, "Uploaded scenario report");
        Ok(())
    }
}

/// Writes reports as `<dir>/<name>.json`
#[derive(Clone, Debug)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    /// Sink writing into `dir`, created on first use
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl StatsSink for DirectorySink {
    async fn publish(&self, name: &str, report: &Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::io(format!("creating {}", self.dir.display()), e))?;
        let path = self.dir.join(format!("{name}.json"));
        tokio::fs::write(&path, serde_json::to_vec_pretty(report)?)
            .await
            .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
        debug!(path = %path.display(), "Wrote scenario report");
        Ok(())
    }
}

/// Publish without waiting; failures are logged
///
/// The handle can be awaited by callers that must not exit before the upload
/// finishes.
pub fn publish_in_background(
    sink: Arc<dyn StatsSink>,
    name: String,
    report: Value,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = sink.publish(&name, &report).await {
            warn!(report = %name, error = %e, "Failed to publish scenario report");
        }
    })
}
