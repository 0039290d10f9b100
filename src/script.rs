//! Shell scripts run from validators (drain nodes, delete DaemonSets, ...)

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::output_tail;
use crate::{Error, Result};

/// Run `path` with bash and return its combined output
///
/// The script runs in its own directory with `env` added to the inherited
/// environment. A non-zero exit is a validation failure carrying the output
/// tail; the process is killed once `timeout` elapses.
pub async fn run_script(
    path: &Path,
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<String> {
    let path = &std::fs::canonicalize(path)
        .map_err(|e| Error::io(format!("resolving script {}", path.display()), e))?;
    let mut cmd = Command::new("bash");
    cmd.arg(path).kill_on_drop(true).envs(env);
    if let Some(dir) = path.parent() {
        cmd.current_dir(dir);
    }

    info!(script = %path.display(), "Running script");
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| Error::timeout(format!("script {}", path.display()), timeout))?
        .map_err(|e| Error::io(format!("running {}", path.display()), e))?;

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    let text = output_tail(&combined);

    if output.status.success() {
        Ok(text)
    } else {
        warn!(script = %path.display(), exit_code = ?output.status.code(), "Script failed");
        Err(Error::validation(format!(
            "script {} exited with {:?}:\n{text}",
            path.display(),
            output.status.code()
        )))
    }
}
