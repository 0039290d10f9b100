//! Scoped mutation of the process environment
//!
//! The environment is shared by every scenario in the test binary. Changes go
//! through [`ScopedEnv`], which holds a process-wide lock for its lifetime and
//! restores every touched variable when dropped, including on panic.

use std::ffi::OsString;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::{Error, Result};

static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Exclusive, self-restoring access to the process environment
pub struct ScopedEnv {
    saved: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl ScopedEnv {
    /// Wait for exclusive access
    pub async fn acquire() -> Self {
        Self {
            saved: Vec::new(),
            _guard: ENV_LOCK.lock().await,
        }
    }

    fn remember(&mut self, key: &str) {
        if !self.saved.iter().any(|(k, _)| k == key) {
            self.saved.push((key.to_string(), std::env::var_os(key)));
        }
    }

    /// Set `key` until the guard is dropped
    pub fn set(&mut self, key: &str, value: impl AsRef<std::ffi::OsStr>) {
        self.remember(key);
        std::env::set_var(key, value);
    }

    /// Unset `key` until the guard is dropped
    pub fn remove(&mut self, key: &str) {
        self.remember(key);
        std::env::remove_var(key);
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..).rev() {
            match value {
                Some(v) => std::env::set_var(&key, v),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// A kubeconfig written to a temp file and exported as `KUBECONFIG`
///
/// The file is deleted and `KUBECONFIG` restored when this is dropped.
pub struct ScopedKubeconfig {
    file: NamedTempFile,
    _env: ScopedEnv,
}

impl ScopedKubeconfig {
    /// Write `raw` and point `KUBECONFIG` at it
    pub async fn install(raw: &str) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("kubeconfig-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| Error::io("creating kubeconfig temp file", e))?;
        file.write_all(raw.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| Error::io("writing kubeconfig temp file", e))?;

        let mut env = ScopedEnv::acquire().await;
        env.set("KUBECONFIG", file.path());
        debug!(path = %file.path().display(), "Exported KUBECONFIG");

        Ok(Self { file, _env: env })
    }

    /// Path of the kubeconfig file
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}
