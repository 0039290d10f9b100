//! Provisioner abstraction
//!
//! The infrastructure-provisioning tool is a black box driven through its CLI.
//! The [`Provisioner`] trait names the subcommands the drivers rely on; the
//! real implementation shells out to the `pulumi` binary ([`PulumiCli`]).

mod pulumi;

pub use pulumi::{pin_provider, PulumiCli};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

use crate::scenario::ConfigValue;
use crate::Result;

/// Identifies one stack inside one working copy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackContext {
    /// Working copy of the program
    pub workdir: PathBuf,
    /// Stack name
    pub stack: String,
    /// Extra environment for every invocation
    pub env: BTreeMap<String, String>,
    /// Trace collector for this stack, overriding the provisioner default
    pub tracing_endpoint: Option<String>,
}

/// Options for `preview`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PreviewOptions {
    /// Fail if the preview proposes any change
    pub expect_no_changes: bool,
    /// Request machine-readable output so the change summary can be parsed
    pub json: bool,
}

/// Options for `up`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpOptions {
    /// Fail if the update performs any change
    pub expect_no_changes: bool,
}

/// Operations that count as replacing a resource
const REPLACE_OPS: &[&str] = &["replace", "create-replacement", "delete-replaced"];

/// Summary of a preview: operation counts plus the URNs slated for replacement
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    /// Count per operation (`create`, `update`, `same`, `replace`, ...)
    pub counts: BTreeMap<String, u64>,
    /// URNs of resources the preview would replace
    pub replaced: Vec<String>,
}

impl ChangeSummary {
    /// Parse the document printed by `preview --json`
    pub fn from_preview_json(doc: &Value) -> Self {
        let counts: BTreeMap<String, u64> = doc
            .get("changeSummary")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(op, n)| n.as_u64().map(|n| (op.clone(), n)))
                    .collect()
            })
            .unwrap_or_default();

        let mut replaced: Vec<String> = doc
            .get("steps")
            .and_then(Value::as_array)
            .map(|steps| {
                steps
                    .iter()
                    .filter(|s| {
                        s.get("op")
                            .and_then(Value::as_str)
                            .is_some_and(|op| REPLACE_OPS.contains(&op))
                    })
                    .filter_map(|s| s.get("urn").and_then(Value::as_str).map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        replaced.sort();
        replaced.dedup();

        Self { counts, replaced }
    }

    /// Number of resources the preview would replace
    pub fn replacements(&self) -> u64 {
        let counted: u64 = REPLACE_OPS
            .iter()
            .filter_map(|op| self.counts.get(*op))
            .sum();
        counted.max(self.replaced.len() as u64)
    }

    /// Number of resources that would change in any way
    pub fn changes(&self) -> u64 {
        self.counts
            .iter()
            .filter(|(op, _)| op.as_str() != "same")
            .map(|(_, n)| n)
            .sum()
    }
}

/// The provisioner CLI's subcommands as the drivers use them
///
/// This trait abstracts subprocess execution for testability.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Install the program's packages and link each dependency into it
    async fn install_dependencies(&self, workdir: &Path, deps: &[String]) -> Result<()>;

    /// Create the stack
    async fn init_stack(&self, ctx: &StackContext) -> Result<()>;

    /// Set one config entry on the stack
    async fn set_config(&self, ctx: &StackContext, entry: &ConfigValue) -> Result<()>;

    /// Preview the program
    async fn preview(&self, ctx: &StackContext, opts: PreviewOptions) -> Result<ChangeSummary>;

    /// Deploy the program
    async fn up(&self, ctx: &StackContext, opts: UpOptions) -> Result<()>;

    /// Refresh stack state from the cloud
    async fn refresh(&self, ctx: &StackContext, expect_no_changes: bool) -> Result<()>;

    /// Destroy every resource of the stack
    async fn destroy(&self, ctx: &StackContext) -> Result<()>;

    /// Delete the stack; `force` also drops state that still lists resources
    async fn remove_stack(&self, ctx: &StackContext, force: bool) -> Result<()>;

    /// Exported stack state (`stack export`)
    async fn export_stack(&self, ctx: &StackContext) -> Result<Value>;

    /// Replace the stack state (`stack import`)
    async fn import_stack(&self, ctx: &StackContext, state: &Value) -> Result<()>;

    /// Stack outputs as a JSON object
    async fn stack_outputs(&self, ctx: &StackContext) -> Result<Value>;

    /// Make a resource plugin version available locally, returning its directory
    async fn install_plugin(&self, name: &str, version: &str) -> Result<PathBuf>;

    /// Point the program's provider plugin `name` at the binary in `plugin_dir`
    async fn pin_plugin(&self, workdir: &Path, name: &str, plugin_dir: &Path) -> Result<()>;
}
