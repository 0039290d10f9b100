//! Scenario model: a declarative deploy / edit / teardown exercise
//!
//! A [`Scenario`] is built once through [`ScenarioBuilder`], handed by value to
//! the [`ScenarioDriver`](crate::driver::ScenarioDriver), and dropped after the
//! run. Suites share defaults by cloning a base builder and layering
//! per-scenario settings on top.

mod state;

pub use state::ScenarioState;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::StatsTarget;
use crate::validator::Validator;
use crate::{Error, Result};

/// A single `config set` entry with its flags
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigValue {
    /// Config key, e.g. `aws:region`
    pub key: String,
    /// Value as the CLI receives it
    pub value: String,
    /// Key is a property path (`--path`)
    pub path: bool,
    /// Store encrypted (`--secret`)
    pub secret: bool,
}

impl ConfigValue {
    /// Plain key/value entry
    pub fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            path: false,
            secret: false,
        }
    }

    /// Entry whose key is a property path
    pub fn path(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            path: true,
            ..Self::plain(key, value)
        }
    }
}

/// An additive overlay applied to the working copy between deploys
#[derive(Clone)]
pub struct Edit {
    /// Directory whose files are copied onto the working copy
    pub dir: PathBuf,
    /// Runs after the edit has been deployed
    pub validate: Option<Arc<dyn Validator>>,
}

impl Edit {
    /// Overlay without validation
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            validate: None,
        }
    }

    /// Attach a validator for the post-edit deploy
    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validate = Some(Arc::new(validator));
        self
    }
}

impl fmt::Debug for Edit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edit")
            .field("dir", &self.dir)
            .field("validate", &self.validate.as_ref().map(|v| v.name()))
            .finish()
    }
}

/// Behavioural switches of a scenario
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// A failing `up` (or preview, in preview-only mode) is the success condition
    pub expect_failure: bool,
    /// Refresh may report drift
    pub expect_refresh_changes: bool,
    /// Skip the post-deploy refresh
    pub skip_refresh: bool,
    /// Only `up` and `destroy`; no preview, no refresh
    pub quick: bool,
    /// Retry provisioner steps on transient failures
    pub retry_failed_steps: bool,
    /// Re-run preview + up on the final program and require zero diff
    pub run_update_test: bool,
    /// A failed destroy is logged instead of failing an otherwise green run
    pub ignore_destroy_errors: bool,
    /// Only preview the program; nothing is deployed
    pub preview_only: bool,
}

/// External sinks a scenario reports to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sinks {
    /// Stats bucket for the run report
    pub stats: Option<StatsTarget>,
    /// Trace collector passed to the provisioner
    pub tracing_endpoint: Option<String>,
}

/// A fully specified scenario
#[derive(Clone)]
pub struct Scenario {
    /// Display name, derived from the program directory unless set
    pub name: String,
    /// Absolute path of the initial program
    pub dir: PathBuf,
    /// Ordered config entries, unique by key
    pub config: Vec<ConfigValue>,
    /// Packages linked into the working copy before the first deploy
    pub deps: Vec<String>,
    /// Extra environment for provisioner processes
    pub env: BTreeMap<String, String>,
    /// Overlays applied in order after the initial deploy
    pub edits: Vec<Edit>,
    /// Runs after the initial deploy
    pub validate: Option<Arc<dyn Validator>>,
    /// Behavioural switches
    pub flags: Flags,
    /// Report and trace sinks
    pub sinks: Sinks,
    /// Explicit stack name; generated when absent
    pub stack_name: Option<String>,
}

impl Scenario {
    /// Start building a scenario for the program at `dir`
    pub fn builder(dir: impl Into<PathBuf>) -> ScenarioBuilder {
        ScenarioBuilder::default().dir(dir)
    }

    /// Config value for `key`, if set
    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.value.as_str())
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("config", &self.config)
            .field("deps", &self.deps)
            .field("edits", &self.edits)
            .field("validate", &self.validate.as_ref().map(|v| v.name()))
            .field("flags", &self.flags)
            .finish()
    }
}

/// Builder for [`Scenario`]
///
/// Cloning a configured builder is how suites share base options:
///
/// ```ignore
/// let base = Scenario::builder("").config("aws:region", "us-west-2").dep("@pulumi/eks");
/// let scenario = base.clone().dir(examples.join("cluster")).validator(smoke).build()?;
/// ```
#[derive(Clone, Default)]
pub struct ScenarioBuilder {
    name: Option<String>,
    dir: PathBuf,
    config: Vec<ConfigValue>,
    deps: Vec<String>,
    env: BTreeMap<String, String>,
    edits: Vec<Edit>,
    validate: Option<Arc<dyn Validator>>,
    flags: Flags,
    sinks: Sinks,
    stack_name: Option<String>,
}

impl ScenarioBuilder {
    /// Program directory
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Display name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set a plain config value, replacing an earlier entry with the same key
    pub fn config(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config_value(ConfigValue::plain(key, value))
    }

    /// Set a config entry, replacing an earlier entry with the same key
    pub fn config_value(mut self, entry: ConfigValue) -> Self {
        match self.config.iter_mut().find(|c| c.key == entry.key) {
            Some(existing) => *existing = entry,
            None => self.config.push(entry),
        }
        self
    }

    /// Add a dependency; duplicates are ignored
    pub fn dep(mut self, dep: impl Into<String>) -> Self {
        let dep = dep.into();
        if !self.deps.contains(&dep) {
            self.deps.push(dep);
        }
        self
    }

    /// Extra environment variable for provisioner processes
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Append an edit
    pub fn edit(mut self, edit: Edit) -> Self {
        self.edits.push(edit);
        self
    }

    /// Validator for the initial deploy
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validate = Some(Arc::new(validator));
        self
    }

    /// Replace all flags
    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Adjust flags in place
    pub fn with_flags(mut self, f: impl FnOnce(&mut Flags)) -> Self {
        f(&mut self.flags);
        self
    }

    /// Report and trace sinks
    pub fn sinks(mut self, sinks: Sinks) -> Self {
        self.sinks = sinks;
        self
    }

    /// Fixed stack name
    pub fn stack_name(mut self, name: impl Into<String>) -> Self {
        self.stack_name = Some(name.into());
        self
    }

    /// Validate and freeze the scenario
    pub fn build(self) -> Result<Scenario> {
        let dir = self.dir;
        if !dir.is_absolute() {
            return Err(Error::setup(format!(
                "program directory must be absolute: {}",
                dir.display()
            )));
        }
        if !dir.is_dir() {
            return Err(Error::setup(format!(
                "program directory does not exist: {}",
                dir.display()
            )));
        }
        for edit in &self.edits {
            if !edit.dir.is_dir() {
                return Err(Error::setup(format!(
                    "edit directory does not exist: {}",
                    edit.dir.display()
                )));
            }
        }
        if self.flags.preview_only && !self.edits.is_empty() {
            return Err(Error::setup("preview-only scenarios cannot have edits"));
        }

        let name = self.name.unwrap_or_else(|| dir_name(&dir));
        Ok(Scenario {
            name,
            dir,
            config: self.config,
            deps: self.deps,
            env: self.env,
            edits: self.edits,
            validate: self.validate,
            flags: self.flags,
            sinks: self.sinks,
            stack_name: self.stack_name,
        })
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "program".to_string())
}
