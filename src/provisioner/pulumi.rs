//! `pulumi` CLI implementation of [`Provisioner`]

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use serde_yaml::{Mapping, Value as YamlValue};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ChangeSummary, PreviewOptions, Provisioner, StackContext, UpOptions};
use crate::config::HarnessConfig;
use crate::error::ProvisionerFailure;
use crate::scenario::ConfigValue;
use crate::{Error, Result};

/// Project file of a program
const PROJECT_FILE: &str = "Pulumi.yaml";

/// Node.js package manifest; programs without one have nothing to install
const PACKAGE_MANIFEST: &str = "package.json";

/// Drives the `pulumi` binary and the program's package manager
#[derive(Clone, Debug)]
pub struct PulumiCli {
    bin: PathBuf,
    package_manager: String,
    backend_url: Option<String>,
    tracing_endpoint: Option<String>,
    plugin_dir: Option<PathBuf>,
    command_timeout: Duration,
}

impl PulumiCli {
    /// Build from harness settings
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            bin: config.provisioner_bin.clone(),
            package_manager: config.package_manager.clone(),
            backend_url: config.backend_url.clone(),
            tracing_endpoint: config.tracing_endpoint.clone(),
            plugin_dir: config.plugin_dir.clone(),
            command_timeout: config.phase_timeout,
        }
    }

    fn stack_command(&self, ctx: &StackContext, args: &[&str]) -> (Command, String) {
        let mut full: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        full.push("--stack".to_string());
        full.push(ctx.stack.clone());
        let tracing = ctx
            .tracing_endpoint
            .as_deref()
            .or(self.tracing_endpoint.as_deref());
        self.command(&ctx.workdir, &ctx.env, full, tracing)
    }

    fn command(
        &self,
        workdir: &Path,
        env: &BTreeMap<String, String>,
        mut args: Vec<String>,
        tracing: Option<&str>,
    ) -> (Command, String) {
        if let Some(endpoint) = tracing {
            args.push("--tracing".to_string());
            args.push(endpoint.to_string());
        }

        let mut cmd = Command::new(&self.bin);
        cmd.args(&args)
            .current_dir(workdir)
            .kill_on_drop(true)
            .env("PULUMI_SKIP_UPDATE_CHECK", "true");

        if let Some(url) = &self.backend_url {
            cmd.env("PULUMI_BACKEND_URL", url);
            if url.starts_with("file://") && std::env::var_os("PULUMI_CONFIG_PASSPHRASE").is_none()
            {
                cmd.env("PULUMI_CONFIG_PASSPHRASE", "");
            }
        }
        if let Some(path) = self.search_path() {
            cmd.env("PATH", path);
        }
        for (k, v) in env {
            cmd.env(k, v);
        }

        let display = format!("{} {}", self.bin.display(), args.join(" "));
        (cmd, display)
    }

    /// PATH with the local plugin directory appended
    fn search_path(&self) -> Option<OsString> {
        let dir = self.plugin_dir.as_ref()?;
        let current = std::env::var_os("PATH").unwrap_or_default();
        let mut paths: Vec<PathBuf> = std::env::split_paths(&current).collect();
        paths.push(dir.clone());
        std::env::join_paths(paths).ok()
    }

    async fn run(&self, cmd: Command, display: &str) -> Result<Output> {
        self.run_with_input(cmd, display, None).await
    }

    /// Run `cmd`, feeding `input` to its stdin when given
    async fn run_with_input(
        &self,
        mut cmd: Command,
        command_display: &str,
        input: Option<&[u8]>,
    ) -> Result<Output> {
        info!(command = %command_display, "Running provisioner");
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let exec = async {
            let mut child = cmd.spawn()?;
            if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
                stdin.write_all(bytes).await?;
            }
            child.wait_with_output().await
        };
        let output = tokio::time::timeout(self.command_timeout, exec)
            .await
            .map_err(|_| {
                warn!(command = %command_display, timeout = ?self.command_timeout, "Provisioner timed out");
                Error::timeout(command_display.to_string(), self.command_timeout)
            })?
            .map_err(|e| {
                warn!(command = %command_display, error = %e, "Provisioner spawn failed");
                Error::from(ProvisionerFailure::new(
                    command_display,
                    None,
                    format!("failed to execute: {e}").as_bytes(),
                ))
            })?;

        if output.status.success() {
            debug!(command = %command_display, "Provisioner succeeded");
            Ok(output)
        } else {
            let mut combined = output.stdout.clone();
            combined.extend_from_slice(&output.stderr);
            let failure = ProvisionerFailure::new(command_display, output.status.code(), &combined);
            warn!(command = %command_display, exit_code = ?failure.exit_code, "Provisioner failed");
            Err(failure.into())
        }
    }

    async fn run_stack(&self, ctx: &StackContext, args: &[&str]) -> Result<Output> {
        let (cmd, display) = self.stack_command(ctx, args);
        self.run(cmd, &display).await
    }

    async fn run_package_manager(&self, workdir: &Path, args: &[&str]) -> Result<()> {
        let mut cmd = Command::new(&self.package_manager);
        cmd.args(args).current_dir(workdir).kill_on_drop(true);
        let display = format!("{} {}", self.package_manager, args.join(" "));
        self.run(cmd, &display).await.map(|_| ())
    }
}

/// Arguments of `config set` and the bytes to pipe to its stdin
///
/// Secret values never appear on the command line; the CLI reads them from
/// stdin when the value argument is omitted.
fn config_set_args(entry: &ConfigValue) -> (Vec<&str>, Option<&[u8]>) {
    let mut args = vec!["config", "set", entry.key.as_str()];
    let input = if entry.secret {
        Some(entry.value.as_bytes())
    } else {
        args.push(entry.value.as_str());
        None
    };
    if entry.path {
        args.push("--path");
    }
    args.push(if entry.secret { "--secret" } else { "--plaintext" });
    (args, input)
}

fn parse_stdout(output: &Output, what: &str) -> Result<Value> {
    serde_json::from_slice(&output.stdout)
        .map_err(|e| Error::serialization(format!("parsing {what} output: {e}")))
}

#[async_trait]
impl Provisioner for PulumiCli {
    async fn install_dependencies(&self, workdir: &Path, deps: &[String]) -> Result<()> {
        if !workdir.join(PACKAGE_MANIFEST).is_file() {
            info!(
                workdir = %workdir.display(),
                skipped_links = deps.len(),
                "No package manifest, skipping dependency install"
            );
            return Ok(());
        }
        self.run_package_manager(workdir, &["install"]).await?;
        for dep in deps {
            self.run_package_manager(workdir, &["link", dep]).await?;
        }
        Ok(())
    }

    async fn init_stack(&self, ctx: &StackContext) -> Result<()> {
        let (cmd, display) = self.command(
            &ctx.workdir,
            &ctx.env,
            vec![
                "stack".into(),
                "init".into(),
                ctx.stack.clone(),
                "--non-interactive".into(),
            ],
            ctx.tracing_endpoint
                .as_deref()
                .or(self.tracing_endpoint.as_deref()),
        );
        self.run(cmd, &display).await.map(|_| ())
    }

    async fn set_config(&self, ctx: &StackContext, entry: &ConfigValue) -> Result<()> {
        let (args, input) = config_set_args(entry);
        let (cmd, display) = self.stack_command(ctx, &args);
        self.run_with_input(cmd, &display, input)
            .await
            .map(|_| ())
    }

    async fn preview(&self, ctx: &StackContext, opts: PreviewOptions) -> Result<ChangeSummary> {
        let mut args = vec!["preview", "--non-interactive"];
        args.push(if opts.json { "--json" } else { "--diff" });
        if opts.expect_no_changes {
            args.push("--expect-no-changes");
        }
        let output = self.run_stack(ctx, &args).await?;
        if opts.json {
            Ok(ChangeSummary::from_preview_json(&parse_stdout(&output, "preview")?))
        } else {
            Ok(ChangeSummary::default())
        }
    }

    async fn up(&self, ctx: &StackContext, opts: UpOptions) -> Result<()> {
        let mut args = vec!["up", "--skip-preview", "--yes", "--non-interactive"];
        if opts.expect_no_changes {
            args.push("--expect-no-changes");
        }
        self.run_stack(ctx, &args).await.map(|_| ())
    }

    async fn refresh(&self, ctx: &StackContext, expect_no_changes: bool) -> Result<()> {
        let mut args = vec!["refresh", "--skip-preview", "--yes", "--non-interactive"];
        if expect_no_changes {
            args.push("--expect-no-changes");
        }
        self.run_stack(ctx, &args).await.map(|_| ())
    }

    async fn destroy(&self, ctx: &StackContext) -> Result<()> {
        self.run_stack(
            ctx,
            &["destroy", "--skip-preview", "--yes", "--non-interactive"],
        )
        .await
        .map(|_| ())
    }

    async fn remove_stack(&self, ctx: &StackContext, force: bool) -> Result<()> {
        let mut args = vec!["stack", "rm", "--yes", "--non-interactive"];
        if force {
            args.push("--force");
        }
        self.run_stack(ctx, &args).await.map(|_| ())
    }

    async fn export_stack(&self, ctx: &StackContext) -> Result<Value> {
        let output = self.run_stack(ctx, &["stack", "export"]).await?;
        parse_stdout(&output, "stack export")
    }

    async fn import_stack(&self, ctx: &StackContext, state: &Value) -> Result<()> {
        let file = tempfile::Builder::new()
            .prefix("stack-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| Error::io("creating stack import file", e))?;
        std::fs::write(file.path(), serde_json::to_vec(state)?)
            .map_err(|e| Error::io("writing stack import file", e))?;

        let path = file.path().to_string_lossy().into_owned();
        self.run_stack(ctx, &["stack", "import", "--file", path.as_str()])
            .await
            .map(|_| ())
    }

    async fn stack_outputs(&self, ctx: &StackContext) -> Result<Value> {
        let output = self
            .run_stack(ctx, &["stack", "output", "--json", "--show-secrets"])
            .await?;
        parse_stdout(&output, "stack output")
    }

    async fn install_plugin(&self, name: &str, version: &str) -> Result<PathBuf> {
        let version = version.trim_start_matches('v');
        let (cmd, display) = self.command(
            Path::new("."),
            &BTreeMap::new(),
            vec![
                "plugin".into(),
                "install".into(),
                "resource".into(),
                name.to_string(),
                version.to_string(),
            ],
            None,
        );
        self.run(cmd, &display).await?;
        plugin_cache_dir(name, version)
    }

    async fn pin_plugin(&self, workdir: &Path, name: &str, plugin_dir: &Path) -> Result<()> {
        let project = workdir.join(PROJECT_FILE);
        let text = std::fs::read_to_string(&project)
            .map_err(|e| Error::io(format!("reading {}", project.display()), e))?;
        let mut doc: YamlValue = serde_yaml::from_str(&text)?;
        pin_provider(&mut doc, name, plugin_dir)?;
        std::fs::write(&project, serde_yaml::to_string(&doc)?)
            .map_err(|e| Error::io(format!("writing {}", project.display()), e))?;
        info!(plugin = %name, path = %plugin_dir.display(), "Pinned provider plugin");
        Ok(())
    }
}

/// Directory the CLI installs `resource-<name>-v<version>` into
fn plugin_cache_dir(name: &str, version: &str) -> Result<PathBuf> {
    let home = match std::env::var_os("PULUMI_HOME") {
        Some(home) => PathBuf::from(home),
        None => dirs::home_dir()
            .ok_or_else(|| Error::setup("cannot locate home directory for plugin cache"))?
            .join(".pulumi"),
    };
    Ok(home
        .join("plugins")
        .join(format!("resource-{name}-v{version}")))
}

/// Set `plugins.providers[name].path` in a project document
///
/// Replaces an existing entry for the same provider and keeps all others.
pub fn pin_provider(doc: &mut YamlValue, name: &str, plugin_dir: &Path) -> Result<()> {
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| Error::serialization("project file is not a mapping"))?;

    let plugins = root
        .entry(YamlValue::from("plugins"))
        .or_insert_with(|| YamlValue::Mapping(Mapping::new()));
    let plugins = plugins
        .as_mapping_mut()
        .ok_or_else(|| Error::serialization("`plugins` is not a mapping"))?;

    let providers = plugins
        .entry(YamlValue::from("providers"))
        .or_insert_with(|| YamlValue::Sequence(Vec::new()));
    let providers = providers
        .as_sequence_mut()
        .ok_or_else(|| Error::serialization("`plugins.providers` is not a list"))?;

    providers.retain(|p| p.get("name").and_then(YamlValue::as_str) != Some(name));

    let mut entry = Mapping::new();
    entry.insert("name".into(), name.into());
    entry.insert(
        "path".into(),
        plugin_dir.to_string_lossy().into_owned().into(),
    );
    providers.push(YamlValue::Mapping(entry));
    Ok(())
}
