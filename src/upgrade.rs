//! Upgrade Driver
//!
//! Deploys a scenario with a released *baseline* provider plugin, swaps in the
//! locally built *candidate* plugin and previews. The run fails if the preview
//! would replace any resource; updates and no-ops are fine.
//!
//! A baseline deploy can be recorded. When `<recordings>/<scenario>/stack.json`
//! exists the baseline state is imported instead of deployed, and teardown only
//! removes the stack.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::FutureExt;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::driver::{Phase, ScenarioDriver, ScenarioReport, Session};
use crate::overlay::apply_overlay;
use crate::provisioner::PreviewOptions;
use crate::scenario::{ConfigValue, Scenario};
use crate::{Error, Result};

/// Provider under test
pub const DEFAULT_PROVIDER: &str = "eks";

const PROJECT_FILE: &str = "Pulumi.yaml";
const RECORDING_FILE: &str = "stack.json";

/// Program change applied between the baseline deploy and the candidate preview
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgramSource {
    /// Full project file contents that replace the working copy's `Pulumi.yaml`
    Inline(String),
    /// Directory overlaid onto the working copy
    Dir(PathBuf),
}

impl ProgramSource {
    fn apply(&self, workdir: &Path) -> Result<()> {
        match self {
            ProgramSource::Inline(contents) => {
                let path = workdir.join(PROJECT_FILE);
                std::fs::write(&path, contents)
                    .map_err(|e| Error::io(format!("writing {}", path.display()), e))
            }
            ProgramSource::Dir(dir) => apply_overlay(workdir, dir).map(|_| ()),
        }
    }
}

/// A scenario compared across two provider builds
#[derive(Clone, Debug)]
pub struct UpgradeScenario {
    /// Program, config and flags of the baseline deploy
    pub scenario: Scenario,
    /// Provider plugin name
    pub provider: String,
    /// Released provider version to deploy with
    pub baseline_version: String,
    /// Other plugins pinned to fixed versions for the baseline, by name
    pub companions: BTreeMap<String, String>,
    /// Directory holding the candidate provider binary
    pub candidate_dir: Option<PathBuf>,
    /// Change applied before the candidate preview
    pub followup: Option<ProgramSource>,
    /// Stack config set after the follow-up, before the candidate preview
    pub config_overrides: Vec<ConfigValue>,
    /// Root of recorded baseline states
    pub recordings: Option<PathBuf>,
}

impl UpgradeScenario {
    /// Compare `scenario` deployed with `baseline_version` of the eks provider
    pub fn new(scenario: Scenario, baseline_version: impl Into<String>) -> Self {
        Self {
            scenario,
            provider: DEFAULT_PROVIDER.to_string(),
            baseline_version: baseline_version.into(),
            companions: BTreeMap::new(),
            candidate_dir: None,
            followup: None,
            config_overrides: Vec::new(),
            recordings: None,
        }
    }

    /// Provider plugin name
    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.provider = name.into();
        self
    }

    /// Pin another plugin for the baseline deploy
    pub fn companion(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.companions.insert(name.into(), version.into());
        self
    }

    /// Candidate plugin directory; defaults to the harness plugin dir
    pub fn candidate_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.candidate_dir = Some(dir.into());
        self
    }

    /// Change the program before the candidate preview
    pub fn followup(mut self, program: ProgramSource) -> Self {
        self.followup = Some(program);
        self
    }

    /// Set `entry` on the baseline stack before the candidate preview
    pub fn override_config(mut self, entry: ConfigValue) -> Self {
        self.config_overrides.push(entry);
        self
    }

    fn changes_baseline(&self) -> bool {
        self.followup.is_some() || !self.config_overrides.is_empty()
    }

    /// Import from and record into `dir`
    pub fn recordings(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recordings = Some(dir.into());
        self
    }

    fn recording_path(&self) -> Option<PathBuf> {
        self.recordings
            .as_ref()
            .map(|dir| dir.join(&self.scenario.name).join(RECORDING_FILE))
    }
}

/// Runs [`UpgradeScenario`]s on top of a [`ScenarioDriver`]
pub struct UpgradeDriver {
    driver: ScenarioDriver,
    short: bool,
    default_candidate: Option<PathBuf>,
}

impl UpgradeDriver {
    /// Wrap `driver`; short mode and the candidate dir come from `config`
    pub fn new(driver: ScenarioDriver, config: &HarnessConfig) -> Self {
        Self {
            driver,
            short: config.short,
            default_candidate: config.plugin_dir.clone(),
        }
    }

    /// Driver shelling out to the `pulumi` CLI
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(ScenarioDriver::from_config(config), config)
    }

    /// Reason the upgrade cannot run here, if any
    fn skip_reason(&self, upgrade: &UpgradeScenario) -> std::result::Result<PathBuf, String> {
        if self.short {
            return Err("skipping test in short mode.".to_string());
        }
        let candidate = upgrade
            .candidate_dir
            .clone()
            .or_else(|| self.default_candidate.clone())
            .ok_or_else(|| "no candidate plugin directory configured".to_string())?;
        if !candidate.is_dir() {
            return Err(format!(
                "candidate plugin directory not found: {}",
                candidate.display()
            ));
        }
        Ok(candidate)
    }

    /// Baseline deploy, candidate preview, teardown
    pub async fn run(&self, upgrade: UpgradeScenario) -> ScenarioReport {
        let candidate = match self.skip_reason(&upgrade) {
            Ok(dir) => dir,
            Err(reason) => {
                info!(scenario = %upgrade.scenario.name, reason = %reason, "Skipping upgrade");
                return ScenarioReport::skipped(&upgrade.scenario.name, reason);
            }
        };

        let mut session = Session::new(&self.driver, upgrade.scenario.clone());
        if let Err(e) = execute(&mut session, &upgrade, &candidate).await {
            session.record_unexpected(&e);
        }
        session.finish().await
    }
}

async fn install_baseline(
    session: &mut Session<'_>,
    upgrade: &UpgradeScenario,
) -> Result<Vec<(String, PathBuf)>> {
    let mut plugins = vec![(upgrade.provider.clone(), upgrade.baseline_version.clone())];
    plugins.extend(
        upgrade
            .companions
            .iter()
            .map(|(name, version)| (name.clone(), version.clone())),
    );

    let mut installed = Vec::with_capacity(plugins.len());
    for (name, version) in plugins {
        let dir = session
            .provision(Phase::Plugin, 0, {
                let (name, version) = (name.clone(), version.clone());
                move |p, _| {
                    let (name, version) = (name.clone(), version.clone());
                    async move { p.install_plugin(&name, &version).await }.boxed()
                }
            })
            .await?;
        installed.push((name, dir));
    }
    Ok(installed)
}

async fn pin(session: &mut Session<'_>, step: usize, name: &str, dir: &Path) -> Result<()> {
    let (name, dir) = (name.to_string(), dir.to_path_buf());
    session
        .provision(Phase::Plugin, step, move |p, ctx| {
            let (name, dir) = (name.clone(), dir.clone());
            async move { p.pin_plugin(&ctx.workdir, &name, &dir).await }.boxed()
        })
        .await
}

async fn import_recording(session: &mut Session<'_>, path: &Path) -> Result<()> {
    let path = path.to_path_buf();
    let recording = path.clone();
    session
        .provision(Phase::Import, 0, move |p, ctx| {
            let path = recording.clone();
            async move {
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
                let state: Value = serde_json::from_str(&text)?;
                p.import_stack(&ctx, &state).await
            }
            .boxed()
        })
        .await?;
    session.mark_imported()?;
    info!(recording = %path.display(), "Imported recorded baseline state");
    Ok(())
}

async fn record(session: &mut Session<'_>, path: &Path) -> Result<()> {
    let state = session
        .provision(Phase::Export, 0, |p, ctx| {
            async move { p.export_stack(&ctx).await }.boxed()
        })
        .await?;
    let path = path.to_path_buf();
    session
        .run_phase(Phase::Export, 0, || {
            let (path, state) = (path.clone(), state.clone());
            async move {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
                }
                tokio::fs::write(&path, serde_json::to_vec_pretty(&state)?)
                    .await
                    .map_err(|e| Error::io(format!("writing {}", path.display()), e))?;
                info!(recording = %path.display(), "Recorded baseline state");
                Ok(())
            }
        })
        .await
}

async fn execute(
    session: &mut Session<'_>,
    upgrade: &UpgradeScenario,
    candidate: &Path,
) -> Result<()> {
    let baseline = install_baseline(session, upgrade).await?;
    session.setup().await?;
    for (name, dir) in &baseline {
        pin(session, 0, name, dir).await?;
    }

    let recording = upgrade.recording_path();
    match recording.as_deref().filter(|p| p.is_file()) {
        Some(path) => import_recording(session, path).await?,
        None => {
            if !session.deploy(0).await? {
                return Err(session.fail(
                    Phase::Up,
                    0,
                    "baseline deploy failed; there is nothing to upgrade",
                ));
            }
            if let Some(path) = &recording {
                record(session, path).await?;
            }
        }
    }

    let step = if upgrade.changes_baseline() { 1 } else { 0 };
    if let Some(followup) = &upgrade.followup {
        let workdir = session.workdir().to_path_buf();
        session
            .run_phase(Phase::ApplyEdit, step, || {
                let (followup, workdir) = (followup.clone(), workdir.clone());
                async move { followup.apply(&workdir) }
            })
            .await?;
    }
    if !upgrade.config_overrides.is_empty() {
        let entries = upgrade.config_overrides.clone();
        session
            .provision(Phase::SetConfig, step, move |p, ctx| {
                let entries = entries.clone();
                async move {
                    for entry in &entries {
                        p.set_config(&ctx, entry).await?;
                    }
                    Ok(())
                }
                .boxed()
            })
            .await?;
    }

    // Baseline companions stay pinned; only the provider under test is swapped
    pin(session, step, &upgrade.provider, candidate).await?;

    let summary = session
        .provision(Phase::Preview, step, |p, ctx| {
            async move {
                p.preview(
                    &ctx,
                    PreviewOptions {
                        expect_no_changes: false,
                        json: true,
                    },
                )
                .await
            }
            .boxed()
        })
        .await?;

    let replacements = summary.replacements();
    if replacements > 0 {
        warn!(
            scenario = %session.scenario().name,
            replacements,
            urns = ?summary.replaced,
            "Candidate plugin replaces resources"
        );
        return Err(session.fail(
            Phase::Preview,
            step,
            format!(
                "upgrading {} from {} replaces {replacements} resource(s): {}",
                upgrade.provider,
                upgrade.baseline_version,
                summary.replaced.join(", ")
            ),
        ));
    }

    info!(
        scenario = %session.scenario().name,
        changes = summary.changes(),
        "Upgrade preview has no replacements"
    );
    Ok(())
}
