//! Scenario Driver
//!
//! Runs a [`Scenario`] against the provisioner, phase by phase:
//!
//! ```text
//! prepare -> install-dependencies -> init-stack -> set-config
//!   -> [preview] -> up -> validate -> [refresh]
//!   -> for each edit: apply-edit -> [preview] -> up -> validate
//!   -> [update-test]
//!   -> destroy -> remove-stack
//! ```
//!
//! Phases run strictly in order. Every phase is bounded by the phase timeout
//! and by the driver's cancellation token. Once `up` has been attempted the
//! stack is destroyed exactly once, whatever happened before; destroy and
//! stack removal ignore cancellation so a cancelled run still cleans up.

mod report;

pub use report::{Outcome, Phase, PhaseOutcome, PhaseRecord, ScenarioFailure, ScenarioReport};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::overlay::{apply_overlay, copy_program};
use crate::provisioner::{PreviewOptions, Provisioner, PulumiCli, StackContext, UpOptions};
use crate::retry::{retry_with_backoff_if, RetryConfig};
use crate::scenario::{Scenario, ScenarioState};
use crate::stack::StackInfo;
use crate::stats::{publish_in_background, S3CliSink, StatsSink};
use crate::validator::Validator;
use crate::{Error, Result};

impl Phase {
    /// Provisioner phases may be retried; local work and validators may not
    fn is_retryable(self) -> bool {
        !matches!(self, Phase::Prepare | Phase::Validate | Phase::ApplyEdit)
    }

    /// Teardown phases run even after cancellation
    fn is_teardown(self) -> bool {
        matches!(self, Phase::Destroy | Phase::RemoveStack)
    }
}

/// Stack name for a scenario: `p-it-<name>-<8 hex>`
pub fn generate_stack_name(scenario: &str) -> String {
    let slug: String = scenario
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let id = Uuid::new_v4().simple().to_string();
    format!("p-it-{}-{}", slug.trim_matches('-'), &id[..8])
}

/// Executes scenarios
pub struct ScenarioDriver {
    provisioner: Arc<dyn Provisioner>,
    phase_timeout: Duration,
    retry: RetryConfig,
    cancel: CancellationToken,
    stats: Option<Arc<dyn StatsSink>>,
}

impl ScenarioDriver {
    /// Driver using `provisioner` with the harness phase timeout
    pub fn new(provisioner: Arc<dyn Provisioner>, config: &HarnessConfig) -> Self {
        Self {
            provisioner,
            phase_timeout: config.phase_timeout,
            retry: RetryConfig::provisioner(),
            cancel: CancellationToken::new(),
            stats: None,
        }
    }

    /// Driver shelling out to the `pulumi` CLI
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(Arc::new(PulumiCli::from_config(config)), config)
    }

    /// Retry policy used under `retry_failed_steps`
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Deadline for each phase
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    /// Cancel runs through an external token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Send every report to `sink`, overriding per-scenario stats targets
    pub fn with_stats_sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.stats = Some(sink);
        self
    }

    /// Token that cancels in-flight runs
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `scenario` to completion, including teardown
    pub async fn run(&self, scenario: Scenario) -> ScenarioReport {
        let mut session = Session::new(self, scenario);
        if let Err(e) = session.execute().await {
            session.record_unexpected(&e);
        }
        session.finish().await
    }
}

// =============================================================================
// Phase execution
// =============================================================================

/// Runs single phases and records them in the report
struct PhaseRunner {
    scenario: String,
    report: ScenarioReport,
    timeout: Duration,
    retry: RetryConfig,
    retry_enabled: bool,
    cancel: CancellationToken,
}

impl PhaseRunner {
    /// Run `op` as `phase`, recording the attempt but not failing the report
    async fn attempt<T, F, Fut>(&mut self, phase: Phase, step: usize, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let retry = if self.retry_enabled && phase.is_retryable() {
            self.retry.clone()
        } else {
            RetryConfig::no_retry()
        };
        let name = phase.to_string();
        debug!(scenario = %self.scenario, phase = %phase, step, "Starting phase");

        let work = tokio::time::timeout(
            self.timeout,
            retry_with_backoff_if(&retry, &name, Error::is_retryable, op),
        );
        let outcome = if phase.is_teardown() {
            work.await
        } else {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Ok(Err((Error::Cancelled(name.clone()), 1))),
                outcome = work => outcome,
            }
        };

        let (result, attempts) = match outcome {
            Ok(Ok((value, attempts))) => (Ok(value), attempts),
            Ok(Err((e, attempts))) => (Err(e), attempts),
            Err(_) => (Err(Error::timeout(name, self.timeout)), 1),
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(_) => {
                info!(
                    scenario = %self.scenario,
                    phase = %phase,
                    step,
                    attempts,
                    duration_secs = elapsed.as_secs(),
                    "Phase succeeded"
                );
                self.report
                    .record(phase, step, attempts, elapsed, PhaseOutcome::Succeeded);
            }
            Err(e) => {
                warn!(
                    scenario = %self.scenario,
                    phase = %phase,
                    step,
                    attempts,
                    error = %e,
                    "Phase failed"
                );
                self.report
                    .record(phase, step, attempts, elapsed, PhaseOutcome::Failed);
            }
        }
        result
    }

    /// Run `op` as `phase`; a failure fails the scenario
    async fn run<T, F, Fut>(&mut self, phase: Phase, step: usize, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = self.attempt(phase, step, op).await;
        if let Err(e) = &result {
            self.fail(phase, step, e);
        }
        result
    }

    fn fail(&mut self, phase: Phase, step: usize, err: &Error) {
        self.report
            .fail(ScenarioFailure::from_error(phase, step, err));
    }

    fn mark_last(&mut self, outcome: PhaseOutcome) {
        if let Some(last) = self.report.phases.last_mut() {
            last.outcome = outcome;
        }
    }
}

type ProvisionerCall<'a, T> =
    dyn Fn(Arc<dyn Provisioner>, StackContext) -> BoxFuture<'static, Result<T>> + Send + Sync + 'a;

async fn run_validator(validator: &dyn Validator, info: &StackInfo) -> Result<()> {
    match AssertUnwindSafe(validator.validate(info)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Err(Error::validation(format!(
                "validator {} panicked: {msg}",
                validator.name()
            )))
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// One scenario run in progress
///
/// The upgrade driver composes its flow from the same steps.
pub(crate) struct Session<'d> {
    driver: &'d ScenarioDriver,
    scenario: Scenario,
    ctx: StackContext,
    phases: PhaseRunner,
    state: ScenarioState,
    scratch: Option<TempDir>,
    stack_created: bool,
    up_attempted: bool,
    imported: bool,
    started: Instant,
}

impl<'d> Session<'d> {
    pub(crate) fn new(driver: &'d ScenarioDriver, scenario: Scenario) -> Self {
        let stack = scenario
            .stack_name
            .clone()
            .unwrap_or_else(|| generate_stack_name(&scenario.name));
        let ctx = StackContext {
            workdir: scenario.dir.clone(),
            stack: stack.clone(),
            env: scenario.env.clone(),
            tracing_endpoint: scenario.sinks.tracing_endpoint.clone(),
        };
        let phases = PhaseRunner {
            scenario: scenario.name.clone(),
            report: ScenarioReport::new(&scenario.name, &stack),
            timeout: driver.phase_timeout,
            retry: driver.retry.clone(),
            retry_enabled: scenario.flags.retry_failed_steps,
            cancel: driver.cancel.clone(),
        };
        info!(
            scenario = %scenario.name,
            stack = %stack,
            dir = %scenario.dir.display(),
            edits = scenario.edits.len(),
            "Starting scenario"
        );
        Self {
            driver,
            scenario,
            ctx,
            phases,
            state: ScenarioState::Init,
            scratch: None,
            stack_created: false,
            up_attempted: false,
            imported: false,
            started: Instant::now(),
        }
    }

    pub(crate) fn workdir(&self) -> &Path {
        &self.ctx.workdir
    }

    pub(crate) fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Run a provisioner call as `phase`; a failure fails the scenario
    pub(crate) async fn provision<T, F>(&mut self, phase: Phase, step: usize, call: F) -> Result<T>
    where
        T: 'static,
        F: Fn(Arc<dyn Provisioner>, StackContext) -> BoxFuture<'static, Result<T>> + Send + Sync,
    {
        let result = self.provision_unchecked(phase, step, &call).await;
        if let Err(e) = &result {
            self.phases.fail(phase, step, e);
        }
        result
    }

    async fn provision_unchecked<T: 'static>(
        &mut self,
        phase: Phase,
        step: usize,
        call: &ProvisionerCall<'_, T>,
    ) -> Result<T> {
        let provisioner = self.driver.provisioner.clone();
        let ctx = self.ctx.clone();
        self.phases
            .attempt(phase, step, || call(provisioner.clone(), ctx.clone()))
            .await
    }

    /// Run local work as `phase`; a failure fails the scenario
    pub(crate) async fn run_phase<T, F, Fut>(&mut self, phase: Phase, step: usize, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.phases.run(phase, step, op).await
    }

    /// Fail the scenario with a message
    pub(crate) fn fail(&mut self, phase: Phase, step: usize, message: impl Into<String>) -> Error {
        let message = message.into();
        self.phases
            .report
            .fail(ScenarioFailure::message(phase, step, message.clone()));
        Error::validation(message)
    }

    /// The stack state came from `stack import`, not from a deploy
    pub(crate) fn mark_imported(&mut self) -> Result<()> {
        self.imported = true;
        self.up_attempted = true;
        self.state.advance(ScenarioState::Deployed(0))
    }

    pub(crate) fn record_unexpected(&mut self, err: &Error) {
        if self.phases.report.failure.is_none() {
            let (phase, step) = self
                .phases
                .report
                .phases
                .last()
                .map(|p| (p.phase, p.step))
                .unwrap_or((Phase::Prepare, 0));
            self.phases.fail(phase, step, err);
        }
    }

    /// Apply `expect_failure` to the result of a deploying command
    ///
    /// Returns `Ok(true)` when the command succeeded as required and
    /// `Ok(false)` when it failed as expected.
    fn settle(
        &mut self,
        phase: Phase,
        step: usize,
        expect_failure: bool,
        result: Result<()>,
    ) -> Result<bool> {
        match result {
            Ok(()) if !expect_failure => Ok(true),
            Ok(()) => Err(self.fail(
                phase,
                step,
                format!("expected {phase} to fail, but it succeeded"),
            )),
            Err(e @ (Error::Cancelled(_) | Error::Timeout { .. })) => {
                self.phases.fail(phase, step, &e);
                Err(e)
            }
            Err(e) if expect_failure => {
                self.phases.mark_last(PhaseOutcome::ExpectedFailure);
                info!(scenario = %self.scenario.name, phase = %phase, error = %e, "Failed as expected");
                Ok(false)
            }
            Err(e) => {
                self.phases.fail(phase, step, &e);
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Steps
    // -------------------------------------------------------------------------

    /// Working copy, dependencies, stack and config
    pub(crate) async fn setup(&mut self) -> Result<()> {
        let program = self.scenario.dir.clone();
        let (scratch, workdir) = self
            .phases
            .run(Phase::Prepare, 0, || {
                let program = program.clone();
                async move {
                    let scratch = tempfile::Builder::new()
                        .prefix("eks-harness-")
                        .tempdir()
                        .map_err(|e| Error::io("creating scratch directory", e))?;
                    let workdir = copy_program(&program, scratch.path())?;
                    Ok((scratch, workdir))
                }
            })
            .await?;
        self.ctx.workdir = workdir;
        self.scratch = Some(scratch);

        let deps = self.scenario.deps.clone();
        let workdir = self.ctx.workdir.clone();
        self.provision(Phase::InstallDependencies, 0, move |p, _| {
            let (deps, workdir) = (deps.clone(), workdir.clone());
            async move { p.install_dependencies(&workdir, &deps).await }.boxed()
        })
        .await?;
        self.state.advance(ScenarioState::DepsReady)?;

        self.provision(Phase::InitStack, 0, |p, ctx| {
            async move { p.init_stack(&ctx).await }.boxed()
        })
        .await?;
        self.stack_created = true;

        let entries = self.scenario.config.clone();
        self.provision(Phase::SetConfig, 0, move |p, ctx| {
            let entries = entries.clone();
            async move {
                for entry in &entries {
                    p.set_config(&ctx, entry).await?;
                }
                Ok(())
            }
            .boxed()
        })
        .await
    }

    /// Preview and up for deploy `step`
    ///
    /// Returns `Ok(false)` when the initial deploy failed as expected.
    pub(crate) async fn deploy(&mut self, step: usize) -> Result<bool> {
        let flags = self.scenario.flags;
        let expect_failure = flags.expect_failure && step == 0;

        if !flags.quick {
            let result = self
                .provision_unchecked(Phase::Preview, step, &|p, ctx| {
                    async move { p.preview(&ctx, PreviewOptions::default()).await.map(|_| ()) }
                        .boxed()
                })
                .await;
            if result.is_err() {
                return self.settle(Phase::Preview, step, expect_failure, result);
            }
        }

        self.up_attempted = true;
        let result = self
            .provision_unchecked(Phase::Up, step, &|p, ctx| {
                async move { p.up(&ctx, UpOptions::default()).await }.boxed()
            })
            .await;
        if !self.settle(Phase::Up, step, expect_failure, result)? {
            return Ok(false);
        }
        self.state.advance(ScenarioState::Deployed(step))?;
        Ok(true)
    }

    /// Export resources and outputs
    pub(crate) async fn stack_info(&mut self, step: usize) -> Result<StackInfo> {
        self.provision(Phase::Export, step, |p, ctx| {
            async move {
                let export = p.export_stack(&ctx).await?;
                let outputs = p.stack_outputs(&ctx).await?;
                StackInfo::from_export(&ctx.stack, &export, outputs)
            }
            .boxed()
        })
        .await
    }

    async fn validate(&mut self, step: usize, validator: Option<Arc<dyn Validator>>) -> Result<()> {
        let Some(validator) = validator else {
            return Ok(());
        };
        let info = self.stack_info(step).await?;
        self.phases
            .run(Phase::Validate, step, || {
                let (validator, info) = (validator.clone(), info.clone());
                async move {
                    info.ensure_populated()?;
                    run_validator(validator.as_ref(), &info).await
                }
            })
            .await
    }

    async fn refresh(&mut self, step: usize) -> Result<()> {
        let expect_no_changes = !self.scenario.flags.expect_refresh_changes;
        self.provision(Phase::Refresh, step, move |p, ctx| {
            async move { p.refresh(&ctx, expect_no_changes).await }.boxed()
        })
        .await
    }

    /// Overlay `dir` onto the working copy
    pub(crate) async fn apply_edit(&mut self, step: usize, dir: &Path) -> Result<()> {
        let (base, overlay) = (self.ctx.workdir.clone(), dir.to_path_buf());
        self.phases
            .run(Phase::ApplyEdit, step, || {
                let (base, overlay) = (base.clone(), overlay.clone());
                async move {
                    let files = apply_overlay(&base, &overlay)?;
                    debug!(overlay = %overlay.display(), files = ?files, "Edit applied");
                    Ok(())
                }
            })
            .await
    }

    async fn update_test(&mut self, step: usize) -> Result<()> {
        self.provision(Phase::UpdateTest, step, |p, ctx| {
            async move {
                p.preview(
                    &ctx,
                    PreviewOptions {
                        expect_no_changes: true,
                        json: false,
                    },
                )
                .await?;
                p.up(
                    &ctx,
                    UpOptions {
                        expect_no_changes: true,
                    },
                )
                .await
            }
            .boxed()
        })
        .await
    }

    async fn preview_only(&mut self) -> Result<()> {
        let result = self
            .provision_unchecked(Phase::Preview, 0, &|p, ctx| {
                async move { p.preview(&ctx, PreviewOptions::default()).await.map(|_| ()) }.boxed()
            })
            .await;
        self.settle(Phase::Preview, 0, self.scenario.flags.expect_failure, result)
            .map(|_| ())
    }

    /// Everything up to, not including, teardown
    async fn execute(&mut self) -> Result<()> {
        self.setup().await?;
        let flags = self.scenario.flags;
        if flags.preview_only {
            return self.preview_only().await;
        }

        if !self.deploy(0).await? {
            return Ok(());
        }
        self.validate(0, self.scenario.validate.clone()).await?;
        if !flags.quick && !flags.skip_refresh {
            self.refresh(0).await?;
        }

        let edits = self.scenario.edits.clone();
        for (i, edit) in edits.into_iter().enumerate() {
            let step = i + 1;
            self.apply_edit(step, &edit.dir).await?;
            self.deploy(step).await?;
            self.validate(step, edit.validate).await?;
        }

        if flags.run_update_test && !flags.quick {
            self.update_test(self.scenario.edits.len()).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    async fn teardown(&mut self) {
        if !self.stack_created {
            debug!(scenario = %self.scenario.name, "No stack created, nothing to tear down");
            return;
        }
        let step = self.state.deployed().unwrap_or(0);

        let mut destroyed = true;
        if self.up_attempted && !self.imported {
            let result = self
                .provision_unchecked(Phase::Destroy, step, &|p, ctx| {
                    async move { p.destroy(&ctx).await }.boxed()
                })
                .await;
            if let Err(e) = result {
                destroyed = false;
                self.teardown_failed(Phase::Destroy, step, e);
            }
        }

        if !destroyed {
            warn!(stack = %self.ctx.stack, "Keeping stack after failed destroy");
            return;
        }
        let force = self.imported;
        let result = self
            .provision_unchecked(Phase::RemoveStack, step, &move |p, ctx| {
                async move { p.remove_stack(&ctx, force).await }.boxed()
            })
            .await;
        if let Err(e) = result {
            self.teardown_failed(Phase::RemoveStack, step, e);
        }
    }

    fn teardown_failed(&mut self, phase: Phase, step: usize, err: Error) {
        let report = &mut self.phases.report;
        let teardown = Error::teardown(format!("{phase}: {err}"));
        report.teardown_error.get_or_insert_with(|| teardown.to_string());

        if report.failure.is_some() {
            warn!(scenario = %self.scenario.name, phase = %phase, error = %err, "Teardown failed after an earlier failure");
        } else if self.scenario.flags.ignore_destroy_errors {
            self.phases.mark_last(PhaseOutcome::Ignored);
            warn!(scenario = %self.scenario.name, phase = %phase, error = %err, "Ignoring teardown error");
        } else {
            self.phases.fail(phase, step, &err);
        }
    }

    /// Tear down, settle the final state and publish the report
    pub(crate) async fn finish(mut self) -> ScenarioReport {
        self.teardown().await;

        let failed = self.phases.report.outcome == Outcome::Failed;
        let terminal = if failed {
            ScenarioState::Failed
        } else {
            ScenarioState::Torn
        };
        if let Err(e) = self.state.advance(terminal) {
            error!(scenario = %self.scenario.name, error = %e, "Scenario state corrupted");
        }

        let mut report = self.phases.report;
        report.state = self.state;
        report.duration = self.started.elapsed();

        match &report.failure {
            Some(failure) => error!(
                scenario = %report.name,
                phase = %failure.phase,
                step = failure.step,
                message = %failure.message,
                "Scenario failed"
            ),
            None if failed => error!(scenario = %report.name, "Scenario failed"),
            None => info!(
                scenario = %report.name,
                duration_secs = report.duration.as_secs(),
                "Scenario passed"
            ),
        }

        let sink = self.driver.stats.clone().or_else(|| {
            self.scenario
                .sinks
                .stats
                .clone()
                .map(|target| Arc::new(S3CliSink::new(target)) as Arc<dyn StatsSink>)
        });
        if let Some(sink) = sink {
            match serde_json::to_value(&report) {
                Ok(value) => {
                    publish_in_background(
                        sink,
                        format!("{}-{}", report.name, report.stack_name),
                        value,
                    );
                }
                Err(e) => warn!(error = %e, "Failed to serialize scenario report"),
            }
        }

        // Removes the working copy
        drop(self.scratch.take());
        report
    }
}
