//! What happened during a scenario run

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::scenario::ScenarioState;
use crate::{Error, Result};

/// A step of the scenario lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Copy the program into a scratch directory
    Prepare,
    /// Install and link packages
    InstallDependencies,
    /// `stack init`
    InitStack,
    /// `config set`
    SetConfig,
    /// `preview`
    Preview,
    /// `up`
    Up,
    /// `stack export` and `stack output`
    Export,
    /// Validator run
    Validate,
    /// `refresh`
    Refresh,
    /// Overlay an edit directory
    ApplyEdit,
    /// Re-deploy the final program and require no changes
    UpdateTest,
    /// Fetch or pin a provider plugin
    Plugin,
    /// `stack import` of recorded state
    Import,
    /// `destroy`
    Destroy,
    /// `stack rm`
    RemoveStack,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Prepare => "prepare",
            Phase::InstallDependencies => "install-dependencies",
            Phase::InitStack => "init-stack",
            Phase::SetConfig => "set-config",
            Phase::Preview => "preview",
            Phase::Up => "up",
            Phase::Export => "export",
            Phase::Validate => "validate",
            Phase::Refresh => "refresh",
            Phase::ApplyEdit => "apply-edit",
            Phase::UpdateTest => "update-test",
            Phase::Plugin => "plugin",
            Phase::Import => "import",
            Phase::Destroy => "destroy",
            Phase::RemoveStack => "remove-stack",
        };
        f.write_str(s)
    }
}

/// How a phase ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseOutcome {
    /// Exit 0 or check passed
    Succeeded,
    /// Failed and failed the scenario
    Failed,
    /// Failed and that was the point (`expect_failure`)
    ExpectedFailure,
    /// Failed but was tolerated (`ignore_destroy_errors`)
    Ignored,
}

fn as_secs<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// One executed phase
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PhaseRecord {
    /// Which phase
    pub phase: Phase,
    /// Deploy index the phase belongs to (0 is the initial program)
    pub step: usize,
    /// Attempts made, more than one only under `retry_failed_steps`
    pub attempts: u32,
    /// Wall time including retries
    #[serde(rename = "durationSecs", serialize_with = "as_secs")]
    pub duration: Duration,
    /// Result
    pub outcome: PhaseOutcome,
}

/// The failure that decided a scenario's outcome
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScenarioFailure {
    /// Phase that failed
    pub phase: Phase,
    /// Deploy index the phase belongs to
    pub step: usize,
    /// Provisioner command line, when a subprocess failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Last 64 KiB of the subprocess output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tail: Option<String>,
    /// Error or assertion message
    pub message: String,
}

impl ScenarioFailure {
    /// Capture `err` as the failure of `phase`
    pub fn from_error(phase: Phase, step: usize, err: &Error) -> Self {
        let failure = err.provisioner_failure();
        Self {
            phase,
            step,
            command: failure.map(|f| f.command.clone()),
            output_tail: failure.map(|f| f.output_tail.clone()),
            message: err.to_string(),
        }
    }

    /// Failure without an underlying error
    pub fn message(phase: Phase, step: usize, message: impl Into<String>) -> Self {
        Self {
            phase,
            step,
            command: None,
            output_tail: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ScenarioFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {} (step {}) failed: {}", self.phase, self.step, self.message)?;
        if let Some(command) = &self.command {
            write!(f, "\ncommand: {command}")?;
        }
        if let Some(tail) = &self.output_tail {
            write!(f, "\noutput:\n{tail}")?;
        }
        Ok(())
    }
}

/// Final verdict of a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "kebab-case")]
pub enum Outcome {
    /// Everything the scenario asked for held
    Passed,
    /// See [`ScenarioReport::failure`] and [`ScenarioReport::teardown_error`]
    Failed,
    /// Did not run
    Skipped(String),
}

/// Everything the driver observed for one scenario
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    /// Scenario name
    pub name: String,
    /// Stack the scenario deployed
    pub stack_name: String,
    /// Final lifecycle state
    pub state: ScenarioState,
    /// Phases in execution order
    pub phases: Vec<PhaseRecord>,
    /// First failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ScenarioFailure>,
    /// Teardown problem; never replaces `failure`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_error: Option<String>,
    /// Verdict
    pub outcome: Outcome,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Total wall time
    #[serde(rename = "durationSecs", serialize_with = "as_secs")]
    pub duration: Duration,
}

impl ScenarioReport {
    pub(crate) fn new(name: impl Into<String>, stack_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stack_name: stack_name.into(),
            state: ScenarioState::Init,
            phases: Vec::new(),
            failure: None,
            teardown_error: None,
            outcome: Outcome::Passed,
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    /// Report for a scenario that never ran
    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Skipped(reason.into()),
            ..Self::new(name, "")
        }
    }

    /// Whether the run passed
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    /// Whether the run was skipped
    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, Outcome::Skipped(_))
    }

    /// Phases of one kind, in order
    pub fn phases_of(&self, phase: Phase) -> impl Iterator<Item = &PhaseRecord> {
        self.phases.iter().filter(move |p| p.phase == phase)
    }

    /// `Ok` unless the run failed; skipped runs are `Ok`
    pub fn ensure_passed(&self) -> Result<()> {
        if self.outcome != Outcome::Failed {
            return Ok(());
        }
        let mut msg = format!("scenario {} failed", self.name);
        if let Some(failure) = &self.failure {
            msg.push_str(&format!("\n{failure}"));
        }
        if let Some(teardown) = &self.teardown_error {
            msg.push_str(&format!("\nteardown: {teardown}"));
        }
        Err(Error::validation(msg))
    }

    pub(crate) fn record(
        &mut self,
        phase: Phase,
        step: usize,
        attempts: u32,
        duration: Duration,
        outcome: PhaseOutcome,
    ) {
        self.phases.push(PhaseRecord {
            phase,
            step,
            attempts,
            duration,
            outcome,
        });
    }

    /// Keep the first failure only
    pub(crate) fn fail(&mut self, failure: ScenarioFailure) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
        self.outcome = Outcome::Failed;
    }
}
