//! Per-scenario lifecycle state
//!
//! ```text
//! Init -> DepsReady -> Deployed(0) -> Deployed(1) -> ... -> Torn
//!    \________\______________\__________________________-> Failed
//! ```

use std::fmt;

use serde::Serialize;

use crate::{Error, Result};

/// Where a scenario is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ScenarioState {
    /// Nothing has happened yet
    Init,
    /// Dependencies are materialized in the working copy
    DepsReady,
    /// Deploy `n` succeeded (0 is the initial program, `i` is edit `i`)
    Deployed(usize),
    /// Teardown finished (or was not needed) and nothing failed
    Torn,
    /// Some test-visible failure occurred
    Failed,
}

impl ScenarioState {
    /// Whether the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScenarioState::Torn | ScenarioState::Failed)
    }

    /// Index of the last successful deploy, if any
    pub fn deployed(&self) -> Option<usize> {
        match self {
            ScenarioState::Deployed(n) => Some(*n),
            _ => None,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn advance(&mut self, next: ScenarioState) -> Result<()> {
        use ScenarioState::*;

        let legal = match (*self, next) {
            (Init, DepsReady) => true,
            (DepsReady, Deployed(0)) => true,
            (Deployed(i), Deployed(j)) => j == i + 1,
            (from, Torn | Failed) => !from.is_terminal(),
            _ => false,
        };

        if !legal {
            return Err(Error::setup(format!(
                "illegal scenario transition {self} -> {next}"
            )));
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioState::Init => write!(f, "Init"),
            ScenarioState::DepsReady => write!(f, "DepsReady"),
            ScenarioState::Deployed(n) => write!(f, "Deployed({n})"),
            ScenarioState::Torn => write!(f, "Torn"),
            ScenarioState::Failed => write!(f, "Failed"),
        }
    }
}
