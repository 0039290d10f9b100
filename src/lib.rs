//! EKS Harness - end-to-end scenario harness for the EKS provisioning library
//!
//! The harness deploys example programs with the provisioner CLI, probes the
//! resulting Kubernetes clusters, applies in-place edits, and always tears the
//! infrastructure down again.
//!
//! # Architecture
//!
//! - A [`scenario::Scenario`] declares one exercise: a program, its config,
//!   ordered edits and per-step validators
//! - The [`driver::ScenarioDriver`] runs it phase by phase against a
//!   [`provisioner::Provisioner`] and produces a [`driver::ScenarioReport`]
//! - Validators use the [`probe`] library through [`access::ClusterAccess`],
//!   built from the kubeconfig a stack exports
//! - The [`upgrade::UpgradeDriver`] deploys with a released plugin and previews
//!   with a candidate build
//!
//! # Modules
//!
//! - [`scenario`] - Scenario model and lifecycle state
//! - [`driver`] - Scenario execution, phase records and reports
//! - [`upgrade`] - Baseline-to-candidate upgrade previews
//! - [`provisioner`] - Provisioner CLI abstraction
//! - [`access`] - Kubeconfig parsing and cluster clients
//! - [`probe`] - Readiness, smoke, object and HTTP probes
//! - [`validator`] - Validators composed from probes
//! - [`config`] - Harness settings from the environment
//! - [`error`] - Error types for the harness

#![deny(missing_docs)]

pub mod access;
pub mod config;
pub mod driver;
pub mod env;
pub mod error;
pub mod overlay;
pub mod probe;
pub mod provisioner;
pub mod retry;
pub mod scenario;
pub mod script;
pub mod stack;
pub mod stats;
pub mod telemetry;
pub mod upgrade;
pub mod validator;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub use driver::{ScenarioDriver, ScenarioReport};
pub use scenario::{Edit, Scenario};
pub use upgrade::{UpgradeDriver, UpgradeScenario};
