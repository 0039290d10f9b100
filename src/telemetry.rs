//! Logging initialization for harness runs
//!
//! Scenario runs log through `tracing`. Spans for the deployment itself are
//! emitted by the provisioner towards its own collector; the harness only
//! writes structured log lines.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,eks_harness=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Output format of harness logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Pretty,
    /// One JSON object per line, for CI log ingestion
    Json,
}

/// Configuration for logging initialization
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Line format
    pub format: LogFormat,
    /// Route output through the test writer so `cargo test` captures it
    pub test_writer: bool,
}

impl LogConfig {
    /// Settings for integration tests
    pub fn for_tests() -> Self {
        Self {
            format: LogFormat::Pretty,
            test_writer: true,
        }
    }

    /// Honour `EKS_HARNESS_LOG_FORMAT=json`
    pub fn from_env() -> Self {
        let format = match std::env::var("EKS_HARNESS_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        Self {
            format,
            test_writer: false,
        }
    }
}

/// Install the global subscriber
///
/// Fails if a subscriber is already installed; callers that may race (tests)
/// should ignore the error.
pub fn init_logging(config: &LogConfig) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match (config.format, config.test_writer) {
        (LogFormat::Json, true) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_test_writer(),
            )
            .try_init(),
        (LogFormat::Json, false) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        (LogFormat::Pretty, true) => registry
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init(),
        (LogFormat::Pretty, false) => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };

    result.map_err(|e: tracing_subscriber::util::TryInitError| {
        TelemetryError::SubscriberInit(e.to_string())
    })
}
