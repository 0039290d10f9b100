//! Error types for the EKS scenario harness

use std::time::Duration;

use thiserror::Error;

/// Bytes of provisioner output retained for failure reports
pub const OUTPUT_TAIL_LIMIT: usize = 64 * 1024;

/// Lowercased stderr fragments that mark a provisioner failure as transient.
///
/// Covers AWS throttling, flaky networking, and IAM eventual consistency
/// where a freshly created role or instance profile is not yet visible.
const TRANSIENT_MARKERS: &[&str] = &[
    "requestlimitexceeded",
    "throttling",
    "toomanyrequests",
    "rate exceeded",
    "serviceunavailable",
    "internalfailure",
    "connection reset by peer",
    "connection refused",
    "i/o timeout",
    "tls handshake timeout",
    "timeout awaiting response headers",
    "invalid iam instance profile",
    "cannot be assumed by",
    "eventual consistency",
];

/// A non-zero exit (or spawn failure) of the external provisioner CLI
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{command}` failed ({}): {}", exit_label(.exit_code), last_line(.output_tail))]
pub struct ProvisionerFailure {
    /// Full command line that was executed
    pub command: String,
    /// Exit code, `None` when the process was killed or never started
    pub exit_code: Option<i32>,
    /// Last [`OUTPUT_TAIL_LIMIT`] bytes of combined stdout and stderr
    pub output_tail: String,
}

impl ProvisionerFailure {
    /// Build a failure from raw process output, keeping only the tail
    pub fn new(command: impl Into<String>, exit_code: Option<i32>, output: &[u8]) -> Self {
        Self {
            command: command.into(),
            exit_code,
            output_tail: output_tail(output),
        }
    }

    /// Whether the output carries a marker of a transient cloud or network failure
    pub fn is_transient(&self) -> bool {
        let lower = self.output_tail.to_lowercase();
        TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "terminated".to_string(),
    }
}

fn last_line(output: &str) -> &str {
    output
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("<no output>")
}

/// Keep the last [`OUTPUT_TAIL_LIMIT`] bytes of `output`, cut on a char boundary
pub fn output_tail(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    if text.len() <= OUTPUT_TAIL_LIMIT {
        return text.into_owned();
    }
    let mut start = text.len() - OUTPUT_TAIL_LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Main error type for harness operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Environment or working-directory problem detected before any side effect
    #[error("setup error: {0}")]
    Setup(String),

    /// Provisioner CLI exited non-zero
    #[error("provisioner error: {0}")]
    Provisioner(#[from] ProvisionerFailure),

    /// A validator or probe assertion did not hold
    #[error("validation error: {0}")]
    Validation(String),

    /// Destroy or stack removal failed
    #[error("teardown error: {0}")]
    Teardown(String),

    /// Kubeconfig could not be parsed or turned into a client
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// A probe could not complete its query
    #[error("probe error: {0}")]
    Probe(String),

    /// An operation exceeded its deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// What was running
        operation: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// The scenario was cancelled by the test runner
    #[error("cancelled during {0}")]
    Cancelled(String),

    /// Filesystem error with context
    #[error("io error: {context}: {source}")]
    Io {
        /// What the harness was doing
        context: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    /// Create a setup error with the given message
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a teardown error with the given message
    pub fn teardown(msg: impl Into<String>) -> Self {
        Self::Teardown(msg.into())
    }

    /// Create a kubeconfig error with the given message
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig(msg.into())
    }

    /// Create a probe error with the given message
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Wrap an io error with a description of what was being done
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns true if the error is transient and the step may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provisioner(failure) => failure.is_transient(),
            Error::Kube(kube::Error::HyperError(_)) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 429 || resp.code >= 500,
            _ => false,
        }
    }

    /// The provisioner failure behind this error, if any
    pub fn provisioner_failure(&self) -> Option<&ProvisionerFailure> {
        match self {
            Error::Provisioner(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
