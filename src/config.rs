//! Harness configuration loaded from the environment
//!
//! # Environment Variables
//!
//! ```bash
//! AWS_REGION=us-west-2                     # required, tests skip without it
//! EKS_HARNESS_SHORT=1                      # short mode, long scenarios skip
//! PULUMI_BIN=/usr/local/bin/pulumi         # provisioner CLI
//! EKS_HARNESS_PACKAGE_MANAGER=yarn         # installs and links program deps
//! EKS_HARNESS_PLUGIN_DIR=../bin            # local candidate provider build
//! PULUMI_BACKEND_URL=file:///tmp/state     # passed through to the provisioner
//! EKS_HARNESS_STATS_BUCKET=eng.pulumi.com
//! EKS_HARNESS_STATS_REGION=us-west-2
//! EKS_HARNESS_STATS_PREFIX=testreports
//! EKS_HARNESS_TRACING_ENDPOINT=https://collector.example.com/api/v1/spans
//! EKS_HARNESS_PHASE_TIMEOUT_SECS=3600
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default S3 bucket for scenario stats
pub const DEFAULT_STATS_BUCKET: &str = "eng.pulumi.com";
/// Default region of the stats bucket
pub const DEFAULT_STATS_REGION: &str = "us-west-2";
/// Default key prefix for scenario stats
pub const DEFAULT_STATS_PREFIX: &str = "testreports";
/// Default trace collector handed to the provisioner
pub const DEFAULT_TRACING_ENDPOINT: &str =
    "https://tracing.pulumi-engineering.com/collector/api/v1/spans";
/// Default deadline for a single phase (deps, up, refresh, destroy, ...)
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Why a scenario did not run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skip {
    /// Human readable reason, logged by the test
    pub reason: String,
}

impl Skip {
    /// Create a skip with the given reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "skipped: {}", self.reason)
    }
}

/// Where scenario stats are shipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsTarget {
    /// S3 bucket name
    pub bucket: String,
    /// Bucket region
    pub region: String,
    /// Key prefix under the bucket
    pub prefix: String,
}

/// Process-wide harness settings
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Cloud region every scenario deploys into
    pub region: String,
    /// Short mode: long-running scenarios and upgrades skip
    pub short: bool,
    /// Provisioner CLI binary
    pub provisioner_bin: PathBuf,
    /// Package manager used to materialize program dependencies
    pub package_manager: String,
    /// Directory holding the locally built candidate provider plugin
    pub plugin_dir: Option<PathBuf>,
    /// State backend URL for the provisioner, if not the ambient login
    pub backend_url: Option<String>,
    /// Stats sink target
    pub stats: StatsTarget,
    /// Trace collector URL passed to the provisioner
    pub tracing_endpoint: Option<String>,
    /// Deadline for each phase
    pub phase_timeout: Duration,
}

impl HarnessConfig {
    /// Load from process environment variables
    ///
    /// Returns `Err(Skip)` when `AWS_REGION` is missing; that is never a failure.
    pub fn from_env() -> Result<Self, Skip> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Skip>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let region = var("AWS_REGION").ok_or_else(|| {
            Skip::new("Skipping test due to missing AWS_REGION environment variable")
        })?;

        let phase_timeout = var("EKS_HARNESS_PHASE_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PHASE_TIMEOUT);

        Ok(Self {
            region,
            short: var("EKS_HARNESS_SHORT").map(|v| is_truthy(&v)).unwrap_or(false),
            provisioner_bin: var("PULUMI_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("pulumi")),
            package_manager: var("EKS_HARNESS_PACKAGE_MANAGER")
                .unwrap_or_else(|| "yarn".to_string()),
            plugin_dir: var("EKS_HARNESS_PLUGIN_DIR").map(PathBuf::from),
            backend_url: var("PULUMI_BACKEND_URL"),
            stats: StatsTarget {
                bucket: var("EKS_HARNESS_STATS_BUCKET")
                    .unwrap_or_else(|| DEFAULT_STATS_BUCKET.to_string()),
                region: var("EKS_HARNESS_STATS_REGION")
                    .unwrap_or_else(|| DEFAULT_STATS_REGION.to_string()),
                prefix: var("EKS_HARNESS_STATS_PREFIX")
                    .unwrap_or_else(|| DEFAULT_STATS_PREFIX.to_string()),
            },
            tracing_endpoint: Some(
                var("EKS_HARNESS_TRACING_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_TRACING_ENDPOINT.to_string()),
            ),
            phase_timeout,
        })
    }

    /// Skip long-running scenarios in short mode
    pub fn skip_if_short(&self) -> Result<(), Skip> {
        if self.short {
            return Err(Skip::new("skipping test in short mode."));
        }
        Ok(())
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
