//! Upgrade previews: deploy with a released provider, preview with the local build
//!
//! The candidate build is taken from `EKS_HARNESS_PLUGIN_DIR`; without it the
//! tests skip.
//!
//! ```bash
//! EKS_HARNESS_PLUGIN_DIR=$PWD/../bin \
//! cargo test --features aws-e2e --test e2e upgrade -- --ignored --nocapture
//! ```

#![cfg(feature = "aws-e2e")]

use std::path::Path;

use eks_harness::scenario::ConfigValue;
use eks_harness::upgrade::ProgramSource;
use eks_harness::{Scenario, UpgradeDriver, UpgradeScenario};
use tracing::info;

use super::helpers::{set_profile_credentials, Suite};

/// Released provider version the candidate is compared against
const BASELINE_VERSION: &str = "2.7.3";

/// Recorded baseline states, relative to the crate root
const RECORDINGS_DIR: &str = "tests/testdata/recorded";

const CLUSTER_PROGRAM: &str = r#"name: cluster-upgrade
runtime: yaml
resources:
  cluster:
    type: eks:Cluster
    properties:
      skipDefaultNodeGroup: true
outputs:
  kubeconfig: ${cluster.kubeconfig}
"#;

const CLUSTER_PROGRAM_WITH_AUTH_MODE: &str = r#"name: cluster-upgrade
runtime: yaml
resources:
  cluster:
    type: eks:Cluster
    properties:
      skipDefaultNodeGroup: true
      authenticationMode: CONFIG_MAP
outputs:
  kubeconfig: ${cluster.kubeconfig}
"#;

async fn run_upgrade(suite: &Suite, upgrade: UpgradeScenario) {
    let name = upgrade.scenario.name.clone();
    let report = UpgradeDriver::from_config(&suite.config).run(upgrade).await;
    if report.is_skipped() {
        info!(scenario = %name, outcome = ?report.outcome, "Upgrade skipped");
        return;
    }
    if let Err(e) = report.ensure_passed() {
        panic!("{e}");
    }
    info!(scenario = %name, "TEST PASSED");
}

/// Deploy example `name` with the baseline provider and preview with the candidate
async fn upgrade_example(name: &str) {
    let Some(suite) = Suite::load(name) else {
        return;
    };
    let scenario = suite
        .js_base()
        .dir(suite.program(name))
        .build()
        .expect("upgrade scenario should be valid");
    run_upgrade(&suite, UpgradeScenario::new(scenario, BASELINE_VERSION)).await;
}

#[tokio::test]
#[ignore]
async fn test_cluster_upgrade() {
    upgrade_example("cluster").await;
}

#[tokio::test]
#[ignore]
async fn test_aws_profile_upgrade() {
    if !set_profile_credentials("aws-profile-node").await {
        return;
    }
    upgrade_example("aws-profile").await;
}

#[tokio::test]
#[ignore]
async fn test_aws_profile_role_upgrade() {
    upgrade_example("aws-profile-role").await;
}

#[tokio::test]
#[ignore]
async fn test_encryption_provider_upgrade() {
    upgrade_example("encryption-provider").await;
}

#[tokio::test]
#[ignore]
async fn test_cluster_with_serviceiprange_upgrade() {
    upgrade_example("cluster-with-serviceiprange").await;
}

#[tokio::test]
#[ignore]
async fn test_extra_sg_upgrade() {
    upgrade_example("extra-sg").await;
}

#[tokio::test]
#[ignore]
async fn test_fargate_upgrade() {
    info!("upgradetest doesn't understand invoke getSecurityGroup, tracked by providertest #31");
}

#[tokio::test]
#[ignore]
async fn test_managed_nodegroups_upgrade() {
    upgrade_example("managed-nodegroups").await;
}

#[tokio::test]
#[ignore]
async fn test_modify_default_eks_sg_upgrade() {
    info!("upgradetest doesn't understand invoke aws:ec2/getSecurityGroup:getSecurityGroup");
}

#[tokio::test]
#[ignore]
async fn test_nodegroup_upgrade() {
    upgrade_example("nodegroup").await;
}

#[tokio::test]
#[ignore]
async fn test_oidc_iam_sa_upgrade() {
    upgrade_example("oidc-iam-sa").await;
}

#[tokio::test]
#[ignore]
async fn test_scoped_kubeconfigs_upgrade() {
    info!("Requires source change for args of GetCallerIdentityArgs");
}

#[tokio::test]
#[ignore]
async fn test_storage_classes_upgrade() {
    upgrade_example("storage-classes").await;
}

#[tokio::test]
#[ignore]
async fn test_subnet_tags_upgrade() {
    upgrade_example("subnet-tags").await;
}

#[tokio::test]
#[ignore]
async fn test_tags_upgrade() {
    upgrade_example("tags").await;
}

/// Story: the managed node group ignores scaling changes, so raising
/// `desiredSize` on a deployed stack never replaces the group
#[tokio::test]
#[ignore]
async fn test_ignoring_scaling_changes() {
    let Some(suite) = Suite::load("ignore-scaling-changes") else {
        return;
    };
    let scenario = suite
        .js_base()
        .dir(suite.program("tests/ignore-scaling-changes"))
        .name("ignore-scaling-changes")
        .config("desiredSize", "1")
        .build()
        .expect("ignore-scaling-changes scenario should be valid");
    let upgrade = UpgradeScenario::new(scenario, BASELINE_VERSION)
        .recordings(Path::new(env!("CARGO_MANIFEST_DIR")).join(RECORDINGS_DIR))
        .override_config(ConfigValue::plain("desiredSize", "2"));
    run_upgrade(&suite, upgrade).await;
}

/// Story: changing the authentication mode of an existing cluster is an
/// in-place update, never a replacement
#[tokio::test]
#[ignore]
async fn test_cluster_code_change_upgrade() {
    let Some(suite) = Suite::load("cluster-code-change") else {
        return;
    };

    let program = tempfile::Builder::new()
        .prefix("cluster-upgrade-")
        .tempdir()
        .expect("Failed to create program dir");
    std::fs::write(program.path().join("Pulumi.yaml"), CLUSTER_PROGRAM)
        .expect("Failed to write program");

    let scenario = Scenario::builder(program.path())
        .name("cluster-code-change")
        .config("aws:region", &suite.config.region)
        .with_flags(|f| f.retry_failed_steps = true)
        .build()
        .expect("cluster-code-change scenario should be valid");
    let upgrade = UpgradeScenario::new(scenario, BASELINE_VERSION).followup(
        ProgramSource::Inline(CLUSTER_PROGRAM_WITH_AUTH_MODE.to_string()),
    );
    run_upgrade(&suite, upgrade).await;
}
