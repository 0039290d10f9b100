//! Node.js example programs
//!
//! Each test deploys one example with the suite's base options, smoke tests
//! the clusters it exports and destroys it again.
//!
//! ```bash
//! cargo test --features aws-e2e --test e2e nodejs_examples -- --ignored --nocapture
//! ```

#![cfg(feature = "aws-e2e")]

use std::collections::BTreeMap;
use std::time::Duration;

use eks_harness::access::{ClusterAccess, WorkloadKind};
use eks_harness::env::ScopedKubeconfig;
use eks_harness::probe::readiness::workload_ready;
use eks_harness::probe::{
    labelled_nodes, node_capacity, poll_until, validate_daemon_set, validate_nodes, wait_for_absent,
    Absent, HttpProbe, KindReadyProbe, DEFAULT_POLL_INTERVAL,
};
use eks_harness::scenario::ConfigValue;
use eks_harness::script::run_script;
use eks_harness::stack::StackInfo;
use eks_harness::validator::{
    CompositeValidator, FnValidator, HttpValidator, KindReadyValidator, RejectedKubeconfigValidator,
    SmokeValidator,
};
use eks_harness::{Edit, Error};
use rand::Rng;
use serde_json::Value;
use tracing::info;

use super::helpers::{set_profile_credentials, Suite};

const CNI_IMAGE_REGISTRY: &str = "602401143452.dkr.ecr.us-west-2.amazonaws.com";
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Log why a scenario is skipped; always reports that the test should stop
fn temporarily_skipped(reason: &str) -> bool {
    info!("{reason}");
    true
}

// =============================================================================
// Cluster variants
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_cluster() {
    let Some(suite) = Suite::load("cluster") else {
        return;
    };

    let aws_node = FnValidator::new("aws-node", |info: StackInfo| async move {
        info.output_str("iamRoleArn")?;
        let access = ClusterAccess::from_output(info.require_output("kubeconfig2")?).await?;
        validate_daemon_set(&access, "kube-system", "aws-node", |ds| {
            let spec = ds
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .ok_or_else(|| Error::validation("aws-node has no pod spec"))?;
            for ic in spec.init_containers.iter().flatten() {
                let want = format!("{CNI_IMAGE_REGISTRY}/amazon-k8s-cni-init:v1.11.0");
                if ic.image.as_deref() != Some(want.as_str()) {
                    return Err(Error::validation(format!(
                        "init container {} runs {:?}, want {want}",
                        ic.name, ic.image
                    )));
                }
                let tcp_early = ic
                    .env
                    .iter()
                    .flatten()
                    .any(|e| e.name == "DISABLE_TCP_EARLY_DEMUX" && e.value.as_deref() == Some("true"));
                if !tcp_early {
                    return Err(Error::validation(format!(
                        "init container {} does not set DISABLE_TCP_EARLY_DEMUX=true",
                        ic.name
                    )));
                }
            }
            for c in &spec.containers {
                let want = format!("{CNI_IMAGE_REGISTRY}/amazon-k8s-cni:v1.11.0");
                if c.image.as_deref() != Some(want.as_str()) {
                    return Err(Error::validation(format!(
                        "container {} runs {:?}, want {want}",
                        c.name, c.image
                    )));
                }
            }
            Ok(())
        })
        .await
    });

    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("cluster"))
                .validator(
                    CompositeValidator::new("cluster")
                        .then(SmokeValidator::for_outputs(["kubeconfig1", "kubeconfig2"]))
                        .then(aws_node),
                ),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_kubernetes_service_ipv4_range_for_cluster() {
    let Some(suite) = Suite::load("cluster-with-serviceiprange") else {
        return;
    };
    let range = FnValidator::new("service-range", |info: StackInfo| async move {
        let range = info.output_str("kubernetesServiceRange")?;
        if range != "172.16.0.0/20" {
            return Err(Error::validation(format!(
                "expected `172.16.0.0/20`: got {range:?}"
            )));
        }
        Ok(())
    });
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("cluster-with-serviceiprange"))
                .validator(range),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_fargate() {
    let Some(suite) = Suite::load("fargate") else {
        return;
    };
    // TODO[pulumi/pulumi-eks#286] Disabled until we address CNI daemonset issues which cause those daemonset pods not to get scheduled.
    // Smoke validation stays off until then.
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("fargate"))
                // Fargate is not available in every region
                .config("aws:region", "us-east-2"),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_node_group() {
    let Some(suite) = Suite::load("nodegroup") else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("nodegroup"))
                .validator(SmokeValidator::for_outputs(["kubeconfig1", "kubeconfig2"])),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_managed_node_group() {
    let Some(suite) = Suite::load("managed-nodegroups") else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("managed-nodegroups"))
                .validator(SmokeValidator::new()),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_managed_node_group_with_missing_role() {
    let Some(suite) = Suite::load("managed-ng-missing-role") else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/managed-ng-missing-role"))
                .with_flags(|f| {
                    f.expect_failure = true;
                    f.retry_failed_steps = false;
                    f.skip_refresh = true;
                    f.quick = true;
                }),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_managed_node_group_with_aws_auth() {
    let Some(suite) = Suite::load("managed-ng-aws-auth") else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/managed-ng-aws-auth"))
                .validator(SmokeValidator::new())
                .edit(
                    Edit::new(suite.program("tests/managed-ng-aws-auth/step1"))
                        .with_validator(SmokeValidator::new()),
                ),
        )
        .await;
}

// =============================================================================
// Single-kubeconfig smoke tables
// =============================================================================

async fn smoke_one(name: &str, dir: &str, outputs: &[&str], long: bool) {
    let suite = if long {
        Suite::load_long(name)
    } else {
        Suite::load(name)
    };
    let Some(suite) = suite else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program(dir))
                .validator(SmokeValidator::for_outputs(outputs.iter().copied())),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_tags() {
    smoke_one("tags", "tags", &["kubeconfig1", "kubeconfig2"], false).await;
}

#[tokio::test]
#[ignore]
async fn test_storage_classes() {
    smoke_one("storage-classes", "storage-classes", &["kubeconfig1", "kubeconfig2"], false).await;
}

#[tokio::test]
#[ignore]
async fn test_oidc_iam() {
    smoke_one("oidc-iam-sa", "oidc-iam-sa", &["kubeconfig"], false).await;
}

#[tokio::test]
#[ignore]
async fn test_scoped_kubeconfig() {
    smoke_one("scoped-kubeconfigs", "scoped-kubeconfigs", &["kubeconfig"], false).await;
}

#[tokio::test]
#[ignore]
async fn test_nodegroup_options() {
    smoke_one("nodegroup-options", "tests/nodegroup-options", &["kubeconfig"], false).await;
}

#[tokio::test]
#[ignore]
async fn test_encryption_provider() {
    smoke_one("encryption-provider", "encryption-provider", &["kubeconfig"], true).await;
}

#[tokio::test]
#[ignore]
async fn test_extra_security_groups() {
    smoke_one("extra-sg", "extra-sg", &["kubeconfig"], true).await;
}

#[tokio::test]
#[ignore]
async fn test_tag_input_types() {
    smoke_one("tag-input-types", "tests/tag-input-types", &["kubeconfig"], true).await;
}

#[tokio::test]
#[ignore]
async fn test_vpc_subnet_tags() {
    smoke_one("subnet-tags", "subnet-tags", &["kubeconfig"], true).await;
}

// =============================================================================
// AWS profiles
// =============================================================================

/// Profile the aws-profile program authenticates with
const PROFILE: &str = "aws-profile-node";

/// The program must authenticate through its profile alone, so the
/// provisioner runs with blank ambient credentials and without a default
/// AWS provider. Only the subprocess env changes; the test process keeps its
/// credentials.
#[tokio::test]
#[ignore]
async fn test_aws_profile() {
    let Some(suite) = Suite::load("aws-profile") else {
        return;
    };
    if !set_profile_credentials(PROFILE).await {
        return;
    }
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("aws-profile"))
                .env("AWS_PROFILE", "")
                .env("AWS_SECRET_ACCESS_KEY", "")
                .env("AWS_ACCESS_KEY_ID", "")
                .env("AWS_SESSION_TOKEN", "")
                .config_value(ConfigValue::path("pulumi:disable-default-providers[0]", "aws"))
                .with_flags(|f| f.retry_failed_steps = false)
                .validator(
                    CompositeValidator::new("aws-profile")
                        // Generated without the profile, so the cluster must refuse it
                        .then(RejectedKubeconfigValidator::new("kubeconfig"))
                        .then(SmokeValidator::for_outputs(["kubeconfigWithProfile"])),
                ),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_aws_profile_role() {
    let Some(suite) = Suite::load("aws-profile-role") else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("aws-profile-role"))
                .validator(SmokeValidator::new()),
        )
        .await;
}

// =============================================================================
// Edits
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_replace_sec_group() {
    if temporarily_skipped(
        "Temporarily skipping test - needs addressed as https://github.com/pulumi/pulumi-eks/issues/463",
    ) {
        return;
    }
    let Some(suite) = Suite::load("replace-secgroup") else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/replace-secgroup"))
                .edit(
                    Edit::new(suite.program("tests/replace-secgroup/step1"))
                        .with_validator(SmokeValidator::new()),
                ),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_replace_cluster_add_subnets() {
    let Some(suite) = Suite::load_long("replace-cluster-add-subnets") else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/replace-cluster-add-subnets"))
                .edit(
                    Edit::new(suite.program("tests/replace-cluster-add-subnets/step1"))
                        .with_validator(SmokeValidator::new()),
                ),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_import_default_eks_secgroup() {
    let Some(suite) = Suite::load_long("modify-default-eks-sg") else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("modify-default-eks-sg"))
                .validator(SmokeValidator::new())
                .edit(
                    Edit::new(suite.program("modify-default-eks-sg/step1"))
                        .with_validator(SmokeValidator::new()),
                ),
        )
        .await;
}

fn echoserver() -> HttpValidator {
    HttpValidator::new("nginxServiceUrl")
        .path("/echoserver")
        .header("Host", "apps.example.com")
}

/// Drain and delete the t3.2xlarge node group with kubectl scripts
fn retire_old_node_group(scripts: std::path::PathBuf) -> FnValidator {
    FnValidator::new("retire-2xlarge", move |info: StackInfo| {
        let scripts = scripts.clone();
        async move {
            let output = info.require_output("kubeconfig")?;
            let access = ClusterAccess::from_output(output).await?;
            let kubeconfig = ScopedKubeconfig::install(&access.raw).await?;
            let env = BTreeMap::from([(
                "KUBECONFIG".to_string(),
                kubeconfig.path().display().to_string(),
            )]);

            let out = run_script(&scripts.join("delete-aws-node-ds.sh"), &env, SCRIPT_TIMEOUT).await?;
            info!("kubectl delete ds/aws-node output: {out}");
            wait_for_absent(
                &access,
                &Absent::DaemonSet {
                    namespace: "kube-system".into(),
                    name: "aws-node".into(),
                },
                Duration::from_secs(5 * 60),
                Duration::from_secs(10),
            )
            .await?;

            let out =
                run_script(&scripts.join("drain-t3.2xlarge-nodes.sh"), &env, SCRIPT_TIMEOUT).await?;
            info!("kubectl drain output: {out}");
            let out =
                run_script(&scripts.join("delete-t3.2xlarge-nodes.sh"), &env, SCRIPT_TIMEOUT).await?;
            info!("kubectl delete output: {out}");
            Ok(())
        }
    })
}

#[tokio::test]
#[ignore]
async fn test_migrate_node_groups() {
    if temporarily_skipped(
        "Temporarily skipping test - needs addressed as https://github.com/pulumi/pulumi-eks/issues/467",
    ) {
        return;
    }
    let Some(suite) = Suite::load("migrate-nodegroups") else {
        return;
    };
    let root = suite.program("tests/migrate-nodegroups");
    let step = |n: u32| root.join("steps").join(format!("step{n}"));

    let all_ready = CompositeValidator::new("migrated")
        .then(echoserver())
        .then(KindReadyValidator::new(
            "kubeconfig",
            KindReadyProbe::new(WorkloadKind::ReplicaSet),
        ))
        .then(KindReadyValidator::new(
            "kubeconfig",
            KindReadyProbe::new(WorkloadKind::Deployment),
        ));

    suite
        .run(
            suite
                .js_base()
                .dir(&root)
                // NGINX on the 2xlarge node group
                .validator(echoserver())
                // Add the 4xlarge node group
                .edit(Edit::new(step(1)).with_validator(echoserver()))
                // Move NGINX to the 4xlarge group through its nodeSelector
                .edit(Edit::new(step(2)).with_validator(all_ready))
                // Drop the workload namespace and the aws-node DaemonSet
                .edit(Edit::new(step(3)).with_validator(retire_old_node_group(root.join("scripts"))))
                // Scale the 2xlarge group to zero
                .edit(Edit::new(step(4)))
                // Remove the 2xlarge group
                .edit(Edit::new(step(5))),
        )
        .await;
}

// =============================================================================
// Output and node assertions
// =============================================================================

/// Unset, null, or an empty string, list or map
fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

fn expect_empty(what: &str, value: Option<&Value>) -> Result<(), Error> {
    if !is_empty(value) {
        return Err(Error::validation(format!("expected {what} to be empty, got {value:?}")));
    }
    Ok(())
}

fn expect_set<'a>(what: &str, value: Option<&'a Value>) -> Result<&'a Value, Error> {
    match value {
        Some(v) if !is_empty(Some(v)) => Ok(v),
        _ => Err(Error::validation(format!("expected {what} to be set"))),
    }
}

fn expect_same(what: &str, got: Option<&Value>, want: Option<&Value>) -> Result<(), Error> {
    if got != want {
        return Err(Error::validation(format!("{what}: got {got:?}, want {want:?}")));
    }
    Ok(())
}

/// The OIDC issuer is the provider URL without its scheme
fn expect_issuer(cluster: &Value) -> Result<(), Error> {
    let url = expect_set("oidcProviderUrl", cluster.get("oidcProviderUrl"))?
        .as_str()
        .unwrap_or_default();
    let issuer = cluster.get("oidcIssuer").and_then(Value::as_str);
    if issuer != Some(url.replace("https://", "").as_str()) {
        return Err(Error::validation(format!(
            "oidcIssuer {issuer:?} is not oidcProviderUrl {url:?} without https://"
        )));
    }
    Ok(())
}

/// `expected` nodes labelled `label=true`, each reporting a `resource`
/// capacity that `accept` agrees with
fn labelled_capacity(
    label: &'static str,
    resource: &'static str,
    expected: usize,
    accept: fn(u128) -> bool,
) -> FnValidator {
    FnValidator::new(format!("{label}-{resource}"), move |info: StackInfo| async move {
        let access = ClusterAccess::from_output(info.require_output("kubeconfig")?).await?;
        validate_nodes(&access, |nodes| {
            let picked = labelled_nodes(nodes, label);
            if picked.len() != expected {
                return Err(Error::validation(format!(
                    "expected {expected} nodes labelled {label}, found {}",
                    picked.len()
                )));
            }
            for node in picked {
                let capacity = node_capacity(node, resource)?;
                if !capacity.is_some_and(accept) {
                    return Err(Error::validation(format!(
                        "node {:?} reports {resource} capacity {capacity:?}",
                        node.metadata.name
                    )));
                }
            }
            Ok(())
        })
        .await
    })
}

/// Exactly `expected` nodes expose `resource`, one unit each
fn single_device_nodes(resource: &'static str, expected: usize) -> FnValidator {
    FnValidator::new(format!("{resource}-nodes"), move |info: StackInfo| async move {
        let access = ClusterAccess::from_output(info.require_output("kubeconfig")?).await?;
        validate_nodes(&access, |nodes| {
            let mut found = 0;
            for node in nodes {
                match node_capacity(node, resource)? {
                    None => continue,
                    Some(1) => found += 1,
                    Some(n) => {
                        return Err(Error::validation(format!(
                            "node {:?} exposes {n} {resource}, want 1",
                            node.metadata.name
                        )))
                    }
                }
            }
            if found != expected {
                return Err(Error::validation(format!(
                    "expected {expected} nodes with {resource}, found {found}"
                )));
            }
            Ok(())
        })
        .await
    })
}

/// Wait for deployment `namespace/name` to become Available
async fn deployment_available(access: &ClusterAccess, namespace: &str, name: &str) -> Result<(), Error> {
    poll_until(
        Duration::from_secs(10 * 60),
        DEFAULT_POLL_INTERVAL,
        &format!("Deployment {namespace}/{name}"),
        move || async move {
            let deployments = access
                .client
                .list_workloads(WorkloadKind::Deployment, namespace)
                .await
                .map_err(|e| e.to_string())?;
            let deployment = deployments
                .iter()
                .find(|d| d.name() == name)
                .ok_or_else(|| format!("Deployment {namespace}/{name} not found"))?;
            workload_ready(deployment)
        },
    )
    .await
}

/// NGINX and CoreDNS run on auto mode compute
fn auto_mode_workloads() -> FnValidator {
    FnValidator::new("auto-mode-workloads", |info: StackInfo| async move {
        let access = ClusterAccess::from_output(info.require_output("kubeconfig")?).await?;
        for (namespace, name) in [("nginx", "nginx"), ("kube-system", "coredns")] {
            deployment_available(&access, namespace, name).await?;
        }
        Ok(())
    })
}

/// Auto mode programs tag subnets with the cluster name, so it must be
/// known up front and unique per run
fn auto_mode_cluster_name() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("eks-auto-mode-{suffix}")
}

// =============================================================================
// Authentication modes
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_authentication_mode() {
    smoke_one(
        "authentication-mode",
        "authentication-mode",
        &["kubeconfigConfigMap", "kubeconfigBoth", "kubeconfigApi"],
        true,
    )
    .await;
}

#[tokio::test]
#[ignore]
async fn test_multi_role() {
    smoke_one("multi-role", "tests/multi-role", &["kubeconfig"], true).await;
}

/// CONFIG_MAP, then API_AND_CONFIG_MAP with access entries, then API only
/// (which deletes aws-auth), then scale the node groups up so new instances
/// have to register through access entries
#[tokio::test]
#[ignore]
async fn test_authentication_mode_migration() {
    let Some(suite) = Suite::load_long("authentication-mode-migration") else {
        return;
    };
    let root = suite.program("tests/authentication-mode-migration");
    let mut scenario = suite
        .js_base()
        .dir(root.join("step1"))
        .validator(SmokeValidator::new());
    for step in ["step2", "step3", "step4"] {
        scenario = scenario.edit(Edit::new(root.join(step)).with_validator(SmokeValidator::new()));
    }
    suite.run(scenario).await;
}

// =============================================================================
// Node group variants
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_managed_node_group_disk_size() {
    let Some(suite) = Suite::load_long("managed-ng-disk-size") else {
        return;
    };
    // Size set by the program, in GB
    const DISK_SIZE: u128 = 50 * 1_000_000_000;
    let disk = FnValidator::new("disk-size", |info: StackInfo| async move {
        let access = ClusterAccess::from_output(info.require_output("kubeconfig")?).await?;
        validate_nodes(&access, |nodes| {
            if nodes.is_empty() {
                return Err(Error::validation("cluster has no nodes"));
            }
            for node in nodes {
                let storage = node_capacity(node, "ephemeral-storage")?;
                if !storage.is_some_and(|s| s >= DISK_SIZE) {
                    return Err(Error::validation(format!(
                        "node {:?} has ephemeral storage {storage:?}, want at least {DISK_SIZE}",
                        node.metadata.name
                    )));
                }
            }
            Ok(())
        })
        .await
    });
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/managed-ng-disk-size"))
                .validator(CompositeValidator::new("disk-size").then(SmokeValidator::new()).then(disk)),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_managed_node_group_custom() {
    let Some(suite) = Suite::load_long("custom-managed-nodegroup") else {
        return;
    };
    let launch_template = FnValidator::new("launch-template", |info: StackInfo| async move {
        expect_empty("defaultInstanceRoles", info.output("defaultInstanceRoles"))?;
        let want = info.output("launchTemplateName");
        let mut found = false;
        for group in info.resources_of_type("aws:eks/nodeGroup:NodeGroup") {
            found = true;
            let got = group.outputs.get("launchTemplate").and_then(|t| t.get("name"));
            expect_same(&format!("launch template of {}", group.urn), got, want)?;
        }
        if !found {
            return Err(Error::validation("no managed node group uses the custom launch template"));
        }
        Ok(())
    });
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("custom-managed-nodegroup"))
                .validator(
                    CompositeValidator::new("custom-managed-nodegroup")
                        .then(SmokeValidator::new())
                        .then(launch_template),
                ),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_managed_node_group_with_version() {
    smoke_one("managed-ng-with-version", "tests/managed-ng-with-version", &["kubeconfig"], true).await;
}

/// Matching nodes against the `customAmiId` output needs the EC2 API to
/// resolve instance AMIs, so only the node capacities are checked here.
#[tokio::test]
#[ignore]
async fn test_managed_node_group_os() {
    let Some(suite) = Suite::load_long("managed-ng-os") else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/managed-ng-os"))
                .validator(
                    CompositeValidator::new("managed-ng-os")
                        .then(SmokeValidator::new())
                        .then(labelled_capacity("increased-pod-capacity", "pods", 8, |pods| pods == 100))
                        .then(labelled_capacity(
                            "increased-storage-capacity",
                            "ephemeral-storage",
                            4,
                            |bytes| bytes >= 100 * 1_000_000_000,
                        ))
                        .then(single_device_nodes("nvidia.com/gpu", 2)),
                ),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_self_managed_node_group_os() {
    let Some(suite) = Suite::load_long("self-managed-ng-os") else {
        return;
    };
    let security_groups = FnValidator::new("node-security-groups", |info: StackInfo| async move {
        // Groups created by the node groups
        for (group, id) in [
            ("standardNodeSecurityGroup", "standardNodeSecurityGroupId"),
            ("standardNodeSecurityGroupV2", "standardNodeSecurityGroupIdV2"),
        ] {
            let created = expect_set(group, info.output(group))?;
            expect_same(id, info.output(id), created.get("id"))?;
        }
        // Groups passed in by ID are not created again
        expect_empty("customNodeSecurityGroup", info.output("customNodeSecurityGroup"))?;
        expect_empty("customNodeSecurityGroupV2", info.output("customNodeSecurityGroupV2"))?;
        let cluster_group = expect_set("clusterNodeSecurityGroupId", info.output("clusterNodeSecurityGroupId"))?;
        for id in ["customNodeSecurityGroupId", "customNodeSecurityGroupIdV2"] {
            expect_same(id, info.output(id), Some(cluster_group))?;
        }
        Ok(())
    });
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/self-managed-ng-os"))
                .validator(
                    CompositeValidator::new("self-managed-ng-os")
                        .then(SmokeValidator::new())
                        .then(labelled_capacity("increased-pod-capacity", "pods", 4, |pods| pods == 100))
                        .then(labelled_capacity(
                            "increased-storage-capacity",
                            "ephemeral-storage",
                            4,
                            |bytes| bytes >= 100 * 1_000_000_000,
                        ))
                        .then(security_groups),
                ),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_self_managed_node_group_instance_profile() {
    let Some(suite) = Suite::load_long("self-managed-ng-instanceProfile") else {
        return;
    };
    let profiles = FnValidator::new("instance-profiles", |info: StackInfo| async move {
        let passed = info.require_output("passedInstanceProfileName")?;
        for template in info.resources_of_type("aws:ec2/launchTemplate:LaunchTemplate") {
            let profile = expect_set(
                &format!("iamInstanceProfile of {}", template.urn),
                template.outputs.get("iamInstanceProfile"),
            )?;
            expect_same(&template.urn, profile.get("name"), Some(passed))?;
        }
        for config in info.resources_of_type("aws:ec2/launchConfiguration:LaunchConfiguration") {
            expect_same(&config.urn, config.outputs.get("iamInstanceProfile"), Some(passed))?;
        }
        Ok(())
    });
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/self-managed-ng-instanceProfile"))
                .validator(
                    CompositeValidator::new("instance-profile")
                        .then(SmokeValidator::new())
                        .then(profiles),
                ),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_default_instance_role() {
    let Some(suite) = Suite::load_long("default-instance-role") else {
        return;
    };
    let roles = FnValidator::new("instance-roles", |info: StackInfo| async move {
        let roles = info.require_output("instanceRoles")?;
        match roles.as_array() {
            Some(roles) if roles.len() == 1 => Ok(()),
            _ => Err(Error::validation(format!(
                "expected the default instance role only, got {roles}"
            ))),
        }
    });
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/default-instance-role"))
                .validator(CompositeValidator::new("default-instance-role").then(SmokeValidator::new()).then(roles)),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_efa() {
    if temporarily_skipped(
        "Skipping test: choosing availability zones for the EFA instance types needs the EC2 API",
    ) {
        return;
    }
    let Some(suite) = Suite::load_long("efa") else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("efa"))
                .validator(
                    CompositeValidator::new("efa")
                        .then(SmokeValidator::new())
                        .then(single_device_nodes("vpc.amazonaws.com/efa", 2)),
                ),
        )
        .await;
}

// =============================================================================
// Security groups and scalar outputs
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_skip_default_security_groups() {
    let Some(suite) = Suite::load_long("skip-default-security-groups") else {
        return;
    };
    let no_groups = FnValidator::new("no-default-groups", |info: StackInfo| async move {
        expect_empty("clusterSecurityGroup", info.output("clusterSecurityGroup"))?;
        expect_empty("nodeSecurityGroup", info.output("nodeSecurityGroup"))
    });
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/skip-default-security-groups"))
                .validator(
                    CompositeValidator::new("skip-default-security-groups")
                        .then(SmokeValidator::new())
                        .then(no_groups),
                ),
        )
        .await;
}

/// cluster1 runs the defaults with an OIDC provider; cluster2 runs on
/// Fargate without default node group, security groups or OIDC provider
#[tokio::test]
#[ignore]
async fn test_scalar_types() {
    let Some(suite) = Suite::load_long("scalar-types") else {
        return;
    };
    let scalars = FnValidator::new("scalar-outputs", |info: StackInfo| async move {
        let cluster1 = info.require_output("cluster1")?;
        for (group, id) in [
            ("clusterSecurityGroup", "clusterSecurityGroupId"),
            ("nodeSecurityGroup", "nodeSecurityGroupId"),
        ] {
            let created = expect_set(group, cluster1.get(group))?;
            expect_same(id, cluster1.get(id), created.get("id"))?;
        }
        expect_set("clusterIngressRuleId", cluster1.get("clusterIngressRuleId"))?;
        expect_empty("fargateProfileId", cluster1.get("fargateProfileId"))?;
        expect_empty("fargateProfileStatus", cluster1.get("fargateProfileStatus"))?;
        let node_group = expect_set("defaultNodeGroup", cluster1.get("defaultNodeGroup"))?;
        expect_same(
            "defaultNodeGroupAsgName",
            cluster1.get("defaultNodeGroupAsgName"),
            node_group.get("autoScalingGroup").and_then(|asg| asg.get("name")),
        )?;
        let core1 = expect_set("core", cluster1.get("core"))?;
        let oidc = expect_set("oidcProvider", core1.get("oidcProvider"))?;
        expect_same("oidcProviderArn", cluster1.get("oidcProviderArn"), oidc.get("arn"))?;
        expect_issuer(cluster1)?;

        let cluster2 = info.require_output("cluster2")?;
        // EKS always creates a cluster security group
        let eks_group = expect_set(
            "vpcConfig.clusterSecurityGroupId",
            cluster2
                .get("eksCluster")
                .and_then(|c| c.get("vpcConfig"))
                .and_then(|v| v.get("clusterSecurityGroupId")),
        )?;
        expect_same("clusterSecurityGroupId", cluster2.get("clusterSecurityGroupId"), Some(eks_group))?;
        expect_same("nodeSecurityGroupId", cluster2.get("nodeSecurityGroupId"), Some(eks_group))?;
        for unset in [
            "clusterSecurityGroup",
            "nodeSecurityGroup",
            "clusterIngressRuleId",
            "defaultNodeGroup",
            "defaultNodeGroupAsgName",
            "oidcProviderArn",
        ] {
            expect_empty(unset, cluster2.get(unset))?;
        }
        let core2 = expect_set("core", cluster2.get("core"))?;
        expect_empty("oidcProvider", core2.get("oidcProvider"))?;
        expect_issuer(cluster2)?;
        let fargate = expect_set("fargateProfile", core2.get("fargateProfile"))?;
        expect_same("fargateProfileId", cluster2.get("fargateProfileId"), fargate.get("id"))?;
        expect_same("fargateProfileStatus", cluster2.get("fargateProfileStatus"), fargate.get("status"))
    });
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/scalar-types"))
                .validator(
                    CompositeValidator::new("scalar-types")
                        .then(SmokeValidator::for_outputs(["kubeconfig1", "kubeconfig2"]))
                        .then(scalars),
                ),
        )
        .await;
}

// =============================================================================
// Auto mode
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_eks_auto_mode() {
    let Some(suite) = Suite::load_long("eks-auto-mode") else {
        return;
    };
    let outputs = FnValidator::new("auto-mode-outputs", |info: StackInfo| async move {
        info.output_str("nodeRoleName")?;
        expect_empty("defaultNodeGroup", info.output("defaultNodeGroup"))
    });
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("eks-auto-mode"))
                .config("clusterName", auto_mode_cluster_name())
                .validator(
                    CompositeValidator::new("eks-auto-mode")
                        .then(SmokeValidator::new())
                        .then(auto_mode_workloads())
                        .then(outputs)
                        .then(
                            HttpValidator::new("url")
                                .with_probe(HttpProbe::new("").deadline(Duration::from_secs(6 * 60)))
                                .predicate(|r| r.body.contains("Hello, Pulumi!")),
                        ),
                ),
        )
        .await;
}

/// Managed node groups first, then two steps moving the cluster to auto mode
#[tokio::test]
#[ignore]
async fn test_eks_auto_mode_upgrade() {
    let Some(suite) = Suite::load_long("auto-mode-upgrade") else {
        return;
    };
    let root = suite.program("tests/auto-mode-upgrade");
    let validator = || {
        CompositeValidator::new("auto-mode-upgrade")
            .then(SmokeValidator::new())
            .then(auto_mode_workloads())
    };
    suite
        .run(
            suite
                .js_base()
                .dir(&root)
                .config("clusterName", auto_mode_cluster_name())
                .validator(validator())
                .edit(Edit::new(root.join("step2")).with_validator(validator()))
                .edit(Edit::new(root.join("step3")).with_validator(validator())),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_auto_mode_custom_role() {
    let Some(suite) = Suite::load_long("auto-mode-custom-role") else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/auto-mode-custom-role"))
                .validator(
                    CompositeValidator::new("auto-mode-custom-role")
                        .then(SmokeValidator::new())
                        .then(auto_mode_workloads()),
                ),
        )
        .await;
}

#[tokio::test]
#[ignore]
async fn test_auto_mode_preview() {
    let Some(suite) = Suite::load_long("auto-mode-preview") else {
        return;
    };
    suite
        .run(
            suite
                .js_base()
                .dir(suite.program("tests/auto-mode-preview"))
                .with_flags(|f| f.preview_only = true),
        )
        .await;
}

// =============================================================================
// Skipped upstream
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_cluster_addons() {
    // Also needs the default and latest vpc-cni addon versions from the EKS API
    temporarily_skipped("Skipping test: resolving vpc-cni addon versions needs the EKS API");
}

#[tokio::test]
#[ignore]
async fn test_cni_across_updates() {
    // The VpcCni resource was removed, so deleting it needs the previous
    // provider version while the test only has the local one.
    temporarily_skipped("Skipping for now");
}

#[tokio::test]
#[ignore]
async fn test_network_policies() {
    temporarily_skipped("pulumi/pulumi-eks#1465");
}

#[tokio::test]
#[ignore]
async fn test_pod_security_groups() {
    temporarily_skipped("pulumi/pulumi-eks#1530");
}
