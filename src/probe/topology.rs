//! What the stack resources say each cluster should look like
//!
//! Desired worker counts are summed per cluster across every node group
//! flavour (CloudFormation stacks, managed node groups, autoscaling groups).
//! Authentication modes come from the cluster resource's access config.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;

use crate::stack::Resource;
use crate::{Error, Result};

const CLOUDFORMATION_ID_PREFIX: &str = "arn:aws:cloudformation";
const MANAGED_NODE_GROUP: &str = "aws:eks/nodeGroup:NodeGroup";
const AUTOSCALING_GROUP: &str = "aws:autoscaling/group:Group";
const EKS_CLUSTER: &str = "aws:eks/cluster:Cluster";

/// How the cluster maps IAM identities to Kubernetes users
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthenticationMode {
    /// `aws-auth` ConfigMap only (EKS default)
    #[default]
    ConfigMap,
    /// Access entries only; `aws-auth` must be gone
    Api,
    /// Both mechanisms
    ApiAndConfigMap,
}

impl AuthenticationMode {
    /// Whether the `aws-auth` ConfigMap must exist
    pub fn uses_config_map(&self) -> bool {
        matches!(
            self,
            AuthenticationMode::ConfigMap | AuthenticationMode::ApiAndConfigMap
        )
    }
}

impl FromStr for AuthenticationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "CONFIG_MAP" => Ok(AuthenticationMode::ConfigMap),
            "API" => Ok(AuthenticationMode::Api),
            "API_AND_CONFIG_MAP" => Ok(AuthenticationMode::ApiAndConfigMap),
            other => Err(Error::validation(format!(
                "unknown authentication mode {other:?}"
            ))),
        }
    }
}

impl fmt::Display for AuthenticationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthenticationMode::ConfigMap => "CONFIG_MAP",
            AuthenticationMode::Api => "API",
            AuthenticationMode::ApiAndConfigMap => "API_AND_CONFIG_MAP",
        })
    }
}

#[derive(Deserialize)]
struct TemplateBody {
    #[serde(rename = "Resources")]
    resources: TemplateResources,
}

#[derive(Deserialize)]
struct TemplateResources {
    #[serde(rename = "NodeGroup")]
    node_group: TemplateNodeGroup,
}

#[derive(Deserialize)]
struct TemplateNodeGroup {
    #[serde(rename = "Properties")]
    properties: TemplateProperties,
}

#[derive(Deserialize)]
struct TemplateProperties {
    #[serde(rename = "DesiredCapacity", default)]
    desired_capacity: u32,
    #[serde(rename = "Tags", default)]
    tags: Vec<BTreeMap<String, serde_yaml::Value>>,
}

/// Worker node names are `<cluster>-worker...`
fn cluster_from_name_tag(tag: &str) -> String {
    tag.split("-worker").next().unwrap_or(tag).to_string()
}

fn as_u32(value: Option<&Value>, what: &str) -> Result<u32> {
    value
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| Error::validation(format!("{what} is missing or not a count")))
}

/// Total desired worker nodes per cluster name
pub fn desired_node_counts(resources: &[Resource]) -> Result<BTreeMap<String, u32>> {
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();

    for res in resources {
        let (cluster, desired) = if res
            .id
            .as_deref()
            .is_some_and(|id| id.starts_with(CLOUDFORMATION_ID_PREFIX))
        {
            let body = res
                .outputs
                .get("templateBody")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::validation(format!("{}: templateBody output missing", res.urn))
                })?;
            let template: TemplateBody = serde_yaml::from_str(body)?;
            let props = template.resources.node_group.properties;
            let name_tag = props
                .tags
                .iter()
                .find(|t| t.get("Key").and_then(serde_yaml::Value::as_str) == Some("Name"))
                .and_then(|t| t.get("Value"))
                .and_then(serde_yaml::Value::as_str)
                .unwrap_or_default()
                .to_string();
            (cluster_from_name_tag(&name_tag), props.desired_capacity)
        } else if res.type_ == MANAGED_NODE_GROUP {
            let cluster = res
                .inputs
                .get("clusterName")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::validation(format!("{}: clusterName input missing", res.urn)))?
                .to_string();
            let desired = as_u32(
                res.inputs
                    .get("scalingConfig")
                    .and_then(|s| s.get("desiredSize")),
                "scalingConfig.desiredSize",
            )?;
            (cluster, desired)
        } else if res.type_ == AUTOSCALING_GROUP {
            let name_tag = res
                .outputs
                .get("tags")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .find(|t| t.get("key").and_then(Value::as_str) == Some("Name"))
                .and_then(|t| t.get("value"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let desired = as_u32(res.outputs.get("desiredCapacity"), "desiredCapacity")?;
            (cluster_from_name_tag(name_tag), desired)
        } else {
            continue;
        };

        *counts.entry(cluster).or_default() += desired;
    }

    Ok(counts)
}

/// Authentication mode per cluster name
pub fn authentication_modes(resources: &[Resource]) -> Result<BTreeMap<String, AuthenticationMode>> {
    let mut modes = BTreeMap::new();
    for res in resources.iter().filter(|r| r.type_ == EKS_CLUSTER) {
        let name = res
            .outputs
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation(format!("{}: name output missing", res.urn)))?;
        let mode = res
            .inputs
            .get("accessConfig")
            .and_then(|a| a.get("authenticationMode"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .parse::<AuthenticationMode>()?;
        modes.insert(name.to_string(), mode);
    }
    Ok(modes)
}
