//! Readiness rules per object kind
//!
//! Pure functions over API objects. A not-ready result carries a short
//! reason that ends up in the probe's failure message.

use k8s_openapi::api::apps::v1::{
    DaemonSet, Deployment, DeploymentCondition, ReplicaSet, ReplicaSetCondition, StatefulSet,
};
use k8s_openapi::api::core::v1::{Node, NodeCondition, Pod, PodCondition};

use crate::access::Workload;

const STATUS_TRUE: &str = "True";

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

macro_rules! impl_condition_fields {
    ($($ty:ty),*) => {
        $(impl HasConditionFields for $ty {
            fn type_field(&self) -> &str {
                &self.type_
            }
            fn status_field(&self) -> &str {
                &self.status
            }
        })*
    };
}

impl_condition_fields!(NodeCondition, DeploymentCondition, ReplicaSetCondition, PodCondition);

/// Check if a condition of the given type has status True
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Node is Ready
pub fn node_ready(node: &Node) -> Result<(), String> {
    let conditions = node.status.as_ref().and_then(|s| s.conditions.as_deref());
    if has_condition(conditions, "Ready") {
        Ok(())
    } else {
        Err("Ready condition is not True".to_string())
    }
}

/// Deployment reports Available
pub fn deployment_ready(deployment: &Deployment) -> Result<(), String> {
    let conditions = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref());
    if has_condition(conditions, "Available") {
        Ok(())
    } else {
        Err("Available condition is not True".to_string())
    }
}

/// ReplicaSet has no ReplicaFailure and all replicas are available and ready
pub fn replica_set_ready(rs: &ReplicaSet) -> Result<(), String> {
    let status = rs.status.as_ref().ok_or("no status reported")?;
    if let Some(failure) = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|c| c.type_ == "ReplicaFailure")
    {
        return Err(format!(
            "ReplicaFailure: {}",
            failure.message.as_deref().unwrap_or("no message")
        ));
    }
    let available = status.available_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);
    if status.replicas == available && status.replicas == ready {
        Ok(())
    } else {
        Err(format!(
            "{} replicas, {available} available, {ready} ready",
            status.replicas
        ))
    }
}

/// DaemonSet has every scheduled pod ready
pub fn daemon_set_ready(ds: &DaemonSet) -> Result<(), String> {
    let status = ds.status.as_ref().ok_or("no status reported")?;
    if status.desired_number_scheduled == status.number_ready {
        Ok(())
    } else {
        Err(format!(
            "{} of {} scheduled pods ready",
            status.number_ready, status.desired_number_scheduled
        ))
    }
}

/// StatefulSet has all desired replicas ready
pub fn stateful_set_ready(sts: &StatefulSet) -> Result<(), String> {
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = sts
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    if ready >= desired {
        Ok(())
    } else {
        Err(format!("{ready} of {desired} replicas ready"))
    }
}

/// Pod has succeeded, or is running with Ready True
pub fn pod_ready(pod: &Pod) -> Result<(), String> {
    let status = pod.status.as_ref().ok_or("no status reported")?;
    match status.phase.as_deref() {
        Some("Succeeded") => Ok(()),
        Some("Running") if has_condition(status.conditions.as_deref(), "Ready") => Ok(()),
        Some("Running") => Err("running but Ready condition is not True".to_string()),
        Some(phase) => Err(format!("phase {phase}")),
        None => Err("no phase reported".to_string()),
    }
}

/// Dispatch on the workload's kind
pub fn workload_ready(workload: &Workload) -> Result<(), String> {
    match workload {
        Workload::Deployment(o) => deployment_ready(o),
        Workload::ReplicaSet(o) => replica_set_ready(o),
        Workload::DaemonSet(o) => daemon_set_ready(o),
        Workload::StatefulSet(o) => stateful_set_ready(o),
        Workload::Pod(o) => pod_ready(o),
    }
}
