//! StackInfo: the structured result of a successful phase
//!
//! Materialized from `stack export` (resources) and `stack output --json`
//! (named outputs) after every deploy. Validators receive it read-only.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// A deployed resource record as it appears in the exported state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource URN
    pub urn: String,
    /// Type token, e.g. `aws:eks/cluster:Cluster`
    #[serde(rename = "type")]
    pub type_: String,
    /// Provider-assigned ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Resource inputs
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Resource outputs
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

/// The `deployment` section of an exported stack
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Resources in dependency order
    #[serde(default)]
    pub resources: Vec<Resource>,
}

#[derive(Deserialize)]
struct UntypedDeployment {
    #[serde(default)]
    deployment: Option<Deployment>,
}

/// Resources and outputs of a stack after a phase
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StackInfo {
    /// Stack name
    pub stack_name: String,
    /// Deployed resources
    pub deployment: Deployment,
    /// Named stack outputs, either strings or structured documents
    pub outputs: Map<String, Value>,
}

impl StackInfo {
    /// Build from the JSON of `stack export` and `stack output --json`
    pub fn from_export(stack_name: &str, export: &Value, outputs: Value) -> Result<Self> {
        let untyped: UntypedDeployment = serde_json::from_value(export.clone())?;
        let outputs = match outputs {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::serialization(format!(
                    "stack outputs must be an object, got {other}"
                )))
            }
        };
        Ok(Self {
            stack_name: stack_name.to_string(),
            deployment: untyped.deployment.unwrap_or_default(),
            outputs,
        })
    }

    /// Look up an output by name
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name).filter(|v| !v.is_null())
    }

    /// An output that must be present
    pub fn require_output(&self, name: &str) -> Result<&Value> {
        self.output(name)
            .ok_or_else(|| Error::validation(format!("stack output {name:?} is missing")))
    }

    /// A string output that must be present and non-empty
    pub fn output_str(&self, name: &str) -> Result<&str> {
        match self.require_output(name)? {
            Value::String(s) if !s.is_empty() => Ok(s),
            Value::String(_) => Err(Error::validation(format!("stack output {name:?} is empty"))),
            other => Err(Error::validation(format!(
                "stack output {name:?} is not a string: {other}"
            ))),
        }
    }

    /// Fail when the phase produced no outputs at all
    pub fn ensure_populated(&self) -> Result<()> {
        if self.outputs.is_empty() {
            return Err(Error::validation(format!(
                "stack {} produced no outputs",
                self.stack_name
            )));
        }
        Ok(())
    }

    /// Resources of the given type token
    pub fn resources_of_type<'a>(&'a self, type_: &'a str) -> impl Iterator<Item = &'a Resource> {
        self.deployment
            .resources
            .iter()
            .filter(move |r| r.type_ == type_)
    }
}
