//! Shared types used across CRD definitions

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to another Tessera object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// Kind of the referenced object (e.g. `VSphereMachineConfig`)
    pub kind: String,
    /// Name of the referenced object
    pub name: String,
}

impl ObjectRef {
    /// Create a reference
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// API server endpoint for a cluster control plane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Virtual IP or hostname of the API server
    pub host: String,
}

/// Node taint applied at kubelet registration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Taint value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// NoSchedule, PreferNoSchedule or NoExecute
    pub effect: String,
}

impl Taint {
    /// Render as kubelet `--register-with-taints` entry
    pub fn to_kubelet_arg(&self) -> String {
        match &self.value {
            Some(v) => format!("{}={}:{}", self.key, v, self.effect),
            None => format!("{}:{}", self.key, self.effect),
        }
    }
}

/// Cluster autoscaler bounds for a worker node group
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingConfiguration {
    /// Minimum node count
    pub min_count: u32,
    /// Maximum node count
    pub max_count: u32,
}
