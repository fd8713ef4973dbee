//! Cluster API object construction
//!
//! Desired CAPI objects are built as [`CapiObject`]s (apiVersion, kind,
//! metadata, untyped spec) and converted to `DynamicObject`s for the applier.

use std::collections::BTreeMap;

use kube::api::DynamicObject;

use tessera_common::{Error, Result, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// CAPI core API version served by CAPV-compatible management clusters
pub const CAPI_CLUSTER_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

/// kubeadm bootstrap provider API version
pub const CAPI_BOOTSTRAP_API_VERSION: &str = "bootstrap.cluster.x-k8s.io/v1beta1";

/// CAPV infrastructure API version
pub const CAPV_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";

/// Label CAPI uses to associate objects with their Cluster
pub const CAPI_CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label naming the Tessera cluster an object belongs to
pub const TESSERA_CLUSTER_LABEL: &str = "tessera.dev/cluster";

/// Autoscaler annotation keys
pub const AUTOSCALER_MIN_SIZE: &str = "cluster.x-k8s.io/cluster-api-autoscaler-node-group-min-size";
/// Autoscaler annotation keys
pub const AUTOSCALER_MAX_SIZE: &str = "cluster.x-k8s.io/cluster-api-autoscaler-node-group-max-size";

/// A CAPI object represented as an untyped Kubernetes resource
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapiObject {
    /// API version (e.g., "cluster.x-k8s.io/v1beta1")
    pub api_version: String,
    /// Kind of resource (e.g., "MachineDeployment")
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMetadata,
    /// Resource spec (untyped)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,
}

/// Metadata for a [`CapiObject`]
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ObjectMetadata {
    /// Name of the resource
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl CapiObject {
    /// Create a new CAPI object
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: ObjectMetadata {
                name: name.into(),
                namespace: namespace.into(),
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
            },
            spec: None,
        }
    }

    /// Set the spec
    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Replace the labels
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.metadata.labels = labels;
        self
    }

    /// Add one annotation
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    /// Convert to the applier's untyped representation
    pub fn into_dynamic(self) -> Result<DynamicObject> {
        let kind = self.kind.clone();
        let value = serde_json::to_value(&self)
            .map_err(|e| Error::serialization_for_kind(&kind, e.to_string()))?;
        serde_json::from_value(value).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
    }
}

/// Standard labels for CAPI objects belonging to a cluster
pub fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CAPI_CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
        (TESSERA_CLUSTER_LABEL.to_string(), cluster_name.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}
