//! TesseraCluster Custom Resource Definition
//!
//! A TesseraCluster declares a workload cluster: its Kubernetes version, the
//! datacenter it runs in, and the machine shapes of its control plane, etcd
//! and worker node groups. Provider-specific detail lives in the referenced
//! datacenter and machine config objects.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AutoscalingConfiguration, Endpoint, ObjectRef, Taint};

/// Specification for a TesseraCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tessera.dev",
    version = "v1alpha1",
    kind = "TesseraCluster",
    plural = "tesseraclusters",
    shortname = "tc",
    status = "TesseraClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"K8s","type":"string","jsonPath":".spec.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Failure","type":"string","jsonPath":".status.failureMessage"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TesseraClusterSpec {
    /// Desired Kubernetes version (e.g. "1.31" or "1.31.2")
    pub kubernetes_version: String,

    /// Datacenter config this cluster is placed in
    pub datacenter_ref: ObjectRef,

    /// Control plane topology
    pub control_plane_configuration: ControlPlaneConfiguration,

    /// Stacked etcd when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_etcd_configuration: Option<ExternalEtcdConfiguration>,

    /// Worker node groups, each becoming one MachineDeployment
    #[serde(default)]
    pub worker_node_group_configurations: Vec<WorkerNodeGroupConfiguration>,

    /// Pod/service networking and CNI
    #[serde(default)]
    pub cluster_network: ClusterNetwork,
}

impl TesseraClusterSpec {
    /// Kubernetes version with a leading `v`, as CAPI expects
    pub fn capi_version(&self) -> String {
        format!("v{}", self.kubernetes_version.trim_start_matches('v'))
    }

    /// Desired Cilium version if one is pinned
    pub fn cilium_version(&self) -> Option<&str> {
        self.cluster_network
            .cni_config
            .as_ref()
            .and_then(|c| c.cilium.as_ref())
            .and_then(|c| c.version.as_deref())
    }

    /// Validate the cluster specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.kubernetes_version.trim().is_empty() {
            return Err(crate::Error::validation("kubernetesVersion cannot be empty"));
        }
        if self.control_plane_configuration.count == 0 {
            return Err(crate::Error::validation(
                "control plane count must be at least 1",
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for group in &self.worker_node_group_configurations {
            if !seen.insert(group.name.as_str()) {
                return Err(crate::Error::validation(format!(
                    "duplicate worker node group name '{}'",
                    group.name
                )));
            }
        }
        Ok(())
    }
}

/// Control plane topology
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfiguration {
    /// Number of control plane machines
    pub count: u32,

    /// API server endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,

    /// Machine config for control plane nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_group_ref: Option<ObjectRef>,

    /// Taints applied to control plane nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
}

/// Unstacked etcd topology
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalEtcdConfiguration {
    /// Number of etcd machines
    pub count: u32,

    /// Machine config for etcd nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_group_ref: Option<ObjectRef>,
}

/// A named group of identical worker machines
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerNodeGroupConfiguration {
    /// Group name, unique within the cluster
    pub name: String,

    /// Replica count; left to the autoscaler when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,

    /// Machine config for this group's nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_group_ref: Option<ObjectRef>,

    /// Node labels applied at registration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Node taints applied at registration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Cluster autoscaler bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling_configuration: Option<AutoscalingConfiguration>,
}

/// Cluster networking
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    /// Pod CIDR blocks
    #[serde(default)]
    pub pods: Vec<String>,

    /// Service CIDR blocks
    #[serde(default)]
    pub services: Vec<String>,

    /// CNI selection and settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni_config: Option<CniConfig>,
}

/// CNI selection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CniConfig {
    /// Cilium settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cilium: Option<CiliumConfig>,
}

/// Cilium settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CiliumConfig {
    /// Cilium version; the operator's bundled version when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// default, always or never
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_enforcement_mode: Option<String>,
}

/// Status for a TesseraCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TesseraClusterStatus {
    /// Human-readable reason the last reconciliation could not proceed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// The generation of the spec that was last reconciled to completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
