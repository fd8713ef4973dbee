//! vSphere provider CRDs
//!
//! `VSphereDatacenterConfig` describes the vCenter endpoint a cluster runs
//! against. Its status is written by a separate datacenter validator; the
//! cluster reconciler only reads `specValid`/`failureMessage`.
//! `VSphereMachineConfig` describes one machine shape.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind name used in `datacenterRef`
pub const VSPHERE_DATACENTER_KIND: &str = "VSphereDatacenterConfig";

/// Kind name used in `machineGroupRef`
pub const VSPHERE_MACHINE_KIND: &str = "VSphereMachineConfig";

/// Specification for a VSphereDatacenterConfig
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tessera.dev",
    version = "v1alpha1",
    kind = "VSphereDatacenterConfig",
    plural = "vspheredatacenterconfigs",
    status = "VSphereDatacenterConfigStatus",
    namespaced,
    printcolumn = r#"{"name":"Server","type":"string","jsonPath":".spec.server"}"#,
    printcolumn = r#"{"name":"Valid","type":"boolean","jsonPath":".status.specValid"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereDatacenterConfigSpec {
    /// vCenter hostname or IP
    pub server: String,

    /// Datacenter name or inventory path
    pub datacenter: String,

    /// Network (port group) path for machine NICs
    pub network: String,

    /// Skip TLS verification of vCenter
    #[serde(default)]
    pub insecure: bool,

    /// Expected SHA-1 thumbprint of the vCenter certificate
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thumbprint: String,
}

/// Status for a VSphereDatacenterConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereDatacenterConfigStatus {
    /// Whether the datacenter validator accepted the spec
    #[serde(default)]
    pub spec_valid: bool,

    /// Why the spec was rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Generation the validator last processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Guest operating system family of a template
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    /// Bottlerocket
    #[default]
    Bottlerocket,
    /// Ubuntu
    Ubuntu,
    /// Red Hat Enterprise Linux
    Redhat,
}

impl OsFamily {
    /// Default login user for machines of this family
    pub fn default_user(&self) -> &'static str {
        match self {
            OsFamily::Bottlerocket => "ec2-user",
            OsFamily::Ubuntu | OsFamily::Redhat => "capv",
        }
    }

    /// kubeadm bootstrap data format
    pub fn bootstrap_format(&self) -> &'static str {
        match self {
            OsFamily::Bottlerocket => "bottlerocket",
            OsFamily::Ubuntu | OsFamily::Redhat => "cloud-config",
        }
    }
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsFamily::Bottlerocket => write!(f, "bottlerocket"),
            OsFamily::Ubuntu => write!(f, "ubuntu"),
            OsFamily::Redhat => write!(f, "redhat"),
        }
    }
}

/// Login user configured on machines
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserConfiguration {
    /// User name
    pub name: String,
    /// Authorized SSH public keys
    #[serde(default)]
    pub ssh_authorized_keys: Vec<String>,
}

/// Specification for a VSphereMachineConfig
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tessera.dev",
    version = "v1alpha1",
    kind = "VSphereMachineConfig",
    plural = "vspheremachineconfigs",
    namespaced,
    printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.template"}"#,
    printcolumn = r#"{"name":"CPUs","type":"integer","jsonPath":".spec.numCPUs"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineConfigSpec {
    /// Datastore inventory path
    pub datastore: String,

    /// VM folder inventory path
    #[serde(default)]
    pub folder: String,

    /// Resource pool inventory path
    pub resource_pool: String,

    /// VM template inventory path
    pub template: String,

    /// vCPUs per machine
    #[serde(rename = "numCPUs")]
    pub num_cpus: u32,

    /// Memory per machine
    #[serde(rename = "memoryMiB")]
    pub memory_mib: u64,

    /// Root disk size
    #[serde(rename = "diskGiB")]
    pub disk_gib: u32,

    /// Guest OS family of the template
    #[serde(default)]
    pub os_family: OsFamily,

    /// Login users
    #[serde(default)]
    pub users: Vec<UserConfiguration>,

    /// vSphere storage policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_policy_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_config_uses_vsphere_field_names() {
        let yaml = r#"
datastore: /dc/datastore/ds1
folder: /dc/vm/tessera
resourcePool: /dc/host/cluster/Resources
template: /dc/vm/templates/ubuntu-2204-kube-v1.31
numCPUs: 4
memoryMiB: 8192
diskGiB: 40
osFamily: ubuntu
users:
  - name: capv
    sshAuthorizedKeys: ["ssh-ed25519 AAAA"]
"#;
        let spec: VSphereMachineConfigSpec = serde_yaml::from_str(yaml).expect("valid spec");
        assert_eq!(spec.num_cpus, 4);
        assert_eq!(spec.memory_mib, 8192);
        assert_eq!(spec.disk_gib, 40);
        assert_eq!(spec.os_family, OsFamily::Ubuntu);

        let json = serde_json::to_value(&spec).expect("serializable");
        assert_eq!(json["numCPUs"], 4);
        assert_eq!(json["memoryMiB"], 8192);
    }

    #[test]
    fn datacenter_status_defaults_to_not_valid() {
        let status: VSphereDatacenterConfigStatus =
            serde_json::from_str("{}").expect("empty status");
        assert!(!status.spec_valid);
        assert!(status.failure_message.is_none());
    }

    #[test]
    fn os_family_drives_bootstrap_format_and_user() {
        assert_eq!(OsFamily::Bottlerocket.bootstrap_format(), "bottlerocket");
        assert_eq!(OsFamily::Redhat.bootstrap_format(), "cloud-config");
        assert_eq!(OsFamily::Ubuntu.default_user(), "capv");
        assert_eq!(OsFamily::Bottlerocket.default_user(), "ec2-user");
    }
}
