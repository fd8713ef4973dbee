//! Controller configuration

use std::path::PathBuf;

use tessera_common::{DEFAULT_FIELD_MANAGER, TESSERA_SYSTEM_NAMESPACE};

/// Cilium version installed when a cluster does not pin one
pub const DEFAULT_CILIUM_VERSION: &str = "1.15.6";

/// Where the operator image ships its Cilium manifests
pub const DEFAULT_CILIUM_MANIFEST_PATH: &str = "/etc/tessera/cilium";

/// Settings the controller is built from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace holding credentials and CAPI objects
    pub system_namespace: String,
    /// Server-side apply field manager
    pub field_manager: String,
    /// Cilium manifest bundle, a file or a directory of versioned bundles
    pub cilium_manifest: PathBuf,
    /// Cilium version for clusters that do not pin one
    pub cilium_version: String,
    /// `govc` binary used for vCenter lookups
    pub govc_path: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            system_namespace: TESSERA_SYSTEM_NAMESPACE.to_string(),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            cilium_manifest: PathBuf::from(DEFAULT_CILIUM_MANIFEST_PATH),
            cilium_version: DEFAULT_CILIUM_VERSION.to_string(),
            govc_path: PathBuf::from("govc"),
        }
    }
}
