//! Custom Resource Definitions for Tessera
//!
//! This module contains all CRD definitions read by the Tessera operator.

mod cluster;
mod types;
mod vsphere;

pub use cluster::{
    CiliumConfig, CniConfig, ClusterNetwork, ControlPlaneConfiguration, ExternalEtcdConfiguration,
    TesseraCluster, TesseraClusterSpec, TesseraClusterStatus, WorkerNodeGroupConfiguration,
};
pub use types::{AutoscalingConfiguration, Endpoint, ObjectRef, Taint};
pub use vsphere::{
    OsFamily, UserConfiguration, VSphereDatacenterConfig, VSphereDatacenterConfigSpec,
    VSphereDatacenterConfigStatus, VSphereMachineConfig, VSphereMachineConfigSpec,
    VSPHERE_DATACENTER_KIND, VSPHERE_MACHINE_KIND,
};
