//! Per-pass desired-state snapshot
//!
//! A [`ClusterSpec`] is assembled fresh at the start of every pass from the
//! TesseraCluster and the objects it references. Phases read it and mutate
//! the cluster status it carries; the controller persists that status.

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::debug;

use tessera_common::crd::{
    ObjectRef, TesseraCluster, TesseraClusterStatus, VSphereDatacenterConfig,
    VSphereMachineConfig, VSPHERE_DATACENTER_KIND, VSPHERE_MACHINE_KIND,
};
use tessera_common::store::get_typed;
use tessera_common::{Error, ObjectKey, ObjectStore};

/// Cluster plus every object it references, frozen for one pass
#[derive(Clone, Debug)]
pub struct ClusterSpec {
    /// The cluster being reconciled; its status is mutated by phases
    pub cluster: TesseraCluster,
    /// Referenced datacenter config
    pub datacenter: VSphereDatacenterConfig,
    /// Referenced machine configs by name
    pub machine_configs: BTreeMap<String, VSphereMachineConfig>,
}

impl ClusterSpec {
    /// Cluster name
    pub fn name(&self) -> String {
        self.cluster.name_any()
    }

    /// Mutable status, created empty if absent
    pub fn status_mut(&mut self) -> &mut TesseraClusterStatus {
        self.cluster.status.get_or_insert_with(Default::default)
    }

    /// Current failure message, if any
    pub fn failure_message(&self) -> Option<&str> {
        self.cluster
            .status
            .as_ref()
            .and_then(|s| s.failure_message.as_deref())
    }

    /// Record why the pass could not proceed
    pub fn set_failure_message(&mut self, message: impl Into<String>) {
        self.status_mut().failure_message = Some(message.into());
    }

    /// Control plane machine config
    pub fn control_plane_machine_config(&self) -> Option<&VSphereMachineConfig> {
        self.machine_config(
            self.cluster
                .spec
                .control_plane_configuration
                .machine_group_ref
                .as_ref(),
        )
    }

    /// External etcd machine config, if etcd is unstacked
    pub fn etcd_machine_config(&self) -> Option<&VSphereMachineConfig> {
        self.machine_config(
            self.cluster
                .spec
                .external_etcd_configuration
                .as_ref()
                .and_then(|e| e.machine_group_ref.as_ref()),
        )
    }

    /// Machine config for a worker node group
    pub fn worker_machine_config(&self, group: &str) -> Option<&VSphereMachineConfig> {
        self.cluster
            .spec
            .worker_node_group_configurations
            .iter()
            .find(|g| g.name == group)
            .and_then(|g| self.machine_config(g.machine_group_ref.as_ref()))
    }

    fn machine_config(&self, r: Option<&ObjectRef>) -> Option<&VSphereMachineConfig> {
        r.and_then(|r| self.machine_configs.get(&r.name))
    }
}

/// Every machine config ref the cluster names, deduplicated
pub(crate) fn machine_refs(cluster: &TesseraCluster) -> Vec<&ObjectRef> {
    let spec = &cluster.spec;
    let mut refs: Vec<&ObjectRef> = Vec::new();
    let candidates = spec
        .control_plane_configuration
        .machine_group_ref
        .iter()
        .chain(
            spec.external_etcd_configuration
                .iter()
                .filter_map(|e| e.machine_group_ref.as_ref()),
        )
        .chain(
            spec.worker_node_group_configurations
                .iter()
                .filter_map(|g| g.machine_group_ref.as_ref()),
        );
    for r in candidates {
        if !refs.iter().any(|seen| seen.name == r.name) {
            refs.push(r);
        }
    }
    refs
}

/// Assemble the snapshot for one pass from the management cluster
///
/// A structurally invalid cluster fails before anything is read. Any missing
/// or mistyped reference fails the whole build.
pub async fn build_spec(
    store: &dyn ObjectStore,
    cluster: &TesseraCluster,
) -> Result<ClusterSpec, Error> {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .ok_or_else(|| Error::spec_build(&name, "cluster has no namespace"))?;
    cluster.spec.validate().map_err(|e| match e {
        Error::Validation { message, field, .. } => Error::Validation {
            cluster: name.clone(),
            message,
            field,
        },
        other => other,
    })?;

    let dc_ref = &cluster.spec.datacenter_ref;
    if dc_ref.kind != VSPHERE_DATACENTER_KIND {
        return Err(Error::spec_build(
            &name,
            format!(
                "datacenterRef kind {} is not supported, expected {}",
                dc_ref.kind, VSPHERE_DATACENTER_KIND
            ),
        ));
    }
    let datacenter: VSphereDatacenterConfig =
        get_typed(store, &ObjectKey::namespaced(&namespace, &dc_ref.name))
            .await
            .map_err(|e| Error::spec_build(&name, format!("reading {}: {}", dc_ref.name, e)))?
            .ok_or_else(|| {
                Error::spec_build(
                    &name,
                    format!("{} {} not found", VSPHERE_DATACENTER_KIND, dc_ref.name),
                )
            })?;

    let mut machine_configs = BTreeMap::new();
    for r in machine_refs(cluster) {
        if r.kind != VSPHERE_MACHINE_KIND {
            return Err(Error::spec_build(
                &name,
                format!(
                    "machineGroupRef kind {} is not supported, expected {}",
                    r.kind, VSPHERE_MACHINE_KIND
                ),
            ));
        }
        let config: VSphereMachineConfig =
            get_typed(store, &ObjectKey::namespaced(&namespace, &r.name))
                .await
                .map_err(|e| Error::spec_build(&name, format!("reading {}: {}", r.name, e)))?
                .ok_or_else(|| {
                    Error::spec_build(
                        &name,
                        format!("{} {} not found", VSPHERE_MACHINE_KIND, r.name),
                    )
                })?;
        machine_configs.insert(r.name.clone(), config);
    }

    debug!(
        cluster = %name,
        machine_configs = machine_configs.len(),
        "built cluster spec"
    );

    Ok(ClusterSpec {
        cluster: cluster.clone(),
        datacenter,
        machine_configs,
    })
}
