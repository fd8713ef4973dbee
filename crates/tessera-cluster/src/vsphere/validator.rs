//! Machine config validation
//!
//! Structural rules run first and need no network. Live checks then confirm
//! every datastore, folder, resource pool and template referenced by the
//! cluster's machine configs exists in vCenter.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use tessera_common::crd::VSphereMachineConfig;
use tessera_common::Error;

use super::credentials::VSphereConnection;
use super::govc::VSphereInventory;
use crate::spec::ClusterSpec;

/// Minimum vCPUs for any machine
pub const MIN_CPUS: u32 = 2;
/// Minimum memory for any machine
pub const MIN_MEMORY_MIB: u64 = 2048;
/// Minimum root disk for any machine
pub const MIN_DISK_GIB: u32 = 20;

/// Validates the machine configs a cluster references
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineConfigValidator: Send + Sync {
    /// Fail with a validation error describing the first problem found
    async fn validate_cluster_machine_configs(
        &self,
        conn: &VSphereConnection,
        spec: &ClusterSpec,
    ) -> Result<(), Error>;
}

/// Default validator: structural rules then vCenter lookups
pub struct Validator {
    inventory: Arc<dyn VSphereInventory>,
}

impl Validator {
    /// Validator backed by the given inventory
    pub fn new(inventory: Arc<dyn VSphereInventory>) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl MachineConfigValidator for Validator {
    async fn validate_cluster_machine_configs(
        &self,
        conn: &VSphereConnection,
        spec: &ClusterSpec,
    ) -> Result<(), Error> {
        validate_structure(spec)?;

        let cluster = spec.name();
        if !conn.insecure && !conn.thumbprint.is_empty() {
            let actual = self.inventory.server_thumbprint(conn).await?;
            if !actual.eq_ignore_ascii_case(&conn.thumbprint) {
                return Err(Error::validation_for_field(
                    &cluster,
                    "spec.thumbprint",
                    format!(
                        "thumbprint mismatch for {}: expected {}, got {}",
                        conn.server, conn.thumbprint, actual
                    ),
                ));
            }
        }

        let mut checked = BTreeSet::new();
        for (name, config) in &spec.machine_configs {
            for (field, path) in inventory_paths(config) {
                if !checked.insert(path) {
                    continue;
                }
                debug!(machine_config = %name, field, path, "checking inventory path");
                if !self.inventory.path_exists(conn, path).await? {
                    return Err(Error::validation_for_field(
                        &cluster,
                        format!("spec.{}", field),
                        format!("{} {} not found for machine config {}", field, path, name),
                    ));
                }
            }
        }

        Ok(())
    }
}

fn inventory_paths(config: &VSphereMachineConfig) -> Vec<(&'static str, &str)> {
    let spec = &config.spec;
    let mut paths = vec![
        ("datastore", spec.datastore.as_str()),
        ("resourcePool", spec.resource_pool.as_str()),
        ("template", spec.template.as_str()),
    ];
    if !spec.folder.is_empty() {
        paths.push(("folder", spec.folder.as_str()));
    }
    paths
}

/// Rules that need no vCenter access
pub fn validate_structure(spec: &ClusterSpec) -> Result<(), Error> {
    let cluster = spec.name();

    let control_plane = spec.control_plane_machine_config().ok_or_else(|| {
        Error::validation_for_field(
            &cluster,
            "spec.controlPlaneConfiguration.machineGroupRef",
            "control plane machine config is required",
        )
    })?;

    if spec.cluster.spec.external_etcd_configuration.is_some()
        && spec.etcd_machine_config().is_none()
    {
        return Err(Error::validation_for_field(
            &cluster,
            "spec.externalEtcdConfiguration.machineGroupRef",
            "external etcd requires a machine config",
        ));
    }

    for group in &spec.cluster.spec.worker_node_group_configurations {
        if spec.worker_machine_config(&group.name).is_none() {
            return Err(Error::validation_for_field(
                &cluster,
                "spec.workerNodeGroupConfigurations.machineGroupRef",
                format!("worker node group {} requires a machine config", group.name),
            ));
        }
        if let Some(autoscaling) = &group.autoscaling_configuration {
            if autoscaling.min_count > autoscaling.max_count {
                return Err(Error::validation_for_field(
                    &cluster,
                    "spec.workerNodeGroupConfigurations.autoscalingConfiguration",
                    format!(
                        "worker node group {}: minCount {} exceeds maxCount {}",
                        group.name, autoscaling.min_count, autoscaling.max_count
                    ),
                ));
            }
        }
    }

    for (name, config) in &spec.machine_configs {
        validate_machine_config(&cluster, name, config)?;
    }

    let os_family = control_plane.spec.os_family;
    if let Some((name, other)) = spec
        .machine_configs
        .iter()
        .find(|(_, mc)| mc.spec.os_family != os_family)
    {
        return Err(Error::validation_for_field(
            &cluster,
            "spec.osFamily",
            format!(
                "all machine configs must use the same osFamily: control plane uses {}, {} uses {}",
                os_family, name, other.spec.os_family
            ),
        ));
    }

    Ok(())
}

fn validate_machine_config(
    cluster: &str,
    name: &str,
    config: &VSphereMachineConfig,
) -> Result<(), Error> {
    let spec = &config.spec;
    let required = [
        ("datastore", &spec.datastore),
        ("resourcePool", &spec.resource_pool),
        ("template", &spec.template),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(Error::validation_for_field(
                cluster,
                format!("spec.{}", field),
                format!("machine config {}: {} is required", name, field),
            ));
        }
    }

    if spec.num_cpus < MIN_CPUS {
        return Err(Error::validation_for_field(
            cluster,
            "spec.numCPUs",
            format!(
                "machine config {}: numCPUs {} is below the minimum of {}",
                name, spec.num_cpus, MIN_CPUS
            ),
        ));
    }
    if spec.memory_mib < MIN_MEMORY_MIB {
        return Err(Error::validation_for_field(
            cluster,
            "spec.memoryMiB",
            format!(
                "machine config {}: memoryMiB {} is below the minimum of {}",
                name, spec.memory_mib, MIN_MEMORY_MIB
            ),
        ));
    }
    if spec.disk_gib < MIN_DISK_GIB {
        return Err(Error::validation_for_field(
            cluster,
            "spec.diskGiB",
            format!(
                "machine config {}: diskGiB {} is below the minimum of {}",
                name, spec.disk_gib, MIN_DISK_GIB
            ),
        ));
    }

    if let Some(user) = spec.users.iter().find(|u| u.name.trim().is_empty()) {
        return Err(Error::validation_for_field(
            cluster,
            "spec.users",
            format!(
                "machine config {}: user with {} key(s) has no name",
                name,
                user.ssh_authorized_keys.len()
            ),
        ));
    }

    Ok(())
}
