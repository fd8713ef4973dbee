//! Worker node group CAPI objects
//!
//! Each worker node group becomes a KubeadmConfigTemplate, a
//! VSphereMachineTemplate and a MachineDeployment referencing both. CAPI
//! treats templates as immutable, so template names carry a hash of their
//! spec: a changed machine shape yields a new template and a rolling update
//! of the MachineDeployment, while an unchanged one yields identical names
//! and no writes.

use kube::api::DynamicObject;

use tessera_common::crd::{VSphereMachineConfig, WorkerNodeGroupConfiguration};
use tessera_common::kube_utils::deterministic_hash;
use tessera_common::{Error, Result};

use crate::capi::{
    cluster_labels, CapiObject, AUTOSCALER_MAX_SIZE, AUTOSCALER_MIN_SIZE,
    CAPI_BOOTSTRAP_API_VERSION, CAPI_CLUSTER_API_VERSION, CAPV_API_VERSION,
};
use crate::spec::ClusterSpec;

/// Label added to every node in a worker node group
pub const NODE_GROUP_LABEL: &str = "tessera.dev/node-group";

/// Desired CAPI objects for every worker node group, in group order
pub fn workers_spec(spec: &ClusterSpec, namespace: &str) -> Result<Vec<DynamicObject>> {
    let cluster = spec.name();
    let mut objects = Vec::new();

    for group in &spec.cluster.spec.worker_node_group_configurations {
        let machine = spec.worker_machine_config(&group.name).ok_or_else(|| {
            Error::validation_for_field(
                &cluster,
                "spec.workerNodeGroupConfigurations.machineGroupRef",
                format!("worker node group {} has no machine config", group.name),
            )
        })?;

        let bootstrap = kubeadm_config_template(spec, group, machine, namespace)?;
        let infra = machine_template(spec, group, machine, namespace)?;
        let deployment = machine_deployment(
            spec,
            group,
            namespace,
            &bootstrap.metadata.name,
            &infra.metadata.name,
        );

        objects.push(bootstrap.into_dynamic()?);
        objects.push(infra.into_dynamic()?);
        objects.push(deployment.into_dynamic()?);
    }

    Ok(objects)
}

fn group_prefix(cluster: &str, group: &str) -> String {
    format!("{}-{}", cluster, group)
}

/// Name a template after its content
fn hashed_name(prefix: &str, spec: &serde_json::Value) -> Result<String> {
    let canonical = serde_json::to_string(spec).map_err(|e| Error::serialization(e.to_string()))?;
    Ok(format!("{}-{}", prefix, &deterministic_hash(&canonical)[..8]))
}

fn kubeadm_config_template(
    spec: &ClusterSpec,
    group: &WorkerNodeGroupConfiguration,
    machine: &VSphereMachineConfig,
    namespace: &str,
) -> Result<CapiObject> {
    let cluster = spec.name();

    let mut kubelet_args = serde_json::Map::new();
    kubelet_args.insert("cloud-provider".to_string(), "external".into());
    kubelet_args.insert(
        "tls-cipher-suites".to_string(),
        "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256".into(),
    );

    let mut node_labels = group.labels.clone();
    node_labels.insert(NODE_GROUP_LABEL.to_string(), group.name.clone());
    let labels: Vec<String> = node_labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    kubelet_args.insert("node-labels".to_string(), labels.join(",").into());

    let taints: Vec<serde_json::Value> = group
        .taints
        .iter()
        .map(|t| {
            let mut taint = serde_json::json!({"key": t.key, "effect": t.effect});
            if let Some(v) = &t.value {
                taint["value"] = v.clone().into();
            }
            taint
        })
        .collect();

    let users: Vec<serde_json::Value> = machine
        .spec
        .users
        .iter()
        .map(|u| {
            serde_json::json!({
                "name": u.name,
                "sshAuthorizedKeys": u.ssh_authorized_keys,
                "sudo": "ALL=(ALL) NOPASSWD:ALL"
            })
        })
        .collect();

    let template_spec = serde_json::json!({
        "template": {
            "spec": {
                "format": machine.spec.os_family.bootstrap_format(),
                "joinConfiguration": {
                    "nodeRegistration": {
                        "criSocket": "/var/run/containerd/containerd.sock",
                        "name": "{{ ds.meta_data.hostname }}",
                        "kubeletExtraArgs": kubelet_args,
                        "taints": taints
                    }
                },
                "preKubeadmCommands": [
                    "hostname \"{{ ds.meta_data.hostname }}\"",
                    "echo \"::1         ipv6-localhost ipv6-loopback\" >/etc/hosts",
                    "echo \"127.0.0.1   localhost\" >>/etc/hosts",
                    "echo \"127.0.0.1   {{ ds.meta_data.hostname }}\" >>/etc/hosts",
                    "echo \"{{ ds.meta_data.hostname }}\" >/etc/hostname"
                ],
                "users": users
            }
        }
    });

    let name = hashed_name(&group_prefix(&cluster, &group.name), &template_spec)?;
    Ok(CapiObject::new(
        CAPI_BOOTSTRAP_API_VERSION,
        "KubeadmConfigTemplate",
        name,
        namespace,
    )
    .with_labels(cluster_labels(&cluster))
    .with_spec(template_spec))
}

fn machine_template(
    spec: &ClusterSpec,
    group: &WorkerNodeGroupConfiguration,
    machine: &VSphereMachineConfig,
    namespace: &str,
) -> Result<CapiObject> {
    let cluster = spec.name();
    let dc = &spec.datacenter.spec;
    let mc = &machine.spec;

    let mut vm = serde_json::json!({
        "cloneMode": "linkedClone",
        "datacenter": dc.datacenter,
        "datastore": mc.datastore,
        "diskGiB": mc.disk_gib,
        "folder": mc.folder,
        "memoryMiB": mc.memory_mib,
        "numCPUs": mc.num_cpus,
        "network": {
            "devices": [{"dhcp4": true, "networkName": dc.network}]
        },
        "resourcePool": mc.resource_pool,
        "server": dc.server,
        "template": mc.template,
        "thumbprint": dc.thumbprint
    });
    if let Some(policy) = &mc.storage_policy_name {
        vm["storagePolicyName"] = policy.clone().into();
    }

    let template_spec = serde_json::json!({ "template": { "spec": vm } });
    let name = hashed_name(&group_prefix(&cluster, &group.name), &template_spec)?;

    Ok(
        CapiObject::new(CAPV_API_VERSION, "VSphereMachineTemplate", name, namespace)
            .with_labels(cluster_labels(&cluster))
            .with_spec(template_spec),
    )
}

fn machine_deployment(
    spec: &ClusterSpec,
    group: &WorkerNodeGroupConfiguration,
    namespace: &str,
    bootstrap_template: &str,
    machine_template: &str,
) -> CapiObject {
    let cluster = spec.name();
    let name = group_prefix(&cluster, &group.name);

    let mut md_spec = serde_json::json!({
        "clusterName": cluster,
        "selector": {"matchLabels": {}},
        "template": {
            "metadata": {
                "labels": { NODE_GROUP_LABEL: group.name }
            },
            "spec": {
                "clusterName": cluster,
                "version": spec.cluster.spec.capi_version(),
                "bootstrap": {
                    "configRef": {
                        "apiVersion": CAPI_BOOTSTRAP_API_VERSION,
                        "kind": "KubeadmConfigTemplate",
                        "name": bootstrap_template
                    }
                },
                "infrastructureRef": {
                    "apiVersion": CAPV_API_VERSION,
                    "kind": "VSphereMachineTemplate",
                    "name": machine_template
                }
            }
        }
    });

    // Replicas are owned by the autoscaler when one is configured
    if let Some(count) = group.count {
        if group.autoscaling_configuration.is_none() {
            md_spec["replicas"] = count.into();
        }
    }

    let mut md = CapiObject::new(CAPI_CLUSTER_API_VERSION, "MachineDeployment", name, namespace)
        .with_labels(cluster_labels(&cluster))
        .with_spec(md_spec);

    if let Some(autoscaling) = &group.autoscaling_configuration {
        md = md
            .with_annotation(AUTOSCALER_MIN_SIZE, autoscaling.min_count.to_string())
            .with_annotation(AUTOSCALER_MAX_SIZE, autoscaling.max_count.to_string());
    }

    md
}
