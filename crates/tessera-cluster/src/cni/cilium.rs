//! Cilium install and upgrade
//!
//! The installed version is read off the `cilium` DaemonSet's agent image.
//! A matching version with a finished rollout is left alone; anything else
//! gets the bundled manifests applied and a requeue until the DaemonSet
//! reports every pod updated and ready. A bundle whose agent image is not
//! the desired version is rejected before anything is applied.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::api::DynamicObject;
use tracing::{debug, info};

use tessera_common::store::{from_dynamic, get_typed};
use tessera_common::{Error, ObjectKey, ObjectStore};

use super::{CniReconciler, ManifestSource};
use crate::applier::ObjectApplier;
use crate::phase::PhaseOutcome;
use crate::spec::ClusterSpec;

/// Namespace Cilium runs in
pub const CILIUM_NAMESPACE: &str = "kube-system";

/// Name of the Cilium agent DaemonSet
pub const CILIUM_DAEMONSET: &str = "cilium";

/// How long to wait before checking an in-progress rollout again
pub const ROLLOUT_REQUEUE: Duration = Duration::from_secs(10);

const AGENT_CONTAINER: &str = "cilium-agent";

/// [`CniReconciler`] for Cilium
pub struct CiliumReconciler {
    manifests: Arc<dyn ManifestSource>,
    field_manager: String,
    default_version: String,
}

impl CiliumReconciler {
    /// Reconciler installing `default_version` unless the cluster pins one
    pub fn new(
        manifests: Arc<dyn ManifestSource>,
        field_manager: impl Into<String>,
        default_version: impl Into<String>,
    ) -> Self {
        Self {
            manifests,
            field_manager: field_manager.into(),
            default_version: default_version.into(),
        }
    }

    fn desired_version(&self, spec: &ClusterSpec) -> String {
        normalize(
            spec.cluster
                .spec
                .cilium_version()
                .unwrap_or(&self.default_version),
        )
    }

    async fn converge(
        &self,
        remote: Arc<dyn ObjectStore>,
        spec: &ClusterSpec,
    ) -> Result<PhaseOutcome, Error> {
        let desired = self.desired_version(spec);
        let key = ObjectKey::namespaced(CILIUM_NAMESPACE, CILIUM_DAEMONSET);
        let daemonset: Option<DaemonSet> = get_typed(remote.as_ref(), &key).await?;

        if let Some(ds) = &daemonset {
            if installed_version(ds).as_deref() == Some(desired.as_str()) {
                if rollout_complete(ds) {
                    debug!(version = %desired, "cilium up to date");
                    return Ok(PhaseOutcome::Continue);
                }
                info!(version = %desired, "waiting for cilium rollout");
                return Ok(PhaseOutcome::requeue_after(ROLLOUT_REQUEUE));
            }
        }

        info!(
            installed = ?daemonset.as_ref().and_then(installed_version),
            desired = %desired,
            "applying cilium manifests"
        );
        let objects = self.manifests.manifests(&desired).await?;
        check_bundle_version(&spec.name(), &objects, &desired)?;
        let report = ObjectApplier::new(remote, self.field_manager.clone())
            .apply(|| Ok(objects))
            .await?;
        debug!(writes = report.writes(), "cilium manifests applied");

        Ok(PhaseOutcome::requeue_after(ROLLOUT_REQUEUE))
    }
}

#[async_trait]
impl CniReconciler for CiliumReconciler {
    async fn reconcile(
        &self,
        remote: Arc<dyn ObjectStore>,
        spec: &mut ClusterSpec,
    ) -> PhaseOutcome {
        match self.converge(remote, spec).await {
            Err(e @ Error::Validation { .. }) => {
                spec.set_failure_message(e.to_string());
                PhaseOutcome::Fail(e)
            }
            result => result.into(),
        }
    }
}

/// Reject a bundle that would never bring the agent to `desired`
fn check_bundle_version(
    cluster: &str,
    objects: &[DynamicObject],
    desired: &str,
) -> Result<(), Error> {
    let agent = objects.iter().find(|obj| {
        obj.types.as_ref().is_some_and(|t| t.kind == "DaemonSet")
            && obj.metadata.name.as_deref() == Some(CILIUM_DAEMONSET)
    });
    let Some(agent) = agent else {
        return Err(Error::validation_for(
            cluster,
            format!("cilium {desired} manifest bundle has no {CILIUM_DAEMONSET} DaemonSet"),
        ));
    };

    let ds: DaemonSet = from_dynamic(agent.clone())?;
    match installed_version(&ds) {
        Some(bundled) if bundled == desired => Ok(()),
        bundled => Err(Error::validation_for(
            cluster,
            format!(
                "cilium manifest bundle ships version {} but {} was requested",
                bundled.as_deref().unwrap_or("unknown"),
                desired
            ),
        )),
    }
}

fn normalize(version: &str) -> String {
    version.trim().trim_start_matches('v').to_string()
}

/// Version tag of the agent image, without any leading `v` or digest
fn installed_version(ds: &DaemonSet) -> Option<String> {
    let containers = &ds.spec.as_ref()?.template.spec.as_ref()?.containers;
    let container = containers
        .iter()
        .find(|c| c.name == AGENT_CONTAINER)
        .or_else(|| containers.first())?;
    let image = container.image.as_deref()?;
    let image = image.split('@').next()?;
    let (repo, tag) = image.rsplit_once(':')?;
    // "registry:5000/cilium" has a port, not a tag
    if tag.contains('/') || repo.is_empty() {
        return None;
    }
    Some(normalize(tag))
}

fn rollout_complete(ds: &DaemonSet) -> bool {
    let Some(status) = &ds.status else {
        return false;
    };
    let generation_seen = match (ds.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => observed >= generation,
        (Some(_), None) => false,
        (None, _) => true,
    };
    let desired = status.desired_number_scheduled;
    generation_seen
        && status.updated_number_scheduled.unwrap_or(0) >= desired
        && status.number_ready >= desired
}
