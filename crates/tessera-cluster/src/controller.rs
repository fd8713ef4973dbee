//! TesseraCluster controller glue
//!
//! Adapts the vSphere reconciler to kube-runtime: each reconcile call runs
//! one pass, persists whatever status the phases produced, and maps the
//! pass result onto an [`Action`]. Failed passes are requeued with a
//! per-cluster exponential backoff that resets on the next success.
//! Changes to a datacenter or machine config are mapped back to the
//! clusters that reference them so those clusters get a fresh pass.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use tessera_common::crd::{
    TesseraCluster, TesseraClusterStatus, VSphereDatacenterConfig, VSphereMachineConfig,
    VSPHERE_DATACENTER_KIND, VSPHERE_MACHINE_KIND,
};
use tessera_common::store::{api_resource_for, KubeObjectStore};
use tessera_common::{Error, ObjectKey, ObjectStore};

use crate::cni::{CiliumReconciler, FileManifestSource};
use crate::config::ControllerConfig;
use crate::remote::ClientRegistry;
use crate::spec::{build_spec, machine_refs};
use crate::vsphere::{GovcInventory, Reconciler, Validator};

/// First retry delay after a failed pass
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Longest retry delay
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Controller context shared by every reconcile call
pub struct Context {
    /// Management cluster store
    pub local: Arc<dyn ObjectStore>,
    /// vSphere reconciler
    pub reconciler: Reconciler,
    /// Field manager for status writes
    pub field_manager: String,
    /// Cancelled on shutdown; each pass runs under a child token
    pub shutdown: CancellationToken,
    /// Consecutive failures per cluster
    failures: DashMap<ObjectKey, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: ControllerConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Context over an arbitrary store and reconciler
    pub fn for_testing(local: Arc<dyn ObjectStore>, reconciler: Reconciler) -> Self {
        Self {
            local,
            reconciler,
            field_manager: tessera_common::DEFAULT_FIELD_MANAGER.to_string(),
            shutdown: CancellationToken::new(),
            failures: DashMap::new(),
        }
    }

    fn record_failure(&self, key: ObjectKey) -> u32 {
        let mut count = self.failures.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    fn reset_backoff(&self, key: &ObjectKey) {
        self.failures.remove(key);
    }

    /// Drop everything held for a cluster that no longer exists
    pub async fn forget(&self, cluster: &TesseraCluster) {
        self.reset_backoff(&cluster_key(cluster));
        self.reconciler.forget_cluster(cluster).await;
        debug!(cluster = %cluster.name_any(), "released state for deleted cluster");
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
    shutdown: Option<CancellationToken>,
}

impl ContextBuilder {
    fn new(client: Client, config: ControllerConfig) -> Self {
        Self {
            client,
            config,
            shutdown: None,
        }
    }

    /// Token whose cancellation aborts in-flight passes
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Wire the production collaborators
    pub fn build(self) -> Context {
        let config = self.config;
        let local: Arc<dyn ObjectStore> = Arc::new(KubeObjectStore::new(self.client));

        let registry = Arc::new(ClientRegistry::for_management_cluster(local.clone()));
        let validator = Arc::new(Validator::new(Arc::new(GovcInventory::new(
            config.govc_path.clone(),
        ))));
        let cni = Arc::new(CiliumReconciler::new(
            Arc::new(FileManifestSource::new(config.cilium_manifest.clone())),
            config.field_manager.clone(),
            config.cilium_version.clone(),
        ));

        let reconciler = Reconciler::new(
            local.clone(),
            registry,
            validator,
            cni,
            config.system_namespace.clone(),
            config.field_manager.clone(),
        );

        Context {
            local,
            reconciler,
            field_manager: config.field_manager,
            shutdown: self.shutdown.unwrap_or_default(),
            failures: DashMap::new(),
        }
    }
}

fn cluster_key(cluster: &TesseraCluster) -> ObjectKey {
    ObjectKey::namespaced(cluster.namespace().unwrap_or_default(), cluster.name_any())
}

/// Reconcile a TesseraCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<TesseraCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    info!("reconciling cluster");

    let mut spec = build_spec(ctx.local.as_ref(), &cluster).await?;
    let cancel = ctx.shutdown.child_token();

    // Phases set a message when they stop or fail for a reason worth showing
    let previous_failure = spec.status_mut().failure_message.take();
    let result = ctx.reconciler.reconcile_spec(&mut spec, &cancel).await;

    match &result {
        Ok(pass) if pass.is_completed() => {
            spec.status_mut().observed_generation = cluster.metadata.generation;
        }
        Ok(_) => {}
        Err(_) => {
            // A failure that explains nothing new keeps the last explanation
            let status = spec.status_mut();
            if status.failure_message.is_none() {
                status.failure_message = previous_failure;
            }
        }
    }

    // Status set by a failing phase is persisted too
    let persisted = persist_status(&cluster, spec.cluster.status.as_ref(), &ctx).await;
    let pass = result?;
    persisted?;

    ctx.reset_backoff(&cluster_key(&cluster));
    debug!(?pass, "pass finished");
    Ok(pass.to_action())
}

async fn persist_status(
    cluster: &TesseraCluster,
    status: Option<&TesseraClusterStatus>,
    ctx: &Context,
) -> Result<(), Error> {
    let before = cluster.status.clone().unwrap_or_default();
    let after = status.cloned().unwrap_or_default();
    if before == after {
        return Ok(());
    }

    // Explicit nulls so a merge patch clears fields
    let patch = serde_json::json!({
        "failureMessage": after.failure_message,
        "observedGeneration": after.observed_generation,
    });
    ctx.local
        .patch_status(
            &api_resource_for::<TesseraCluster>(),
            &cluster_key(cluster),
            patch,
            &ctx.field_manager,
        )
        .await?;
    debug!(failure = ?after.failure_message, "status updated");
    Ok(())
}

/// Clusters that reference `datacenter`
pub fn clusters_using_datacenter(
    clusters: &[Arc<TesseraCluster>],
    datacenter: &VSphereDatacenterConfig,
) -> Vec<ObjectRef<TesseraCluster>> {
    let name = datacenter.name_any();
    dependents(clusters, datacenter.namespace(), |cluster| {
        let r = &cluster.spec.datacenter_ref;
        r.kind == VSPHERE_DATACENTER_KIND && r.name == name
    })
}

/// Clusters that reference `machine_config` from any node group
pub fn clusters_using_machine_config(
    clusters: &[Arc<TesseraCluster>],
    machine_config: &VSphereMachineConfig,
) -> Vec<ObjectRef<TesseraCluster>> {
    let name = machine_config.name_any();
    dependents(clusters, machine_config.namespace(), |cluster| {
        machine_refs(cluster)
            .iter()
            .any(|r| r.kind == VSPHERE_MACHINE_KIND && r.name == name)
    })
}

// References never cross namespaces
fn dependents(
    clusters: &[Arc<TesseraCluster>],
    namespace: Option<String>,
    references: impl Fn(&TesseraCluster) -> bool,
) -> Vec<ObjectRef<TesseraCluster>> {
    clusters
        .iter()
        .map(Arc::as_ref)
        .filter(|cluster| cluster.namespace() == namespace && references(cluster))
        .map(ObjectRef::from_obj)
        .collect()
}

/// Requeue delay for the given consecutive failure count (1-based)
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1 << exponent).min(BACKOFF_MAX)
}

/// Error policy for the controller
pub fn error_policy(cluster: Arc<TesseraCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    if matches!(error, Error::Cancelled { .. }) {
        info!(cluster = %cluster.name_any(), %error, "reconciliation interrupted");
        return Action::await_change();
    }

    let attempt = ctx.record_failure(cluster_key(&cluster));
    let delay = if error.is_retryable() {
        backoff_delay(attempt)
    } else {
        BACKOFF_MAX
    };

    error!(
        ?error,
        cluster = %cluster.name_any(),
        attempt,
        requeue_after = ?delay,
        "reconciliation failed"
    );
    Action::requeue(delay)
}
