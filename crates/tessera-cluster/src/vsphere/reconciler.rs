//! vSphere cluster reconciler
//!
//! One pass builds the cluster spec and then runs the fixed vSphere phase
//! sequence:
//!
//! 1. `validateDatacenterConfig`: stop quietly while the datacenter config
//!    is not marked valid
//! 2. `validateMachineConfigs`: structural and vCenter checks
//! 3. `reconcileControlPlane`
//! 4. `reconcileCNI`: install or upgrade Cilium on the workload cluster
//! 5. `reconcileWorkers`: apply worker CAPI objects to the management cluster

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use tessera_common::crd::TesseraCluster;
use tessera_common::{Error, ObjectKey, ObjectStore};

use super::credentials::{read_credentials, VSphereConnection};
use super::validator::MachineConfigValidator;
use super::workers::workers_spec;
use crate::applier::ObjectApplier;
use crate::cni::CniReconciler;
use crate::phase::{PassResult, Phase, PhaseOutcome, PhaseRunner};
use crate::remote::RemoteClientRegistry;
use crate::spec::{build_spec, ClusterSpec};

/// The vSphere phases, in the order they run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VSpherePhase {
    /// Wait for the datacenter config to be marked valid
    ValidateDatacenterConfig,
    /// Check machine configs against vCenter
    ValidateMachineConfigs,
    /// Control plane objects
    ReconcileControlPlane,
    /// CNI on the workload cluster
    ReconcileCni,
    /// Worker node group objects
    ReconcileWorkers,
}

impl VSpherePhase {
    /// Every phase in execution order
    pub const ALL: [VSpherePhase; 5] = [
        VSpherePhase::ValidateDatacenterConfig,
        VSpherePhase::ValidateMachineConfigs,
        VSpherePhase::ReconcileControlPlane,
        VSpherePhase::ReconcileCni,
        VSpherePhase::ReconcileWorkers,
    ];

    /// Name used in logs, spans and [`PassResult::Stopped`]
    pub fn as_str(&self) -> &'static str {
        match self {
            VSpherePhase::ValidateDatacenterConfig => "validateDatacenterConfig",
            VSpherePhase::ValidateMachineConfigs => "validateMachineConfigs",
            VSpherePhase::ReconcileControlPlane => "reconcileControlPlane",
            VSpherePhase::ReconcileCni => "reconcileCNI",
            VSpherePhase::ReconcileWorkers => "reconcileWorkers",
        }
    }
}

#[async_trait]
impl Phase<Reconciler, ClusterSpec> for VSpherePhase {
    fn name(&self) -> &str {
        self.as_str()
    }

    async fn run(&self, reconciler: &Reconciler, spec: &mut ClusterSpec) -> PhaseOutcome {
        match self {
            VSpherePhase::ValidateDatacenterConfig => reconciler.validate_datacenter_config(spec),
            VSpherePhase::ValidateMachineConfigs => {
                reconciler.validate_machine_configs(spec).await
            }
            VSpherePhase::ReconcileControlPlane => reconciler.reconcile_control_plane(spec),
            VSpherePhase::ReconcileCni => reconciler.reconcile_cni(spec).await,
            VSpherePhase::ReconcileWorkers => reconciler.reconcile_workers(spec).await,
        }
    }
}

/// Reconciles vSphere-backed TesseraClusters
pub struct Reconciler {
    local: Arc<dyn ObjectStore>,
    registry: Arc<dyn RemoteClientRegistry>,
    validator: Arc<dyn MachineConfigValidator>,
    cni: Arc<dyn CniReconciler>,
    applier: ObjectApplier,
    system_namespace: String,
}

impl Reconciler {
    /// Create a reconciler writing CAPI objects into `system_namespace` of `local`
    pub fn new(
        local: Arc<dyn ObjectStore>,
        registry: Arc<dyn RemoteClientRegistry>,
        validator: Arc<dyn MachineConfigValidator>,
        cni: Arc<dyn CniReconciler>,
        system_namespace: impl Into<String>,
        field_manager: impl Into<String>,
    ) -> Self {
        Self {
            applier: ObjectApplier::new(local.clone(), field_manager),
            local,
            registry,
            validator,
            cni,
            system_namespace: system_namespace.into(),
        }
    }

    /// Phase sequence for one pass
    pub fn phases() -> PhaseRunner<Reconciler, ClusterSpec> {
        VSpherePhase::ALL
            .into_iter()
            .fold(PhaseRunner::new(), |runner, phase| runner.register(phase))
    }

    /// Identity of the CAPI cluster backing `cluster`
    pub fn capi_cluster_key(&self, cluster: &TesseraCluster) -> ObjectKey {
        ObjectKey::namespaced(&self.system_namespace, cluster.name_any())
    }

    /// Release cached state held for a deleted cluster
    pub async fn forget_cluster(&self, cluster: &TesseraCluster) {
        self.registry.forget(&self.capi_cluster_key(cluster)).await;
    }

    /// Build the spec for `cluster` and run one pass over it
    pub async fn reconcile(
        &self,
        cluster: &TesseraCluster,
        cancel: &CancellationToken,
    ) -> Result<PassResult, Error> {
        let mut spec = build_spec(self.local.as_ref(), cluster).await?;
        self.reconcile_spec(&mut spec, cancel).await
    }

    /// Run one pass over an already built spec
    ///
    /// Status changes the phases make stay on `spec` for the caller to
    /// persist, whether or not the pass succeeds.
    pub async fn reconcile_spec(
        &self,
        spec: &mut ClusterSpec,
        cancel: &CancellationToken,
    ) -> Result<PassResult, Error> {
        let span = info_span!("reconcile", provider = "vsphere", cluster = %spec.name());
        Self::phases().run(self, spec, cancel).instrument(span).await
    }

    fn validate_datacenter_config(&self, spec: &mut ClusterSpec) -> PhaseOutcome {
        let status = spec.datacenter.status.as_ref();
        if status.is_some_and(|s| s.spec_valid) {
            return PhaseOutcome::Continue;
        }

        let message = status
            .and_then(|s| s.failure_message.clone())
            .unwrap_or_default();
        error!(
            cluster = %spec.name(),
            datacenter = %spec.datacenter.name_any(),
            failure = %message,
            "datacenter config is invalid"
        );
        spec.set_failure_message(message);
        PhaseOutcome::stop()
    }

    async fn validate_machine_configs(&self, spec: &mut ClusterSpec) -> PhaseOutcome {
        let credentials = match read_credentials(self.local.as_ref(), &self.system_namespace).await
        {
            Ok(c) => c,
            Err(e) => return PhaseOutcome::Fail(e),
        };
        let conn = VSphereConnection::new(&spec.datacenter.spec, credentials);

        match self
            .validator
            .validate_cluster_machine_configs(&conn, spec)
            .await
        {
            Ok(()) => PhaseOutcome::Continue,
            Err(e) => {
                spec.set_failure_message(e.to_string());
                PhaseOutcome::Fail(e)
            }
        }
    }

    fn reconcile_control_plane(&self, spec: &ClusterSpec) -> PhaseOutcome {
        info!(cluster = %spec.name(), "Applying control plane CAPI objects");
        PhaseOutcome::Continue
    }

    async fn reconcile_cni(&self, spec: &mut ClusterSpec) -> PhaseOutcome {
        let key = self.capi_cluster_key(&spec.cluster);
        let remote = match self.registry.get_client(&key).await {
            Ok(remote) => remote,
            Err(e) => return PhaseOutcome::Fail(e),
        };

        let outcome = self.cni.reconcile(remote, spec).await;
        if let PhaseOutcome::Fail(e) = &outcome {
            if e.is_connectivity() {
                self.registry.invalidate(&key).await;
            }
        }
        outcome
    }

    async fn reconcile_workers(&self, spec: &ClusterSpec) -> PhaseOutcome {
        info!(cluster = %spec.name(), "Applying worker CAPI objects");
        self.applier
            .apply(|| workers_spec(spec, &self.system_namespace))
            .await
            .map(|_| PhaseOutcome::Continue)
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::cni::MockCniReconciler;
    use crate::remote::MockRemoteClientRegistry;
    use crate::spec::fixtures::{sample_cluster, sample_datacenter, sample_machine_config, sample_spec};
    use crate::testing::{dynamic, MemoryStore};
    use crate::vsphere::credentials::CREDENTIALS_SECRET_NAME;
    use crate::vsphere::validator::MockMachineConfigValidator;
    use tessera_common::store::to_dynamic;

    const SYSTEM_NAMESPACE: &str = "tessera-system";

    fn local_with_credentials() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.insert(dynamic(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": CREDENTIALS_SECRET_NAME, "namespace": SYSTEM_NAMESPACE},
            "data": {"username": "YWRtaW4=", "password": "czNjcmV0"}
        })));
        Arc::new(store)
    }

    fn remote_store() -> Arc<dyn ObjectStore> {
        Arc::new(MemoryStore::new())
    }

    fn reconciler(
        local: Arc<MemoryStore>,
        registry: MockRemoteClientRegistry,
        validator: MockMachineConfigValidator,
        cni: MockCniReconciler,
    ) -> Reconciler {
        Reconciler::new(
            local,
            Arc::new(registry),
            Arc::new(validator),
            Arc::new(cni),
            SYSTEM_NAMESPACE,
            "tessera-controller",
        )
    }

    fn passing_validator() -> MockMachineConfigValidator {
        let mut validator = MockMachineConfigValidator::new();
        validator
            .expect_validate_cluster_machine_configs()
            .returning(|_, _| Ok(()));
        validator
    }

    fn reachable_registry() -> MockRemoteClientRegistry {
        let mut registry = MockRemoteClientRegistry::new();
        registry.expect_get_client().returning(|_| Ok(remote_store()));
        registry
    }

    fn continuing_cni() -> MockCniReconciler {
        let mut cni = MockCniReconciler::new();
        cni.expect_reconcile().returning(|_, _| PhaseOutcome::Continue);
        cni
    }

    fn workers_applied(local: &MemoryStore) -> bool {
        local.contains("MachineDeployment", SYSTEM_NAMESPACE, "prod-md-0")
    }

    #[test]
    fn phases_run_in_fixed_order() {
        assert_eq!(
            Reconciler::phases().phase_names(),
            vec![
                "validateDatacenterConfig",
                "validateMachineConfigs",
                "reconcileControlPlane",
                "reconcileCNI",
                "reconcileWorkers",
            ]
        );
    }

    // =========================================================================
    // Full pass stories
    // =========================================================================

    /// Story: a valid cluster flows through every phase. vCenter validation
    /// happens before the workload cluster is contacted, and worker objects
    /// land in the system namespace of the management cluster last.
    #[tokio::test]
    async fn healthy_cluster_runs_every_phase_in_order() {
        let mut seq = mockall::Sequence::new();

        let mut validator = MockMachineConfigValidator::new();
        validator
            .expect_validate_cluster_machine_configs()
            .withf(|conn, _| conn.credentials.username == "admin" && conn.server == "vcenter.example.com")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let mut registry = MockRemoteClientRegistry::new();
        registry
            .expect_get_client()
            .withf(|key| key.namespace.as_deref() == Some(SYSTEM_NAMESPACE) && key.name == "prod")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(remote_store()));
        registry.expect_invalidate().never();

        let mut cni = MockCniReconciler::new();
        cni.expect_reconcile()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| PhaseOutcome::Continue);

        let local = local_with_credentials();
        let reconciler = reconciler(local.clone(), registry, validator, cni);
        let mut spec = sample_spec("prod");

        let result = reconciler
            .reconcile_spec(&mut spec, &CancellationToken::new())
            .await
            .expect("pass should succeed");

        assert_eq!(result, PassResult::Completed);
        assert!(workers_applied(&local));
        assert!(spec.failure_message().is_none());
    }

    /// Story: reconcile() builds the spec from the management cluster first
    #[tokio::test]
    async fn reconcile_builds_spec_from_local_store() {
        let local = local_with_credentials();
        local.insert(to_dynamic(&sample_datacenter(true)).expect("dc"));
        local.insert(to_dynamic(&sample_machine_config("cp")).expect("cp"));
        local.insert(to_dynamic(&sample_machine_config("workers")).expect("workers"));

        let reconciler = reconciler(
            local.clone(),
            reachable_registry(),
            passing_validator(),
            continuing_cni(),
        );

        let result = reconciler
            .reconcile(&sample_cluster("prod"), &CancellationToken::new())
            .await
            .expect("pass should succeed");
        assert!(result.is_completed());
        assert!(workers_applied(&local));
    }

    /// Story: a missing machine config fails before any phase runs
    #[tokio::test]
    async fn spec_build_failure_runs_no_phase() {
        let local = local_with_credentials();
        local.insert(to_dynamic(&sample_datacenter(true)).expect("dc"));

        let mut validator = MockMachineConfigValidator::new();
        validator.expect_validate_cluster_machine_configs().never();
        let mut registry = MockRemoteClientRegistry::new();
        registry.expect_get_client().never();

        let reconciler = reconciler(local, registry, validator, MockCniReconciler::new());
        let err = reconciler
            .reconcile(&sample_cluster("prod"), &CancellationToken::new())
            .await
            .expect_err("machine configs missing");
        assert!(matches!(err, Error::SpecBuild { .. }));
    }

    // =========================================================================
    // Early stops and failures
    // =========================================================================

    /// Story: the datacenter validator has not approved the datacenter yet.
    /// The pass stops without error and copies the datacenter's reason onto
    /// the cluster.
    #[tokio::test]
    async fn invalid_datacenter_stops_quietly_with_its_reason() {
        let mut validator = MockMachineConfigValidator::new();
        validator.expect_validate_cluster_machine_configs().never();
        let mut registry = MockRemoteClientRegistry::new();
        registry.expect_get_client().never();

        let local = local_with_credentials();
        let reconciler = reconciler(local.clone(), registry, validator, MockCniReconciler::new());
        let mut spec = sample_spec("prod");
        spec.datacenter = sample_datacenter(false);

        let result = reconciler
            .reconcile_spec(&mut spec, &CancellationToken::new())
            .await
            .expect("soft stop is not an error");

        assert_eq!(
            result,
            PassResult::Stopped {
                phase: "validateDatacenterConfig".to_string(),
                requeue_after: None,
            }
        );
        assert_eq!(
            spec.failure_message(),
            Some("datacenter SDDC-Datacenter not found")
        );
        assert!(!workers_applied(&local));
    }

    #[tokio::test]
    async fn datacenter_without_status_stops_with_empty_message() {
        let reconciler = reconciler(
            local_with_credentials(),
            MockRemoteClientRegistry::new(),
            MockMachineConfigValidator::new(),
            MockCniReconciler::new(),
        );
        let mut spec = sample_spec("prod");
        spec.datacenter.status = None;

        let result = reconciler
            .reconcile_spec(&mut spec, &CancellationToken::new())
            .await
            .expect("soft stop");
        assert!(!result.is_completed());
        assert_eq!(spec.failure_message(), Some(""));
    }

    /// Story: vCenter rejects a machine config. The error text becomes the
    /// cluster's failure message and nothing downstream runs.
    #[tokio::test]
    async fn machine_config_rejection_fails_and_records_reason() {
        let mut validator = MockMachineConfigValidator::new();
        validator
            .expect_validate_cluster_machine_configs()
            .returning(|_, _| {
                Err(Error::validation_for(
                    "prod",
                    "template /SDDC-Datacenter/vm/Templates/ubuntu not found",
                ))
            });
        let mut registry = MockRemoteClientRegistry::new();
        registry.expect_get_client().never();

        let local = local_with_credentials();
        let reconciler = reconciler(local.clone(), registry, validator, MockCniReconciler::new());
        let mut spec = sample_spec("prod");

        let err = reconciler
            .reconcile_spec(&mut spec, &CancellationToken::new())
            .await
            .expect_err("validation fails");

        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(spec.failure_message(), Some(err.to_string().as_str()));
        assert!(!workers_applied(&local));
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_touching_status() {
        let mut validator = MockMachineConfigValidator::new();
        validator.expect_validate_cluster_machine_configs().never();

        let reconciler = reconciler(
            Arc::new(MemoryStore::new()),
            MockRemoteClientRegistry::new(),
            validator,
            MockCniReconciler::new(),
        );
        let mut spec = sample_spec("prod");

        let err = reconciler
            .reconcile_spec(&mut spec, &CancellationToken::new())
            .await
            .expect_err("no credentials");
        assert!(matches!(err, Error::Credentials { .. }));
        assert!(spec.failure_message().is_none());
    }

    /// Story: the workload cluster's API server is not up yet. The pass
    /// aborts at the CNI phase and no worker objects are applied.
    #[tokio::test]
    async fn unreachable_workload_cluster_aborts_before_workers() {
        let mut registry = MockRemoteClientRegistry::new();
        registry
            .expect_get_client()
            .returning(|key| Err(Error::remote_unreachable(&key.name, "connection refused")));
        let mut cni = MockCniReconciler::new();
        cni.expect_reconcile().never();

        let local = local_with_credentials();
        let reconciler = reconciler(local.clone(), registry, passing_validator(), cni);
        let mut spec = sample_spec("prod");

        let err = reconciler
            .reconcile_spec(&mut spec, &CancellationToken::new())
            .await
            .expect_err("workload unreachable");

        assert!(matches!(err, Error::RemoteUnreachable { .. }));
        assert!(!workers_applied(&local));
        assert!(spec.failure_message().is_none());
    }

    #[tokio::test]
    async fn connectivity_failure_inside_cni_evicts_cached_client() {
        let mut registry = MockRemoteClientRegistry::new();
        registry.expect_get_client().returning(|_| Ok(remote_store()));
        registry
            .expect_invalidate()
            .withf(|key| key.name == "prod")
            .times(1)
            .return_const(());
        let mut cni = MockCniReconciler::new();
        cni.expect_reconcile().returning(|_, _| {
            PhaseOutcome::Fail(Error::remote_unreachable("prod", "connection reset"))
        });

        let reconciler = reconciler(local_with_credentials(), registry, passing_validator(), cni);
        let result = reconciler
            .reconcile_spec(&mut sample_spec("prod"), &CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_connectivity_cni_failure_keeps_cached_client() {
        let mut registry = reachable_registry();
        registry.expect_invalidate().never();
        let mut cni = MockCniReconciler::new();
        cni.expect_reconcile()
            .returning(|_, _| PhaseOutcome::Fail(Error::internal("bundle missing")));

        let reconciler = reconciler(local_with_credentials(), registry, passing_validator(), cni);
        let result = reconciler
            .reconcile_spec(&mut sample_spec("prod"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Internal { .. })));
    }

    /// Story: Cilium is still rolling out. The pass stops with a requeue and
    /// workers wait for the next pass.
    #[tokio::test]
    async fn cni_rollout_defers_workers() {
        let mut cni = MockCniReconciler::new();
        cni.expect_reconcile()
            .returning(|_, _| PhaseOutcome::requeue_after(Duration::from_secs(10)));

        let local = local_with_credentials();
        let reconciler = reconciler(local.clone(), reachable_registry(), passing_validator(), cni);

        let result = reconciler
            .reconcile_spec(&mut sample_spec("prod"), &CancellationToken::new())
            .await
            .expect("stop is not an error");

        assert_eq!(
            result,
            PassResult::Stopped {
                phase: "reconcileCNI".to_string(),
                requeue_after: Some(Duration::from_secs(10)),
            }
        );
        assert!(!workers_applied(&local));
    }

    /// Story: one worker object cannot be written. The others still are and
    /// the error names the one that failed.
    #[tokio::test]
    async fn worker_apply_failure_names_the_object() {
        let local = Arc::new(local_with_credentials_failing("prod-md-0"));
        let reconciler = reconciler(
            local.clone(),
            reachable_registry(),
            passing_validator(),
            continuing_cni(),
        );

        let err = reconciler
            .reconcile_spec(&mut sample_spec("prod"), &CancellationToken::new())
            .await
            .expect_err("deployment write fails");

        assert!(matches!(err, Error::ObjectApply { ref failures } if failures.len() == 1));
        assert!(err
            .to_string()
            .contains("MachineDeployment tessera-system/prod-md-0"));
        assert!(local
            .kinds()
            .iter()
            .any(|k| k.starts_with("VSphereMachineTemplate/prod-md-0-")));
    }

    fn local_with_credentials_failing(name: &str) -> MemoryStore {
        let store = MemoryStore::new().fail_writes_for(name);
        store.insert(dynamic(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": CREDENTIALS_SECRET_NAME, "namespace": SYSTEM_NAMESPACE},
            "data": {"username": "YWRtaW4=", "password": "czNjcmV0"}
        })));
        store
    }

    #[tokio::test]
    async fn second_pass_over_unchanged_cluster_writes_nothing() {
        let local = local_with_credentials();
        let reconciler = reconciler(
            local.clone(),
            reachable_registry(),
            passing_validator(),
            continuing_cni(),
        );

        reconciler
            .reconcile_spec(&mut sample_spec("prod"), &CancellationToken::new())
            .await
            .expect("first pass");
        let after_first = local.writes();
        assert_eq!(after_first, 3);

        reconciler
            .reconcile_spec(&mut sample_spec("prod"), &CancellationToken::new())
            .await
            .expect("second pass");
        assert_eq!(local.writes(), after_first);
    }

    #[tokio::test]
    async fn cancelled_pass_reports_the_interrupted_phase() {
        let mut validator = MockMachineConfigValidator::new();
        validator.expect_validate_cluster_machine_configs().never();

        let reconciler = reconciler(
            local_with_credentials(),
            MockRemoteClientRegistry::new(),
            validator,
            MockCniReconciler::new(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = reconciler
            .reconcile_spec(&mut sample_spec("prod"), &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, Error::Cancelled { ref phase } if phase == "validateDatacenterConfig"));
    }
}
