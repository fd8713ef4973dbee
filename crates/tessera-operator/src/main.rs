//! Tessera Operator - phased reconciliation of vSphere workload clusters

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tessera_cluster::config::{DEFAULT_CILIUM_MANIFEST_PATH, DEFAULT_CILIUM_VERSION};
use tessera_cluster::{
    clusters_using_datacenter, clusters_using_machine_config, error_policy, reconcile, Context,
    ControllerConfig,
};
use tessera_common::crd::{TesseraCluster, VSphereDatacenterConfig, VSphereMachineConfig};
use tessera_common::telemetry::{init_telemetry, TelemetryConfig};
use tessera_common::{DEFAULT_FIELD_MANAGER, TESSERA_SYSTEM_NAMESPACE};

/// Server-side timeout for every watch the controller holds
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Tessera - declarative vSphere cluster lifecycle on Cluster API
#[derive(Parser, Debug)]
#[command(name = "tessera", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "TESSERA_PLAIN_LOGS")]
    plain_logs: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the TesseraCluster controller (default mode)
    Controller,
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Namespace holding vCenter credentials and CAPI objects
    #[arg(long, env = "TESSERA_SYSTEM_NAMESPACE", default_value = TESSERA_SYSTEM_NAMESPACE)]
    system_namespace: String,

    /// Field manager for server-side apply
    #[arg(long, env = "TESSERA_FIELD_MANAGER", default_value = DEFAULT_FIELD_MANAGER)]
    field_manager: String,

    /// Cilium manifest bundle, or a directory of cilium-<version>.yaml bundles
    #[arg(long, env = "TESSERA_CILIUM_MANIFEST", default_value = DEFAULT_CILIUM_MANIFEST_PATH)]
    cilium_manifest: PathBuf,

    /// Cilium version for clusters that do not pin one
    #[arg(long, env = "TESSERA_CILIUM_VERSION", default_value = DEFAULT_CILIUM_VERSION)]
    cilium_version: String,

    /// govc binary used for vCenter inventory checks
    #[arg(long, env = "TESSERA_GOVC_PATH", default_value = "govc")]
    govc_path: PathBuf,
}

impl From<ControllerArgs> for ControllerConfig {
    fn from(args: ControllerArgs) -> Self {
        ControllerConfig {
            system_namespace: args.system_namespace,
            field_manager: args.field_manager,
            cilium_manifest: args.cilium_manifest,
            cilium_version: args.cilium_version,
            govc_path: args.govc_path,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: !cli.plain_logs,
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller.into()).await,
    }
}

fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        TesseraCluster::crd(),
        VSphereDatacenterConfig::crd(),
        VSphereMachineConfig::crd(),
    ]
}

fn crd_manifests() -> anyhow::Result<String> {
    let mut out = String::new();
    for crd in crds() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd).context("failed to serialize CRD")?);
    }
    Ok(out)
}

/// Install or update the operator's CRDs with server-side apply
async fn ensure_crds_installed(client: &Client, field_manager: &str) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();

    for crd in crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        info!(crd = %name, "installing CRD");
        api.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .with_context(|| format!("failed to install CRD {}", name))?;
    }
    Ok(())
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    ensure_crds_installed(&client, &config.field_manager).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    info!(
        system_namespace = %config.system_namespace,
        cilium_version = %config.cilium_version,
        "starting TesseraCluster controller"
    );
    let ctx = Arc::new(
        Context::builder(client.clone(), config)
            .shutdown(shutdown.clone())
            .build(),
    );

    let clusters: Api<TesseraCluster> = Api::all(client.clone());
    tokio::spawn(forget_deleted_clusters(clusters.clone(), ctx.clone()));

    let controller = Controller::new(clusters, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS));
    let known = controller.store();
    let known_for_datacenters = known.clone();

    controller
        .watches(
            Api::<VSphereDatacenterConfig>::all(client.clone()),
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            move |datacenter| {
                clusters_using_datacenter(&known_for_datacenters.state(), &datacenter)
            },
        )
        .watches(
            Api::<VSphereMachineConfig>::all(client),
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            move |machine_config| {
                clusters_using_machine_config(&known.state(), &machine_config)
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("TesseraCluster"))
        .await;

    shutdown.cancel();
    info!("controller stopped");
    Ok(())
}

/// Release backoff state and workload clients of deleted clusters
async fn forget_deleted_clusters(api: Api<TesseraCluster>, ctx: Arc<Context>) {
    let mut events = watcher::watcher(api, WatcherConfig::default())
        .default_backoff()
        .boxed();

    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Delete(cluster)) => ctx.forget(&cluster).await,
            Ok(Event::Apply(_) | Event::Init | Event::InitApply(_) | Event::InitDone) => {}
            Err(e) => warn!(error = %e, "cluster deletion watch failed, retrying"),
        }
    }
}

/// Cancel in-flight passes on SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM, falling back to SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received, cancelling in-flight reconciliations");
    token.cancel();
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
