//! Workload cluster clients
//!
//! Each workload cluster's kubeconfig lives in a CAPI-generated secret on the
//! management cluster. [`ClientRegistry`] caches one client per cluster and
//! checks the secret's revision on every use, rebuilding the client when the
//! kubeconfig has rotated. Lookups and invalidations for the same cluster
//! are serialized on that cluster's slot; lookups for different clusters
//! never wait on each other.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use tessera_common::kube_utils::{client_from_kubeconfig_yaml, deterministic_hash};
use tessera_common::store::{get_typed, KubeObjectStore};
use tessera_common::{Error, ObjectKey, ObjectStore};

/// CAPI names the kubeconfig secret `<cluster>-kubeconfig`
pub const KUBECONFIG_SECRET_SUFFIX: &str = "-kubeconfig";

/// Data key holding the kubeconfig in that secret
pub const KUBECONFIG_KEY: &str = "value";

/// Name of the kubeconfig secret for a cluster
pub fn kubeconfig_secret_name(cluster: &str) -> String {
    format!("{}{}", cluster, KUBECONFIG_SECRET_SUFFIX)
}

/// A kubeconfig and a token identifying its revision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeconfigData {
    /// Raw kubeconfig YAML
    pub yaml: String,
    /// Changes whenever the kubeconfig does
    pub revision: String,
}

/// Where workload kubeconfigs come from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeconfigSource: Send + Sync {
    /// Current kubeconfig for a cluster
    async fn kubeconfig(&self, cluster: &ObjectKey) -> Result<KubeconfigData, Error>;
}

/// Reads kubeconfigs from CAPI secrets on the management cluster
pub struct SecretKubeconfigSource {
    store: Arc<dyn ObjectStore>,
}

impl SecretKubeconfigSource {
    /// Read secrets through `store`
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl KubeconfigSource for SecretKubeconfigSource {
    async fn kubeconfig(&self, cluster: &ObjectKey) -> Result<KubeconfigData, Error> {
        let key = ObjectKey {
            namespace: cluster.namespace.clone(),
            name: kubeconfig_secret_name(&cluster.name),
        };
        let secret: Secret = get_typed(self.store.as_ref(), &key)
            .await?
            .ok_or_else(|| {
                Error::remote_unreachable(
                    &cluster.name,
                    format!("kubeconfig secret {} not found", key),
                )
            })?;

        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_KEY))
            .ok_or_else(|| {
                Error::remote_unreachable(
                    &cluster.name,
                    format!("kubeconfig secret {} has no {} key", key, KUBECONFIG_KEY),
                )
            })?;
        let yaml = String::from_utf8(bytes.0.clone()).map_err(|_| {
            Error::remote_unreachable(
                &cluster.name,
                format!("kubeconfig secret {} is not UTF-8", key),
            )
        })?;

        let revision = secret
            .metadata
            .resource_version
            .clone()
            .unwrap_or_else(|| deterministic_hash(&yaml));

        Ok(KubeconfigData { yaml, revision })
    }
}

/// Builds an object store from a kubeconfig
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Connect to the API server the kubeconfig names
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn ObjectStore>, Error>;
}

/// [`ClientFactory`] producing kube-rs backed stores
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeClientFactory;

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn ObjectStore>, Error> {
        let client = client_from_kubeconfig_yaml(kubeconfig).await?;
        Ok(Arc::new(KubeObjectStore::new(client)))
    }
}

/// Hands out clients for workload clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteClientRegistry: Send + Sync {
    /// Client for the CAPI cluster identified by `cluster`
    async fn get_client(&self, cluster: &ObjectKey) -> Result<Arc<dyn ObjectStore>, Error>;

    /// Drop any cached client so the next lookup rebuilds it
    async fn invalidate(&self, cluster: &ObjectKey);

    /// Release everything held for a deleted cluster
    async fn forget(&self, cluster: &ObjectKey);
}

struct CachedClient {
    revision: String,
    store: Arc<dyn ObjectStore>,
}

type Slot = Arc<Mutex<Option<CachedClient>>>;

/// Caching [`RemoteClientRegistry`]
pub struct ClientRegistry {
    source: Arc<dyn KubeconfigSource>,
    factory: Arc<dyn ClientFactory>,
    slots: DashMap<ObjectKey, Slot>,
}

impl ClientRegistry {
    /// Registry reading kubeconfigs from `source` and connecting with `factory`
    pub fn new(source: Arc<dyn KubeconfigSource>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            source,
            factory,
            slots: DashMap::new(),
        }
    }

    /// Registry reading CAPI secrets from the management cluster
    pub fn for_management_cluster(local: Arc<dyn ObjectStore>) -> Self {
        Self::new(
            Arc::new(SecretKubeconfigSource::new(local)),
            Arc::new(KubeClientFactory),
        )
    }

    fn slot(&self, cluster: &ObjectKey) -> Slot {
        // Clone the Arc out so the shard lock is released before awaiting
        self.slots.entry(cluster.clone()).or_default().clone()
    }
}

#[async_trait]
impl RemoteClientRegistry for ClientRegistry {
    async fn get_client(&self, cluster: &ObjectKey) -> Result<Arc<dyn ObjectStore>, Error> {
        let slot = self.slot(cluster);
        let mut cached = slot.lock().await;

        let kubeconfig = self.source.kubeconfig(cluster).await.map_err(|e| match e {
            Error::RemoteUnreachable { .. } => e,
            other => Error::remote_unreachable(&cluster.name, other.to_string()),
        })?;

        if let Some(entry) = cached.as_ref() {
            if entry.revision == kubeconfig.revision {
                return Ok(entry.store.clone());
            }
            info!(
                cluster = %cluster,
                old_revision = %entry.revision,
                new_revision = %kubeconfig.revision,
                "kubeconfig rotated, rebuilding client"
            );
        }

        let store = self
            .factory
            .connect(&kubeconfig.yaml)
            .await
            .map_err(|e| Error::remote_unreachable(&cluster.name, e.to_string()))?;
        debug!(cluster = %cluster, revision = %kubeconfig.revision, "built workload client");

        *cached = Some(CachedClient {
            revision: kubeconfig.revision,
            store: store.clone(),
        });
        Ok(store)
    }

    async fn invalidate(&self, cluster: &ObjectKey) {
        let Some(slot) = self.slots.get(cluster).map(|s| Arc::clone(s.value())) else {
            return;
        };
        // Waits for an in-flight build so it is never duplicated
        if slot.lock().await.take().is_some() {
            debug!(cluster = %cluster, "invalidated workload client");
        }
    }

    async fn forget(&self, cluster: &ObjectKey) {
        let Some(slot) = self.slots.get(cluster).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut cached = slot.lock().await;
        *cached = None;
        self.slots.remove_if(cluster, |_, current| Arc::ptr_eq(current, &slot));
        debug!(cluster = %cluster, "released workload client slot");
    }
}
