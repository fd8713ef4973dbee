//! Container network plugin reconciliation on workload clusters

mod cilium;

pub use cilium::{CiliumReconciler, CILIUM_DAEMONSET, CILIUM_NAMESPACE, ROLLOUT_REQUEUE};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use tessera_common::{Error, ObjectStore};

use crate::phase::PhaseOutcome;
use crate::spec::ClusterSpec;

/// Brings a workload cluster's CNI to the version its spec asks for
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CniReconciler: Send + Sync {
    /// Reconcile the CNI through `remote`, the workload cluster's store
    async fn reconcile(&self, remote: Arc<dyn ObjectStore>, spec: &mut ClusterSpec)
        -> PhaseOutcome;
}

/// Supplies the objects making up one CNI release
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Objects for `version`
    async fn manifests(&self, version: &str) -> Result<Vec<DynamicObject>, Error>;
}

/// Reads rendered manifests from disk
///
/// When `path` is a directory, each version is looked up as
/// `cilium-<version>.yaml` inside it. When it is a file, that file is
/// returned whatever the version; the reconciler rejects it if it ships a
/// different release.
#[derive(Clone, Debug)]
pub struct FileManifestSource {
    path: PathBuf,
}

impl FileManifestSource {
    /// Source reading from `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn bundle_path(&self, version: &str) -> PathBuf {
        if self.path.is_dir() {
            self.path
                .join(format!("cilium-{}.yaml", version.trim_start_matches('v')))
        } else {
            self.path.clone()
        }
    }
}

#[async_trait]
impl ManifestSource for FileManifestSource {
    async fn manifests(&self, version: &str) -> Result<Vec<DynamicObject>, Error> {
        let path = self.bundle_path(version);
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::internal_with_context(
                "cni_manifests",
                format!("reading {}: {}", path.display(), e),
            )
        })?;
        let objects = parse_manifests(&text, &path)?;
        debug!(path = %path.display(), count = objects.len(), "loaded CNI manifests");
        Ok(objects)
    }
}

/// Split a multi-document YAML bundle into objects, skipping empty documents
pub fn parse_manifests(text: &str, origin: &Path) -> Result<Vec<DynamicObject>, Error> {
    let mut objects = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| {
            Error::serialization(format!(
                "{} document {}: {}",
                origin.display(),
                index,
                e
            ))
        })?;
        if value.is_null() {
            continue;
        }
        let obj: DynamicObject = serde_yaml::from_value(value).map_err(|e| {
            Error::serialization(format!(
                "{} document {}: {}",
                origin.display(),
                index,
                e
            ))
        })?;
        objects.push(obj);
    }
    Ok(objects)
}
