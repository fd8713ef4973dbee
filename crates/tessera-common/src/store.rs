//! Object store abstraction over a Kubernetes API server
//!
//! The reconciler talks to two kinds of API servers: the management cluster
//! (always reachable) and each workload cluster (reachable once its control
//! plane is up). Both are reached through [`ObjectStore`], which operates on
//! untyped [`DynamicObject`]s so the same applier can write CAPI objects,
//! CNI manifests, or anything else without compile-time knowledge of the
//! type. Typed reads go through [`get_typed`].

use std::fmt;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Namespace + name identifying an object of a known type
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace; `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of an existing object; fails if it has no name
    pub fn of(obj: &DynamicObject) -> Result<Self, Error> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::serialization("object has no metadata.name"))?;
        Ok(Self {
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Read/write access to one API server
///
/// Implementations must be cheap to share behind an `Arc`; the reconciler
/// holds one for the management cluster and the remote client registry
/// caches one per workload cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, `None` if it does not exist
    async fn get(&self, ar: &ApiResource, key: &ObjectKey)
        -> Result<Option<DynamicObject>, Error>;

    /// List objects of a type, optionally within one namespace
    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Create an object; fails if it already exists
    async fn create(&self, ar: &ApiResource, obj: &DynamicObject)
        -> Result<DynamicObject, Error>;

    /// Replace an existing object (optimistic concurrency on resourceVersion)
    async fn update(&self, ar: &ApiResource, obj: &DynamicObject)
        -> Result<DynamicObject, Error>;

    /// Server-side apply the fields set in `obj`, owned by `field_manager`
    async fn apply(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, Error>;

    /// Merge-patch the status subresource
    async fn patch_status(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        status: serde_json::Value,
        field_manager: &str,
    ) -> Result<(), Error>;
}

/// [`ObjectStore`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    fn object_name(obj: &DynamicObject) -> Result<&str, Error> {
        obj.metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::serialization_for_kind(kind_of(obj), "missing metadata.name"))
    }
}

fn kind_of(obj: &DynamicObject) -> String {
    obj.types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_default()
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, Error> {
        let api = self.api(ar, key.namespace.as_deref());
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let api = self.api(ar, namespace.as_deref());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let api = self.api(ar, obj.metadata.namespace.as_deref());
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn update(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let name = Self::object_name(obj)?;
        let api = self.api(ar, obj.metadata.namespace.as_deref());
        Ok(api.replace(name, &PostParams::default(), obj).await?)
    }

    async fn apply(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, Error> {
        let name = Self::object_name(obj)?;
        let api = self.api(ar, obj.metadata.namespace.as_deref());
        let params = PatchParams::apply(field_manager).force();
        let applied = api.patch(name, &params, &Patch::Apply(obj)).await?;
        trace!(kind = %ar.kind, name = %name, "applied object");
        Ok(applied)
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        status: serde_json::Value,
        field_manager: &str,
    ) -> Result<(), Error> {
        let api = self.api(ar, key.namespace.as_deref());
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            &key.name,
            &PatchParams::apply(field_manager),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// `ApiResource` for a compiled-in type
pub fn api_resource_for<K>() -> ApiResource
where
    K: Resource,
    K::DynamicType: Default,
{
    ApiResource::erase::<K>(&Default::default())
}

/// Fetch an object and decode it into its typed representation
pub async fn get_typed<K>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Option<K>, Error>
where
    K: Resource + DeserializeOwned,
    K::DynamicType: Default,
{
    let ar = api_resource_for::<K>();
    match store.get(&ar, key).await? {
        Some(obj) => Ok(Some(from_dynamic(obj)?)),
        None => Ok(None),
    }
}

/// Decode an untyped object into a typed one
pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> Result<K, Error> {
    let kind = kind_of(&obj);
    let value =
        serde_json::to_value(obj).map_err(|e| Error::serialization_for_kind(&kind, e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

/// Encode a typed object as an untyped one
pub fn to_dynamic<K: serde::Serialize>(obj: &K) -> Result<DynamicObject, Error> {
    let value = serde_json::to_value(obj).map_err(|e| Error::serialization(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::serialization(e.to_string()))
}
