//! In-memory object store for unit tests
//!
//! `apply` behaves like server-side apply: the applied fields are merged
//! over the live object, fields owned by other writers survive, and fields
//! the same manager applied last time but no longer sets are pruned.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;

use serde_json::Value;

use tessera_common::{Error, ObjectKey, ObjectStore};

/// Build a DynamicObject from JSON
pub fn dynamic(value: serde_json::Value) -> DynamicObject {
    serde_json::from_value(value).expect("test object should deserialize")
}

type StoreKey = (String, Option<String>, String);

/// Stores objects keyed by kind/namespace/name and counts writes
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<StoreKey, DynamicObject>>,
    /// Last applied configuration per object and field manager
    applied: Mutex<BTreeMap<(StoreKey, String), Value>>,
    writes: AtomicUsize,
    fail_writes: BTreeSet<String>,
    fail_reads: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes to objects with this name fail with a conflict
    pub fn fail_writes_for(mut self, name: &str) -> Self {
        self.fail_writes.insert(name.to_string());
        self
    }

    /// Every read fails as if the API server were unreachable
    pub fn unreachable() -> Self {
        Self {
            fail_reads: true,
            ..Self::default()
        }
    }

    /// Seed an object without counting a write
    pub fn insert(&self, obj: DynamicObject) {
        let key = Self::key_of(&obj);
        self.objects
            .lock()
            .expect("mutex should not be poisoned")
            .insert(key, obj);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, kind: &str, namespace: &str, name: &str) -> bool {
        self.get_object(kind, namespace, name).is_some()
    }

    pub fn get_object(&self, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.objects
            .lock()
            .expect("mutex should not be poisoned")
            .get(&(
                kind.to_string(),
                Some(namespace.to_string()),
                name.to_string(),
            ))
            .cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.objects
            .lock()
            .expect("mutex should not be poisoned")
            .keys()
            .map(|(kind, _, name)| format!("{kind}/{name}"))
            .collect()
    }

    fn key_of(obj: &DynamicObject) -> StoreKey {
        (
            obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default(),
            obj.metadata.namespace.clone(),
            obj.metadata.name.clone().unwrap_or_default(),
        )
    }

    fn check_reachable(&self) -> Result<(), Error> {
        if self.fail_reads {
            return Err(Error::remote_unreachable("test", "connection refused"));
        }
        Ok(())
    }

    fn check_writable(&self, obj: &DynamicObject) -> Result<(), Error> {
        self.check_reachable()?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        if self.fail_writes.contains(&name) {
            return Err(Error::from(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("conflict writing {name}"),
                reason: "Conflict".to_string(),
                code: 409,
            })));
        }
        Ok(())
    }

    fn write(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        self.check_writable(obj)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(obj.clone());
        Ok(obj.clone())
    }

    fn server_side_apply(
        &self,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, Error> {
        self.check_writable(obj)?;
        let key = Self::key_of(obj);
        let desired = to_value(obj)?;

        let mut objects = self.objects.lock().expect("mutex should not be poisoned");
        let mut applied = self.applied.lock().expect("mutex should not be poisoned");
        let manager_key = (key.clone(), field_manager.to_string());

        let mut merged = match objects.get(&key) {
            Some(live) => to_value(live)?,
            None => Value::Object(Default::default()),
        };
        if let Some(previous) = applied.get(&manager_key) {
            prune(&mut merged, previous, &desired);
        }
        merge(&mut merged, &desired);

        let result: DynamicObject =
            serde_json::from_value(merged).map_err(|e| Error::serialization(e.to_string()))?;
        objects.insert(key, result.clone());
        applied.insert(manager_key, desired);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(result)
    }
}

fn to_value(obj: &DynamicObject) -> Result<Value, Error> {
    serde_json::to_value(obj).map_err(|e| Error::serialization(e.to_string()))
}

/// Drop fields present in `previous` but absent from `desired`
fn prune(live: &mut Value, previous: &Value, desired: &Value) {
    let (Value::Object(live), Value::Object(previous)) = (live, previous) else {
        return;
    };
    for (field, was) in previous {
        match desired.get(field) {
            None => {
                live.remove(field);
            }
            Some(now) => {
                if let Some(child) = live.get_mut(field) {
                    prune(child, was, now);
                }
            }
        }
    }
}

/// Overlay `desired` onto `live`; maps merge, everything else replaces
fn merge(live: &mut Value, desired: &Value) {
    match (live, desired) {
        (Value::Object(live), Value::Object(desired)) => {
            for (field, value) in desired {
                match live.get_mut(field) {
                    Some(existing) => merge(existing, value),
                    None => {
                        live.insert(field.clone(), value.clone());
                    }
                }
            }
        }
        (live, desired) => *live = desired.clone(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
    ) -> Result<Option<DynamicObject>, Error> {
        self.check_reachable()?;
        Ok(self
            .objects
            .lock()
            .expect("mutex should not be poisoned")
            .get(&(ar.kind.clone(), key.namespace.clone(), key.name.clone()))
            .cloned())
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
    ) -> Result<Vec<DynamicObject>, Error> {
        self.check_reachable()?;
        Ok(self
            .objects
            .lock()
            .expect("mutex should not be poisoned")
            .iter()
            .filter(|((kind, ns, _), _)| {
                *kind == ar.kind && (namespace.is_none() || *ns == namespace)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(
        &self,
        _ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        self.write(obj)
    }

    async fn update(
        &self,
        _ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, Error> {
        self.write(obj)
    }

    async fn apply(
        &self,
        _ar: &ApiResource,
        obj: &DynamicObject,
        field_manager: &str,
    ) -> Result<DynamicObject, Error> {
        self.server_side_apply(obj, field_manager)
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        key: &ObjectKey,
        status: serde_json::Value,
        _field_manager: &str,
    ) -> Result<(), Error> {
        self.check_reachable()?;
        let mut objects = self.objects.lock().expect("mutex should not be poisoned");
        let obj = objects
            .get_mut(&(ar.kind.clone(), key.namespace.clone(), key.name.clone()))
            .ok_or_else(|| Error::internal(format!("{} not found", key)))?;
        obj.data["status"] = status;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_map_resource() -> ApiResource {
        tessera_common::kube_utils::build_api_resource("v1", "ConfigMap")
    }

    #[tokio::test]
    async fn apply_keeps_fields_owned_by_other_writers() {
        let store = MemoryStore::new();
        store.insert(dynamic(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "default", "labels": {"team": "storage"}},
            "data": {"owner": "kubectl"}
        })));

        let applied = store
            .apply(
                &config_map_resource(),
                &dynamic(json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "a", "namespace": "default", "labels": {"tier": "web"}},
                    "data": {"key": "1"}
                })),
                "tessera",
            )
            .await
            .expect("apply");

        let labels = applied.metadata.labels.expect("labels");
        assert_eq!(labels["team"], "storage");
        assert_eq!(labels["tier"], "web");
        assert_eq!(applied.data["data"], json!({"owner": "kubectl", "key": "1"}));
    }

    #[tokio::test]
    async fn reapply_prunes_only_fields_the_manager_dropped() {
        let store = MemoryStore::new();
        let ar = config_map_resource();
        store
            .apply(
                &ar,
                &dynamic(json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "a", "namespace": "default"},
                    "data": {"key": "1", "obsolete": "x"}
                })),
                "tessera",
            )
            .await
            .expect("first apply");
        store
            .apply(
                &ar,
                &dynamic(json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "a", "namespace": "default"},
                    "data": {"other": "y"}
                })),
                "someone-else",
            )
            .await
            .expect("foreign apply");

        let result = store
            .apply(
                &ar,
                &dynamic(json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "a", "namespace": "default"},
                    "data": {"key": "2"}
                })),
                "tessera",
            )
            .await
            .expect("second apply");

        assert_eq!(result.data["data"], json!({"key": "2", "other": "y"}));
        assert_eq!(store.writes(), 3);
    }
}
