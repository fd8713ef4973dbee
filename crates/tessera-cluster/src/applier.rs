//! Desired-state applier
//!
//! Takes a producer of desired objects and converges a store toward them.
//! Every produced object is attempted even when others fail; failures are
//! collected into a single [`Error::ObjectApply`]. Each written object is
//! stamped with a hash of the field set we applied. An object whose live
//! state carries that same hash and every field we set is left alone, so a
//! pass over an unchanged producer issues no writes, while dropping a field
//! from the producer changes the hash and the apply prunes it.

use std::sync::Arc;

use futures::future::join_all;
use kube::api::DynamicObject;
use serde_json::Value;
use tracing::{debug, info, warn};

use tessera_common::kube_utils::{api_resource_of, describe_object, deterministic_hash};
use tessera_common::{ApplyFailure, Error, ObjectKey, ObjectStore};

/// Hash of the desired object as last applied by this applier
pub const APPLIED_HASH_ANNOTATION: &str = "tessera.dev/applied-hash";

/// What happened to one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Did not exist; created
    Created,
    /// Existed with different managed fields; patched
    Updated,
    /// Existed with matching managed fields; no write
    Unchanged,
}

/// Counts from a successful apply
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Objects created
    pub created: usize,
    /// Objects patched
    pub updated: usize,
    /// Objects left alone
    pub unchanged: usize,
}

impl ApplyReport {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
        }
    }

    /// Number of write calls issued
    pub fn writes(&self) -> usize {
        self.created + self.updated
    }
}

/// Applies producer output to one store with server-side apply
#[derive(Clone)]
pub struct ObjectApplier {
    store: Arc<dyn ObjectStore>,
    field_manager: String,
}

impl ObjectApplier {
    /// Create an applier writing to `store` as `field_manager`
    pub fn new(store: Arc<dyn ObjectStore>, field_manager: impl Into<String>) -> Self {
        Self {
            store,
            field_manager: field_manager.into(),
        }
    }

    /// Produce the desired objects and converge the store toward them
    ///
    /// The producer runs on every call. A producer error is returned as-is
    /// and no object is attempted.
    pub async fn apply<F>(&self, producer: F) -> Result<ApplyReport, Error>
    where
        F: FnOnce() -> Result<Vec<DynamicObject>, Error>,
    {
        let objects = producer()?;
        debug!(count = objects.len(), "applying desired objects");

        let results = join_all(objects.iter().map(|obj| self.apply_one(obj))).await;

        let mut report = ApplyReport::default();
        let mut failures = Vec::new();
        for (obj, result) in objects.iter().zip(results) {
            match result {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    let object = describe_object(obj);
                    warn!(object = %object, error = %e, "failed to apply object");
                    failures.push(ApplyFailure {
                        object,
                        message: e.to_string(),
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::ObjectApply { failures });
        }

        if report.writes() > 0 {
            info!(
                created = report.created,
                updated = report.updated,
                unchanged = report.unchanged,
                "applied desired objects"
            );
        }
        Ok(report)
    }

    async fn apply_one(&self, obj: &DynamicObject) -> Result<ApplyOutcome, Error> {
        let ar = api_resource_of(obj)?;
        let key = ObjectKey::of(obj)?;
        let obj = stamp_applied_hash(obj)?;

        let outcome = match self.store.get(&ar, &key).await? {
            Some(live) => {
                // The stamped hash is part of the desired fields, so a
                // changed field set never matches the live object
                let desired = to_value(&obj)?;
                let live = to_value(&live)?;
                if managed_fields_match(&desired, &live) {
                    return Ok(ApplyOutcome::Unchanged);
                }
                ApplyOutcome::Updated
            }
            None => ApplyOutcome::Created,
        };

        self.store.apply(&ar, &obj, &self.field_manager).await?;
        debug!(object = %describe_object(&obj), ?outcome, "object written");
        Ok(outcome)
    }
}

fn to_value(obj: &DynamicObject) -> Result<Value, Error> {
    serde_json::to_value(obj).map_err(|e| Error::serialization(e.to_string()))
}

/// Copy of `obj` annotated with the hash of its own fields
pub fn stamp_applied_hash(obj: &DynamicObject) -> Result<DynamicObject, Error> {
    let mut unstamped = obj.clone();
    if let Some(annotations) = unstamped.metadata.annotations.as_mut() {
        annotations.remove(APPLIED_HASH_ANNOTATION);
        if annotations.is_empty() {
            unstamped.metadata.annotations = None;
        }
    }
    let canonical = serde_json::to_string(&to_value(&unstamped)?)
        .map_err(|e| Error::serialization(e.to_string()))?;

    unstamped
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(
            APPLIED_HASH_ANNOTATION.to_string(),
            deterministic_hash(&canonical),
        );
    Ok(unstamped)
}

/// Whether every field set in `desired` has the same value in `live`
///
/// Fields present only in `live` (server defaults, other managers, status)
/// are ignored. Arrays must have equal length and match element-wise.
/// A `null` in `desired` matches an absent or `null` field.
pub fn managed_fields_match(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(k, v)| match have.get(k) {
            Some(h) => managed_fields_match(v, h),
            None => v.is_null(),
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len()
                && want
                    .iter()
                    .zip(have)
                    .all(|(w, h)| managed_fields_match(w, h))
        }
        (Value::Null, Value::Null) => true,
        (want, have) => want == have,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dynamic, MemoryStore};
    use serde_json::json;

    fn config_map(name: &str, value: &str) -> DynamicObject {
        dynamic(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "default"},
            "data": {"key": value}
        }))
    }

    #[test]
    fn subset_match_ignores_extra_live_fields() {
        let desired = json!({"spec": {"replicas": 3}, "metadata": {"name": "a"}});
        let live = json!({
            "spec": {"replicas": 3, "strategy": {"type": "RollingUpdate"}},
            "metadata": {"name": "a", "uid": "123", "resourceVersion": "9"},
            "status": {"ready": true}
        });
        assert!(managed_fields_match(&desired, &live));
    }

    #[test]
    fn subset_match_detects_changed_and_missing_fields() {
        let live = json!({"spec": {"replicas": 3}});
        assert!(!managed_fields_match(&json!({"spec": {"replicas": 4}}), &live));
        assert!(!managed_fields_match(&json!({"spec": {"paused": true}}), &live));
        assert!(managed_fields_match(&json!({"spec": {"paused": null}}), &live));
    }

    #[test]
    fn subset_match_compares_arrays_elementwise() {
        let live = json!({"args": [{"name": "a", "value": "1", "extra": true}]});
        assert!(managed_fields_match(&json!({"args": [{"name": "a", "value": "1"}]}), &live));
        assert!(!managed_fields_match(&json!({"args": [{"name": "a", "value": "2"}]}), &live));
        assert!(!managed_fields_match(&json!({"args": []}), &live));
    }

    #[tokio::test]
    async fn creates_missing_objects() {
        let store = Arc::new(MemoryStore::new());
        let applier = ObjectApplier::new(store.clone(), "test");

        let report = applier
            .apply(|| Ok(vec![config_map("a", "1"), config_map("b", "2")]))
            .await
            .expect("apply succeeds");

        assert_eq!(report.created, 2);
        assert_eq!(store.writes(), 2);
        assert!(store.contains("ConfigMap", "default", "a"));
    }

    /// Story: re-running an unchanged producer writes nothing
    #[tokio::test]
    async fn story_second_apply_of_unchanged_producer_issues_no_writes() {
        let store = Arc::new(MemoryStore::new());
        let applier = ObjectApplier::new(store.clone(), "test");
        let producer = || Ok(vec![config_map("a", "1"), config_map("b", "2")]);

        applier.apply(producer).await.expect("first apply");
        let writes_after_first = store.writes();

        let report = applier.apply(producer).await.expect("second apply");

        assert_eq!(report.unchanged, 2);
        assert_eq!(report.writes(), 0);
        assert_eq!(store.writes(), writes_after_first);
    }

    #[tokio::test]
    async fn changed_object_is_updated() {
        let store = Arc::new(MemoryStore::new());
        let applier = ObjectApplier::new(store.clone(), "test");

        applier
            .apply(|| Ok(vec![config_map("a", "1")]))
            .await
            .expect("first apply");
        let report = applier
            .apply(|| Ok(vec![config_map("a", "2")]))
            .await
            .expect("second apply");

        assert_eq!(report.updated, 1);
        assert_eq!(store.writes(), 2);
    }

    /// Story: a release drops a data key and a label. The next pass must
    /// send an apply so the server prunes them.
    #[tokio::test]
    async fn story_fields_removed_from_producer_are_pruned() {
        let store = Arc::new(MemoryStore::new());
        let applier = ObjectApplier::new(store.clone(), "test");

        applier
            .apply(|| {
                Ok(vec![dynamic(json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "a", "namespace": "default", "labels": {"tier": "web"}},
                    "data": {"key": "1", "obsolete": "x"}
                }))])
            })
            .await
            .expect("first apply");
        let report = applier
            .apply(|| Ok(vec![config_map("a", "1")]))
            .await
            .expect("second apply");

        assert_eq!(report.updated, 1);
        let live = store.get_object("ConfigMap", "default", "a").expect("live");
        assert_eq!(live.data["data"], json!({"key": "1"}));
        assert!(live
            .metadata
            .labels
            .as_ref()
            .map_or(true, |l| !l.contains_key("tier")));
    }

    #[tokio::test]
    async fn foreign_label_survives_managed_apply() {
        let store = Arc::new(MemoryStore::new());
        store.insert(dynamic(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "default", "labels": {"team": "storage"}},
            "data": {"key": "0"}
        })));
        let applier = ObjectApplier::new(store.clone(), "test");

        let first = applier
            .apply(|| Ok(vec![config_map("a", "1")]))
            .await
            .expect("apply");
        let second = applier
            .apply(|| Ok(vec![config_map("a", "1")]))
            .await
            .expect("reapply");

        assert_eq!(first.updated, 1);
        assert_eq!(second.unchanged, 1);
        let live = store.get_object("ConfigMap", "default", "a").expect("live");
        assert_eq!(
            live.metadata.labels.expect("labels").get("team").map(String::as_str),
            Some("storage")
        );
        assert_eq!(live.data["data"]["key"], "1");
    }

    #[test]
    fn applied_hash_tracks_the_desired_fields() {
        let stamped = stamp_applied_hash(&config_map("a", "1")).expect("stamp");
        let hash = |obj: &DynamicObject| {
            obj.metadata.annotations.as_ref().expect("annotations")[APPLIED_HASH_ANNOTATION].clone()
        };

        let restamped = stamp_applied_hash(&stamped).expect("restamp");
        let changed = stamp_applied_hash(&config_map("a", "2")).expect("stamp");

        assert_eq!(hash(&stamped), hash(&restamped));
        assert_ne!(hash(&stamped), hash(&changed));
    }

    /// Story: one bad object does not stop the others from landing
    #[tokio::test]
    async fn story_partial_failure_attempts_every_object_and_names_the_failure() {
        let store = Arc::new(MemoryStore::new().fail_writes_for("b"));
        let applier = ObjectApplier::new(store.clone(), "test");

        let err = applier
            .apply(|| {
                Ok(vec![
                    config_map("a", "1"),
                    config_map("b", "2"),
                    config_map("c", "3"),
                ])
            })
            .await
            .expect_err("b fails");

        assert!(store.contains("ConfigMap", "default", "a"));
        assert!(store.contains("ConfigMap", "default", "c"));
        assert!(!store.contains("ConfigMap", "default", "b"));
        match err {
            Error::ObjectApply { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].object, "ConfigMap default/b");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn producer_error_is_returned_without_writes() {
        let store = Arc::new(MemoryStore::new());
        let applier = ObjectApplier::new(store.clone(), "test");

        let err = applier
            .apply(|| Err(Error::serialization("bad template")))
            .await
            .expect_err("producer fails");

        assert!(matches!(err, Error::Serialization { .. }));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn producer_runs_every_call() {
        let store = Arc::new(MemoryStore::new());
        let applier = ObjectApplier::new(store, "test");
        let calls = std::sync::atomic::AtomicUsize::new(0);

        for _ in 0..2 {
            applier
                .apply(|| {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(vec![])
                })
                .await
                .expect("empty apply");
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn object_without_types_fails_individually() {
        let store = Arc::new(MemoryStore::new());
        let applier = ObjectApplier::new(store.clone(), "test");
        let untyped = DynamicObject {
            types: None,
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("x".to_string()),
                ..Default::default()
            },
            data: json!({}),
        };

        let err = applier
            .apply(|| Ok(vec![untyped, config_map("a", "1")]))
            .await
            .expect_err("untyped object fails");

        assert!(store.contains("ConfigMap", "default", "a"));
        assert!(matches!(err, Error::ObjectApply { ref failures } if failures.len() == 1));
    }
}
