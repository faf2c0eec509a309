//! Idempotent create-or-update and delete of rendered object sets.
//!
//! There is no transaction across objects: a failure part way leaves a
//! partially applied set behind, and the next invocation reapplies the whole
//! set.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    object::{Object, QualifiedName},
    store::{Error, ObjectStore},
};

/// Whether `live` already carries everything `desired` specifies.
///
/// Only what `desired` sets is compared: labels, annotations and fields it
/// leaves out may be filled in by the apiserver or other controllers, and
/// `status` never takes part.
pub fn same_content(desired: &Object, live: &Object) -> bool {
    fn subset(desired: &BTreeMap<String, String>, live: &BTreeMap<String, String>) -> bool {
        desired.iter().all(|(key, value)| live.get(key) == Some(value))
    }

    subset(desired.labels(), live.labels())
        && subset(desired.annotations(), live.annotations())
        && body(desired).all(|(key, value)| contains(value, &live.data()[key]))
}

/// Top-level fields of the body, `status` excluded.
fn body(obj: &Object) -> impl Iterator<Item = (&String, &Value)> {
    obj.data()
        .as_object()
        .into_iter()
        .flatten()
        .filter(|(key, _)| *key != "status")
}

/// Whether `live` holds `desired`, where objects only need to match on the
/// keys `desired` has. Arrays must match element by element.
fn contains(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(desired), Value::Object(live)) => desired
            .iter()
            .all(|(key, value)| live.get(key).is_some_and(|live| contains(value, live))),
        (Value::Array(desired), Value::Array(live)) => {
            desired.len() == live.len() && desired.iter().zip(live).all(|(d, l)| contains(d, l))
        }
        _ => desired == live,
    }
}

/// The update that brings `live` to `desired`: each top-level field of the
/// desired body replaces the live one, desired labels and annotations are
/// merged over the live ones, and everything else is kept from `live`.
fn merged(desired: &Object, live: &Object) -> Object {
    let mut next = live.clone();
    for (key, value) in body(desired) {
        next.data_mut()[key] = value.clone();
    }
    let meta = next.meta_mut();
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .extend(desired.labels().clone());
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .extend(desired.annotations().clone());
    next
}

/// Creates `obj`, or updates the live object in place when it already
/// exists.
pub async fn apply_one<S: ObjectStore>(store: &S, obj: &Object) -> Result<Object, Error> {
    match store.create(obj).await {
        Ok(created) => {
            log::info!("Created {} {}", obj.gvk().kind, obj.key());
            Ok(created)
        }
        Err(err) if err.is_already_exists() => {
            let live = store.get(obj.gvk(), &obj.key()).await?;
            if same_content(obj, &live) {
                log::debug!("{} {} is up to date", obj.gvk().kind, obj.key());
                return Ok(live);
            }

            let updated = store.update(&merged(obj, &live)).await?;
            log::info!("Updated {} {}", obj.gvk().kind, obj.key());
            Ok(updated)
        }
        Err(err) => {
            log::error!("Failed to apply {} {}: {err}", obj.gvk().kind, obj.key());
            Err(err)
        }
    }
}

/// Applies `objects` in order, stopping at the first failure.
pub async fn apply<S: ObjectStore>(store: &S, objects: &[Object]) -> Result<Vec<Object>, Error> {
    let mut applied = Vec::with_capacity(objects.len());
    for obj in objects {
        applied.push(apply_one(store, obj).await?);
    }
    Ok(applied)
}

/// Deletes `objects` in reverse order. Objects that are already gone count
/// as deleted.
pub async fn delete<S: ObjectStore>(store: &S, objects: &[Object]) -> Result<(), Error> {
    for obj in objects.iter().rev() {
        delete_one(store, obj).await?;
    }
    Ok(())
}

/// Like [`delete`], but leaves alone live objects stamped by an owner other
/// than `owner`. Returns the number of objects deleted.
pub async fn delete_owned<S: ObjectStore>(
    store: &S,
    objects: &[Object],
    owner: &QualifiedName,
) -> Result<usize, Error> {
    let mut deleted = 0;
    for obj in objects.iter().rev() {
        let Some(live) = store.get_opt(obj.gvk(), &obj.key()).await? else {
            continue;
        };
        if live.is_foreign_to(owner) {
            log::debug!(
                "Keeping {} {}: owned by {:?}, not {owner}",
                obj.gvk().kind,
                obj.key(),
                live.owner()
            );
            continue;
        }
        if delete_one(store, obj).await? {
            deleted += 1;
        }
    }
    Ok(deleted)
}

async fn delete_one<S: ObjectStore>(store: &S, obj: &Object) -> Result<bool, Error> {
    match store.delete(obj.gvk(), &obj.key()).await {
        Ok(()) => {
            log::info!("Deleted {} {}", obj.gvk().kind, obj.key());
            Ok(true)
        }
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => {
            log::error!("Failed to delete {} {}: {err}", obj.gvk().kind, obj.key());
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        object::{gvk, OWNER_NAMESPACE_ANNOTATION, OWNER_NAME_ANNOTATION},
        store::{MemoryStore, Operation},
    };

    fn service(name: &str, port: u16) -> Object {
        let mut obj = Object::new(gvk::service(), name);
        obj.meta_mut().namespace = Some("ns".to_owned());
        obj.data_mut()["spec"] = json!({ "ports": [{ "port": port }] });
        obj
    }

    fn owned(mut obj: Object, owner: &str) -> Object {
        obj.set_annotation(OWNER_NAME_ANNOTATION, owner);
        obj.set_annotation(OWNER_NAMESPACE_ANNOTATION, "ns");
        obj
    }

    #[tokio::test]
    async fn apply_creates_then_updates_in_place() {
        let store = MemoryStore::new();
        let created = apply(&store, &[service("a", 80), service("b", 80)])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);

        let applied = apply(&store, &[service("a", 8080)]).await.unwrap();
        assert_eq!(applied[0].data()["spec"]["ports"][0]["port"], 8080);
        assert_eq!(applied[0].meta().uid, created[0].meta().uid);
        assert_ne!(
            applied[0].meta().resource_version,
            created[0].meta().resource_version
        );
    }

    #[tokio::test]
    async fn unchanged_objects_are_not_rewritten() {
        let store = MemoryStore::new();
        apply(&store, &[service("a", 80)]).await.unwrap();
        let before = store.snapshot();
        apply(&store, &[service("a", 80)]).await.unwrap();
        assert_eq!(store.snapshot(), before);
        assert_eq!(updates(&store), 0);
    }

    fn updates(store: &MemoryStore) -> usize {
        store
            .calls()
            .iter()
            .filter(|(op, _, _)| *op == Operation::Update)
            .count()
    }

    #[tokio::test]
    async fn foreign_metadata_survives_reapply() {
        let store = MemoryStore::new();
        let mut deployment = Object::new(gvk::deployment(), "web");
        deployment.meta_mut().namespace = Some("ns".to_owned());
        deployment.set_annotation("team", "serving");
        deployment.data_mut()["spec"] = json!({ "replicas": 1 });
        apply(&store, &[deployment.clone()]).await.unwrap();

        // another controller stamps the live object
        let mut live = store.get(&gvk::deployment(), &deployment.key()).await.unwrap();
        live.set_annotation("deployment.kubernetes.io/revision", "1");
        live.meta_mut().labels = Some([("pod-template-hash".to_owned(), "abc".to_owned())].into());
        store.insert(live);

        for _ in 0..3 {
            apply(&store, &[deployment.clone()]).await.unwrap();
        }
        assert_eq!(updates(&store), 0);

        deployment.data_mut()["spec"]["replicas"] = json!(3);
        let updated = apply_one(&store, &deployment).await.unwrap();
        assert_eq!(updates(&store), 1);
        assert_eq!(updated.data()["spec"]["replicas"], 3);
        assert_eq!(
            updated.annotations().get("deployment.kubernetes.io/revision").map(String::as_str),
            Some("1")
        );
        assert_eq!(updated.annotations().get("team").map(String::as_str), Some("serving"));
        assert_eq!(updated.labels().get("pod-template-hash").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn server_defaulted_fields_do_not_trigger_updates() {
        let store = MemoryStore::new();
        apply(&store, &[service("a", 80)]).await.unwrap();

        let mut live = store.get(&gvk::service(), &service("a", 80).key()).await.unwrap();
        live.data_mut()["spec"] = json!({
            "clusterIP": "10.0.0.12",
            "type": "ClusterIP",
            "ports": [{ "port": 80, "protocol": "TCP", "targetPort": 80 }],
        });
        store.insert(live);

        apply(&store, &[service("a", 80)]).await.unwrap();
        assert_eq!(updates(&store), 0);

        // a desired value that differs from the defaulted one still wins
        let applied = apply_one(&store, &service("a", 81)).await.unwrap();
        assert_eq!(updates(&store), 1);
        assert_eq!(applied.data()["spec"], json!({ "ports": [{ "port": 81 }] }));
    }

    #[test]
    fn content_comparison_covers_only_desired_keys() {
        let desired = json!({ "spec": { "ports": [{ "port": 80 }], "selector": { "app": "a" } } });
        let live = json!({
            "spec": {
                "ports": [{ "port": 80, "protocol": "TCP" }],
                "selector": { "app": "a" },
                "sessionAffinity": "None",
            },
        });
        assert!(contains(&desired, &live));
        assert!(!contains(&live, &desired));
        assert!(!contains(
            &json!({ "spec": { "ports": [{ "port": 80 }, { "port": 81 }] } }),
            &live
        ));
        assert!(!contains(&json!({ "spec": { "selector": { "app": "b" } } }), &live));
    }

    #[tokio::test]
    async fn apply_stops_at_first_failure() {
        let store = MemoryStore::new();
        store.fail_next(Operation::Create, "Service", "quota exceeded");
        let err = apply(&store, &[service("a", 80), service("b", 80)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
        assert!(store.snapshot().is_empty());

        apply(&store, &[service("a", 80), service("b", 80)])
            .await
            .unwrap();
        assert_eq!(store.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn conflicting_update_propagates() {
        let store = MemoryStore::new();
        apply(&store, &[service("a", 80)]).await.unwrap();
        store.fail_next(Operation::Update, "Service", "stale");
        let err = apply(&store, &[service("a", 81)]).await.unwrap_err();
        assert!(matches!(err, Error::Backend { operation: Operation::Update, .. }));
    }

    #[tokio::test]
    async fn delete_tolerates_missing_objects() {
        let store = MemoryStore::new();
        apply(&store, &[service("a", 80)]).await.unwrap();
        delete(&store, &[service("a", 80), service("never", 80)])
            .await
            .unwrap();
        assert!(store.snapshot().is_empty());
        delete(&store, &[service("a", 80)]).await.unwrap();
    }

    #[tokio::test]
    async fn delete_owned_skips_foreign_objects() {
        let store = MemoryStore::new();
        apply(
            &store,
            &[owned(service("mine", 80), "a"), owned(service("theirs", 80), "b")],
        )
        .await
        .unwrap();

        let deleted = delete_owned(
            &store,
            &[service("mine", 80), service("theirs", 80), service("gone", 80)],
            &QualifiedName::namespaced("ns", "a"),
        )
        .await
        .unwrap();
        assert_eq!(deleted, 1);
        let left: Vec<_> = store.snapshot().iter().map(|o| o.name().to_owned()).collect();
        assert_eq!(left, vec!["theirs"]);
    }
}
