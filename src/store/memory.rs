use std::{collections::BTreeMap, sync::Arc};

use kube_core::GroupVersionKind;
use parking_lot::Mutex;

use super::{Error, LabelSelector, ObjectStore, Operation};
use crate::object::{Object, QualifiedName};

type Slot = (String, String, QualifiedName);

fn slot(gvk: &GroupVersionKind, key: &QualifiedName) -> Slot {
    (gvk.group.clone(), gvk.kind.clone(), key.clone())
}

/// In-process [`ObjectStore`] with apiserver-like semantics: resource
/// versions, conditional updates, a `status` field that only [`insert`]
/// writes, and label-selected lists.
///
/// [`insert`]: MemoryStore::insert
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Slot, Object>,
    version: u64,
    failures: Vec<(Operation, String, Error)>,
    calls: Vec<(Operation, String, QualifiedName)>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn take_failure(&mut self, operation: Operation, kind: &str) -> Result<(), Error> {
        let pos = self
            .failures
            .iter()
            .position(|(op, k, _)| *op == operation && k == kind);
        match pos {
            Some(pos) => Err(self.failures.remove(pos).2),
            None => Ok(()),
        }
    }

    fn record(&mut self, operation: Operation, kind: &str, key: &QualifiedName) {
        self.calls.push((operation, kind.to_owned(), key.clone()));
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `obj` unconditionally, including its status, as an external
    /// actor would.
    pub fn insert(&self, mut obj: Object) -> Object {
        let mut inner = self.inner.lock();
        let version = inner.next_version();
        let key = slot(obj.gvk(), &obj.key());
        let uid = inner
            .objects
            .get(&key)
            .and_then(|live| live.meta().uid.clone())
            .unwrap_or_else(|| format!("uid-{version}"));
        obj.meta_mut().resource_version = Some(version);
        obj.meta_mut().uid = Some(uid);
        inner.objects.insert(key, obj.clone());
        obj
    }

    /// Makes the next `operation` on `kind` fail with a backend error
    /// carrying `message`.
    pub fn fail_next(&self, operation: Operation, kind: &str, message: &str) {
        self.fail_next_with(
            operation,
            kind,
            Error::Backend {
                operation,
                kind: kind.to_owned(),
                target: "*".to_owned(),
                message: message.to_owned(),
            },
        );
    }

    /// Makes the next `operation` on `kind` fail with `err`.
    pub fn fail_next_with(&self, operation: Operation, kind: &str, err: Error) {
        self.inner
            .lock()
            .failures
            .push((operation, kind.to_owned(), err));
    }

    /// Every stored object, ordered by group, kind, namespace and name.
    pub fn snapshot(&self) -> Vec<Object> {
        self.inner.lock().objects.values().cloned().collect()
    }

    /// Stored objects of type `gvk`.
    pub fn objects(&self, gvk: &GroupVersionKind) -> Vec<Object> {
        self.inner
            .lock()
            .objects
            .iter()
            .filter(|((group, kind, _), _)| *group == gvk.group && *kind == gvk.kind)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// The operations served so far, with the kind and key they targeted.
    pub fn calls(&self) -> Vec<(Operation, String, QualifiedName)> {
        self.inner.lock().calls.clone()
    }
}

impl ObjectStore for MemoryStore {
    async fn get(&self, gvk: &GroupVersionKind, key: &QualifiedName) -> Result<Object, Error> {
        let mut inner = self.inner.lock();
        inner.record(Operation::Get, &gvk.kind, key);
        inner.take_failure(Operation::Get, &gvk.kind)?;
        inner
            .objects
            .get(&slot(gvk, key))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: gvk.kind.clone(),
                key: key.clone(),
            })
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Object>, Error> {
        let mut inner = self.inner.lock();
        let target = QualifiedName {
            namespace: namespace.map(str::to_owned),
            name: selector.to_string(),
        };
        inner.record(Operation::List, &gvk.kind, &target);
        inner.take_failure(Operation::List, &gvk.kind)?;
        Ok(inner
            .objects
            .iter()
            .filter(|((group, kind, key), _)| {
                *group == gvk.group
                    && *kind == gvk.kind
                    && namespace.map_or(true, |ns| key.namespace.as_deref() == Some(ns))
            })
            .map(|(_, obj)| obj)
            .filter(|obj| selector.matches(obj.labels()))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &Object) -> Result<Object, Error> {
        let mut inner = self.inner.lock();
        let key = obj.key();
        inner.record(Operation::Create, &obj.gvk().kind, &key);
        inner.take_failure(Operation::Create, &obj.gvk().kind)?;
        let slot = slot(obj.gvk(), &key);
        if inner.objects.contains_key(&slot) {
            return Err(Error::AlreadyExists {
                kind: obj.gvk().kind.clone(),
                key,
            });
        }
        let version = inner.next_version();
        let mut created = obj.clone();
        created.meta_mut().resource_version = Some(version.clone());
        created.meta_mut().uid = Some(format!("uid-{version}"));
        inner.objects.insert(slot, created.clone());
        Ok(created)
    }

    async fn update(&self, obj: &Object) -> Result<Object, Error> {
        let mut inner = self.inner.lock();
        let key = obj.key();
        let kind = obj.gvk().kind.clone();
        inner.record(Operation::Update, &kind, &key);
        inner.take_failure(Operation::Update, &kind)?;
        let slot = slot(obj.gvk(), &key);
        let Some(live) = inner.objects.get(&slot) else {
            return Err(Error::NotFound { kind, key });
        };
        if let Some(expected) = &obj.meta().resource_version {
            if live.meta().resource_version.as_ref() != Some(expected) {
                return Err(Error::Conflict {
                    kind,
                    key,
                    message: format!(
                        "resource version {expected} is stale, stored object is at {}",
                        live.meta().resource_version.as_deref().unwrap_or_default()
                    ),
                });
            }
        }

        let mut updated = obj.clone();
        let status = live.data().get("status").cloned();
        let uid = live.meta().uid.clone();
        if let Some(body) = updated.data_mut().as_object_mut() {
            match status {
                Some(status) => body.insert("status".to_owned(), status),
                None => body.remove("status"),
            };
        }
        updated.meta_mut().uid = uid;
        updated.meta_mut().resource_version = Some(inner.next_version());
        inner.objects.insert(slot, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, gvk: &GroupVersionKind, key: &QualifiedName) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        inner.record(Operation::Delete, &gvk.kind, key);
        inner.take_failure(Operation::Delete, &gvk.kind)?;
        match inner.objects.remove(&slot(gvk, key)) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound {
                kind: gvk.kind.clone(),
                key: key.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::object::gvk;

    fn service(ns: &str, name: &str) -> Object {
        let mut obj = Object::new(gvk::service(), name);
        obj.meta_mut().namespace = Some(ns.to_owned());
        obj
    }

    #[tokio::test]
    async fn create_then_conflicting_update() {
        let store = MemoryStore::new();
        let created = store.create(&service("ns", "a")).await.unwrap();
        assert!(created.meta().resource_version.is_some());

        let err = store.create(&service("ns", "a")).await.unwrap_err();
        assert!(err.is_already_exists());

        let mut stale = created.clone();
        store.update(&created).await.unwrap();
        stale.data_mut()["spec"] = json!({ "type": "ClusterIP" });
        let err = store.update(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn update_preserves_status() {
        let store = MemoryStore::new();
        let mut route = Object::new(gvk::route(), "r");
        route.meta_mut().namespace = Some("ns".to_owned());
        route.data_mut()["status"] = json!({ "ingress": [] });
        let stored = store.insert(route);

        let mut desired = stored.clone();
        desired.meta_mut().resource_version = None;
        if let Some(body) = desired.data_mut().as_object_mut() {
            body.remove("status");
        }
        let updated = store.update(&desired).await.unwrap();
        assert_eq!(updated.data()["status"], json!({ "ingress": [] }));
        assert_eq!(updated.meta().uid, stored.meta().uid);
    }

    #[tokio::test]
    async fn delete_and_get_missing() {
        let store = MemoryStore::new();
        let key = QualifiedName::namespaced("ns", "a");
        assert!(store.get(&gvk::service(), &key).await.unwrap_err().is_not_found());
        assert!(store.delete(&gvk::service(), &key).await.unwrap_err().is_not_found());
        assert_eq!(store.get_opt(&gvk::service(), &key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let store = MemoryStore::new();
        store.fail_next(Operation::Create, "Service", "boom");
        let err = store.create(&service("ns", "a")).await.unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
        store.create(&service("ns", "a")).await.unwrap();
    }
}
