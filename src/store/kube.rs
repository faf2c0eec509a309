use kube_client::{
    api::{DeleteParams, ListParams, PostParams},
    Api, Client,
};
use kube_core::{ApiResource, DynamicObject, GroupVersionKind};

use super::{Error, LabelSelector, ObjectStore, Operation};
use crate::object::{Object, QualifiedName};

/// [`ObjectStore`] backed by the Kubernetes apiserver.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(gvk);
        match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn map_err(
    operation: Operation,
    gvk: &GroupVersionKind,
    key: &QualifiedName,
    err: kube_client::Error,
) -> Error {
    let kind = gvk.kind.clone();
    match err {
        kube_client::Error::Api(resp) if resp.code == 404 => Error::NotFound {
            kind,
            key: key.clone(),
        },
        kube_client::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::AlreadyExists {
                kind,
                key: key.clone(),
            }
        }
        kube_client::Error::Api(resp) if resp.code == 409 => Error::Conflict {
            kind,
            key: key.clone(),
            message: resp.message,
        },
        source => Error::Api {
            operation,
            kind,
            target: key.to_string(),
            source,
        },
    }
}

impl ObjectStore for KubeStore {
    async fn get(&self, gvk: &GroupVersionKind, key: &QualifiedName) -> Result<Object, Error> {
        let obj = self
            .api(gvk, key.namespace.as_deref())
            .get(&key.name)
            .await
            .map_err(|err| map_err(Operation::Get, gvk, key, err))?;
        Ok(Object::with_gvk(gvk.clone(), obj))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Object>, Error> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_string());
        }
        let list = self
            .api(gvk, namespace)
            .list(&params)
            .await
            .map_err(|err| match err {
                kube_client::Error::Api(resp) if resp.code == 404 => Error::NotFound {
                    kind: gvk.kind.clone(),
                    key: QualifiedName {
                        namespace: namespace.map(str::to_owned),
                        name: selector.to_string(),
                    },
                },
                source => Error::Api {
                    operation: Operation::List,
                    kind: gvk.kind.clone(),
                    target: selector.to_string(),
                    source,
                },
            })?;
        Ok(list
            .items
            .into_iter()
            .map(|obj| Object::with_gvk(gvk.clone(), obj))
            .collect())
    }

    async fn create(&self, obj: &Object) -> Result<Object, Error> {
        let key = obj.key();
        let created = self
            .api(obj.gvk(), obj.namespace())
            .create(&PostParams::default(), obj.as_dynamic())
            .await
            .map_err(|err| map_err(Operation::Create, obj.gvk(), &key, err))?;
        Ok(Object::with_gvk(obj.gvk().clone(), created))
    }

    async fn update(&self, obj: &Object) -> Result<Object, Error> {
        let key = obj.key();
        let updated = self
            .api(obj.gvk(), obj.namespace())
            .replace(obj.name(), &PostParams::default(), obj.as_dynamic())
            .await
            .map_err(|err| map_err(Operation::Update, obj.gvk(), &key, err))?;
        Ok(Object::with_gvk(obj.gvk().clone(), updated))
    }

    async fn delete(&self, gvk: &GroupVersionKind, key: &QualifiedName) -> Result<(), Error> {
        self.api(gvk, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|err| map_err(Operation::Delete, gvk, key, err))?;
        Ok(())
    }
}
