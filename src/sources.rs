//! Monitoring for event source adapters.
//!
//! Every deployment whose labels identify it as an event source gets a
//! metrics Service selecting its pods and a ServiceMonitor scraping that
//! Service. The derived objects are recomputed from the deployment's current
//! selector on every pass. They are not removed when the deployment goes
//! away.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{Service, ServicePort, ServiceSpec},
    },
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use serde_json::json;

use crate::{
    apply,
    object::{gvk, Object, QualifiedName},
    store::{self, ObjectStore},
};

/// Label identifying the controller of an event source.
pub const SOURCE_LABEL: &str = "eventing.knative.dev/source";
/// Label naming the source instance.
pub const SOURCE_NAME_LABEL: &str = "eventing.knative.dev/sourceName";
/// Label naming the role of a source workload, e.g. `adapter`.
pub const SOURCE_ROLE_LABEL: &str = "sources.knative.dev/role";

pub const METRICS_PORT_NAME: &str = "http-metrics";
pub const METRICS_PORT: i32 = 9090;

/// The error type returned by [`SourceReconciler::reconcile_deployment`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error("failed to convert {kind} {key}: {source}")]
    Convert {
        kind: &'static str,
        key: QualifiedName,
        #[source]
        source: serde_json::Error,
    },
}

fn is_source(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels.is_some_and(|labels| labels.contains_key(SOURCE_LABEL))
}

/// The Service and ServiceMonitor for a source deployment, or `None` if the
/// deployment is not an event source.
pub fn monitoring_objects(deployment: &Deployment) -> Result<Option<[Object; 2]>, Error> {
    let selector = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.match_labels.clone())
        .unwrap_or_default();
    if !is_source(Some(&selector)) && !is_source(deployment.metadata.labels.as_ref()) {
        return Ok(None);
    }

    let name = deployment.metadata.name.clone().unwrap_or_default();
    let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
    let key = QualifiedName::namespaced(&namespace, &name);

    let mut match_labels = selector.clone();
    match_labels.insert("name".to_owned(), name.clone());

    let service = Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(match_labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some(METRICS_PORT_NAME.to_owned()),
                port: METRICS_PORT,
                target_port: Some(IntOrString::Int(METRICS_PORT)),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    };
    let service = Object::from_typed(gvk::service(), &service).map_err(|source| Error::Convert {
        kind: "Service",
        key: key.clone(),
        source,
    })?;

    let mut monitor = Object::new(gvk::service_monitor(), &name);
    monitor.meta_mut().namespace = Some(namespace.clone());
    monitor.meta_mut().labels = Some(match_labels.clone());
    *monitor.data_mut() = json!({
        "spec": {
            "endpoints": [{ "port": METRICS_PORT_NAME, "interval": "30s" }],
            "namespaceSelector": { "matchNames": [namespace] },
            "selector": { "matchLabels": match_labels },
        },
    });

    Ok(Some([service, monitor]))
}

/// Derives monitoring objects for source deployments.
#[derive(Clone)]
pub struct SourceReconciler<S> {
    store: S,
}

impl<S: ObjectStore> SourceReconciler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Brings the monitoring objects of the deployment `key` up to date.
    /// Returns whether the deployment is a monitored source.
    pub async fn reconcile_deployment(&self, key: &QualifiedName) -> Result<bool, Error> {
        let Some(obj) = self.store.get_opt(&gvk::deployment(), key).await? else {
            log::debug!("Deployment {key} is gone");
            return Ok(false);
        };
        let deployment: Deployment = obj.typed().map_err(|source| Error::Convert {
            kind: "Deployment",
            key: key.clone(),
            source,
        })?;
        let Some(objects) = monitoring_objects(&deployment)? else {
            return Ok(false);
        };

        apply::apply(&self.store, &objects).await?;
        log::info!("Monitoring for source deployment {key} is up to date");
        Ok(true)
    }
}
