//! Reclaiming sibling objects that the applied manifests do not own.

use std::collections::BTreeMap;

use kube_core::GroupVersionKind;

use crate::{
    object::gvk,
    store::{Error, LabelSelector, ObjectStore},
};

/// Label carried by every object the networking layer creates for a route.
pub const ROUTE_LABEL: &str = "serving.knative.dev/route";
/// Annotation naming the ingress implementation responsible for an object.
pub const INGRESS_CLASS_ANNOTATION: &str = "networking.knative.dev/ingress.class";
/// The ingress class installed by the rendered manifests.
pub const KOURIER_INGRESS_CLASS: &str = "kourier.ingress.networking.knative.dev";

/// Decides from an object's annotations whether it may stay.
pub trait AnnotationPredicate {
    fn keep(&self, annotations: &BTreeMap<String, String>) -> bool;
}

impl<F: Fn(&BTreeMap<String, String>) -> bool> AnnotationPredicate for F {
    fn keep(&self, annotations: &BTreeMap<String, String>) -> bool {
        (self)(annotations)
    }
}

/// Keeps objects whose ingress class annotation equals `class`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressClass {
    pub annotation: String,
    pub class: String,
}

impl IngressClass {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            annotation: INGRESS_CLASS_ANNOTATION.to_owned(),
            class: class.into(),
        }
    }
}

impl AnnotationPredicate for IngressClass {
    fn keep(&self, annotations: &BTreeMap<String, String>) -> bool {
        annotations.get(&self.annotation) == Some(&self.class)
    }
}

/// What the owner reconciler sweeps on every pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    pub gvk: GroupVersionKind,
    pub selector: LabelSelector,
    pub managed_class: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            gvk: gvk::virtual_service(),
            selector: LabelSelector::default().exists(ROUTE_LABEL),
            managed_class: KOURIER_INGRESS_CLASS.to_owned(),
        }
    }
}

impl SweepConfig {
    pub fn predicate(&self) -> IngressClass {
        IngressClass::new(self.managed_class.clone())
    }
}

/// Deletes every object of type `gvk` matching `selector` that `predicate`
/// does not keep, and returns how many were removed.
///
/// A type the cluster does not serve has nothing to sweep.
pub async fn sweep<S: ObjectStore>(
    store: &S,
    gvk: &GroupVersionKind,
    selector: &LabelSelector,
    predicate: &impl AnnotationPredicate,
) -> Result<usize, Error> {
    let candidates = match store.list(gvk, None, selector).await {
        Ok(candidates) => candidates,
        Err(err) if err.is_not_found() => {
            log::debug!("{} is not served, nothing to sweep", gvk.kind);
            return Ok(0);
        }
        Err(err) => return Err(err),
    };

    let mut removed = 0;
    for obj in candidates {
        if predicate.keep(obj.annotations()) {
            continue;
        }
        match store.delete(gvk, &obj.key()).await {
            Ok(()) => {
                log::info!("Swept orphaned {} {}", gvk.kind, obj.key());
                removed += 1;
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(removed)
}
