//! Kind-tagged object descriptors shared by every stage of the controller.

use std::{collections::BTreeMap, fmt};

use kube_core::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta, Resource, TypeMeta};
use serde::{de::DeserializeOwned, Serialize};

/// Annotation naming the owner resource that rendered an object.
pub const OWNER_NAME_ANNOTATION: &str = "operator.knative.dev/ownerName";
/// Annotation naming the namespace of the owner resource that rendered an object.
pub const OWNER_NAMESPACE_ANNOTATION: &str = "operator.knative.dev/ownerNamespace";

/// Uniquely identifies an object of a known type by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// The object namespace, if any
    pub namespace: Option<String>,
    /// The object name
    pub name: String,
}

impl QualifiedName {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Returns `None` for objects that have not been given a name yet.
    pub fn from_resource<K: Resource>(resource: &K) -> Option<Self> {
        Some(Self {
            namespace: resource.meta().namespace.clone(),
            name: resource.meta().name.clone()?,
        })
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// The kinds the controller treats specially.
///
/// Everything else is carried through as [`Kind::Other`] and only receives
/// the transforms registered for all kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Namespace,
    ClusterRole,
    ClusterRoleBinding,
    CustomResourceDefinition,
    Deployment,
    Service,
    Route,
    ConsoleCliDownload,
    ServiceMonitor,
    VirtualService,
    Other,
}

impl Kind {
    pub fn of(gvk: &GroupVersionKind) -> Self {
        match (gvk.group.as_str(), gvk.kind.as_str()) {
            ("", "Namespace") => Self::Namespace,
            ("", "Service") => Self::Service,
            ("rbac.authorization.k8s.io", "ClusterRole") => Self::ClusterRole,
            ("rbac.authorization.k8s.io", "ClusterRoleBinding") => Self::ClusterRoleBinding,
            ("apiextensions.k8s.io", "CustomResourceDefinition") => Self::CustomResourceDefinition,
            ("apps", "Deployment") => Self::Deployment,
            ("route.openshift.io", "Route") => Self::Route,
            ("console.openshift.io", "ConsoleCLIDownload") => Self::ConsoleCliDownload,
            ("monitoring.coreos.com", "ServiceMonitor") => Self::ServiceMonitor,
            ("networking.istio.io", "VirtualService") => Self::VirtualService,
            _ => Self::Other,
        }
    }

    /// Cluster-scoped kinds never receive a namespace.
    pub fn is_cluster_scoped(self) -> bool {
        matches!(
            self,
            Self::Namespace
                | Self::ClusterRole
                | Self::ClusterRoleBinding
                | Self::CustomResourceDefinition
                | Self::ConsoleCliDownload
        )
    }
}

/// Well-known group/version/kinds.
pub mod gvk {
    use kube_core::GroupVersionKind;

    pub fn deployment() -> GroupVersionKind {
        GroupVersionKind::gvk("apps", "v1", "Deployment")
    }

    pub fn service() -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", "Service")
    }

    pub fn route() -> GroupVersionKind {
        GroupVersionKind::gvk("route.openshift.io", "v1", "Route")
    }

    pub fn console_cli_download() -> GroupVersionKind {
        GroupVersionKind::gvk("console.openshift.io", "v1", "ConsoleCLIDownload")
    }

    pub fn service_monitor() -> GroupVersionKind {
        GroupVersionKind::gvk("monitoring.coreos.com", "v1", "ServiceMonitor")
    }

    pub fn virtual_service() -> GroupVersionKind {
        GroupVersionKind::gvk("networking.istio.io", "v1alpha3", "VirtualService")
    }

    pub fn knative_serving() -> GroupVersionKind {
        GroupVersionKind::gvk("operator.knative.dev", "v1alpha1", "KnativeServing")
    }
}

/// An object missing the type information needed to address it.
#[derive(Debug, thiserror::Error)]
#[error("object has no apiVersion/kind")]
pub struct MissingType;

/// A concrete object descriptor: the dynamic body plus its resolved kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    gvk: GroupVersionKind,
    kind: Kind,
    inner: DynamicObject,
}

impl Object {
    /// An empty object of type `gvk` named `name`.
    pub fn new(gvk: GroupVersionKind, name: &str) -> Self {
        let mut inner = DynamicObject::new(name, &ApiResource::from_gvk(&gvk));
        inner.data = serde_json::Value::Object(serde_json::Map::new());
        Self::with_gvk(gvk, inner)
    }

    /// Wraps a dynamic object whose `apiVersion`/`kind` are set.
    pub fn from_dynamic(inner: DynamicObject) -> Result<Self, MissingType> {
        let types = inner.types.as_ref().ok_or(MissingType)?;
        if types.kind.is_empty() || types.api_version.is_empty() {
            return Err(MissingType);
        }
        let gvk = parse_gvk(types);
        Ok(Self::with_gvk(gvk, inner))
    }

    /// Wraps a dynamic object of a known type, filling in `apiVersion`/`kind`
    /// when the server omitted them (as it does for list items).
    pub fn with_gvk(gvk: GroupVersionKind, mut inner: DynamicObject) -> Self {
        inner.types = Some(TypeMeta {
            api_version: gvk.api_version(),
            kind: gvk.kind.clone(),
        });
        Self {
            kind: Kind::of(&gvk),
            gvk,
            inner,
        }
    }

    /// Converts a typed resource into a descriptor of type `gvk`.
    pub fn from_typed<T: Serialize>(gvk: GroupVersionKind, value: &T) -> serde_json::Result<Self> {
        let inner: DynamicObject = serde_json::from_value(serde_json::to_value(value)?)?;
        Ok(Self::with_gvk(gvk, inner))
    }

    /// Converts the descriptor into a typed resource.
    pub fn typed<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(serde_json::to_value(&self.inner)?)
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn name(&self) -> &str {
        self.inner.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.inner.metadata.namespace.as_deref()
    }

    pub fn key(&self) -> QualifiedName {
        QualifiedName {
            namespace: self.inner.metadata.namespace.clone(),
            name: self.name().to_owned(),
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        &self.inner.metadata
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.inner.metadata
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.inner.data
    }

    pub fn data_mut(&mut self) -> &mut serde_json::Value {
        &mut self.inner.data
    }

    pub fn as_dynamic(&self) -> &DynamicObject {
        &self.inner
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.inner.metadata.labels.as_ref().unwrap_or(&EMPTY)
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.inner.metadata.annotations.as_ref().unwrap_or(&EMPTY)
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.inner
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_owned(), value.to_owned());
    }

    /// The owner recorded by the stamping transform, if any.
    pub fn owner(&self) -> Option<QualifiedName> {
        let annotations = self.annotations();
        let name = annotations.get(OWNER_NAME_ANNOTATION)?;
        Some(QualifiedName {
            namespace: annotations.get(OWNER_NAMESPACE_ANNOTATION).cloned(),
            name: name.clone(),
        })
    }

    /// Whether the object was stamped by an owner other than `owner`.
    /// Unstamped objects belong to nobody in particular and are not foreign.
    pub fn is_foreign_to(&self, owner: &QualifiedName) -> bool {
        self.owner().is_some_and(|stamped| stamped != *owner)
    }
}

fn parse_gvk(types: &TypeMeta) -> GroupVersionKind {
    match types.api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, &types.kind),
        None => GroupVersionKind::gvk("", &types.api_version, &types.kind),
    }
}
