//! Pure, idempotent rewrites applied to every rendered object.

use k8s_openapi::api::apps::v1::Deployment;

use crate::object::{Kind, Object, QualifiedName, OWNER_NAMESPACE_ANNOTATION, OWNER_NAME_ANNOTATION};

/// The error type returned by a failing [`Transform`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to convert {kind} {name} to {target}: {source}")]
    Convert {
        kind: String,
        name: String,
        target: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A rewrite of one object descriptor.
///
/// Applying a transform twice must yield the same object as applying it once.
pub trait Transform: Send + Sync {
    fn apply(&self, obj: &mut Object) -> Result<(), Error>;
}

impl<F> Transform for F
where
    F: Fn(&mut Object) -> Result<(), Error> + Send + Sync,
{
    fn apply(&self, obj: &mut Object) -> Result<(), Error> {
        (self)(obj)
    }
}

struct Stage {
    kind: Option<Kind>,
    transform: Box<dyn Transform>,
}

/// An ordered chain of transforms, each registered for all kinds or for a
/// single [`Kind`].
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transform applied to every object.
    pub fn with(mut self, transform: impl Transform + 'static) -> Self {
        self.stages.push(Stage {
            kind: None,
            transform: Box::new(transform),
        });
        self
    }

    /// Appends a transform applied only to objects of `kind`.
    pub fn with_for(mut self, kind: Kind, transform: impl Transform + 'static) -> Self {
        self.stages.push(Stage {
            kind: Some(kind),
            transform: Box::new(transform),
        });
        self
    }

    /// Runs every applicable stage over `obj` in registration order.
    pub fn run(&self, obj: &mut Object) -> Result<(), Error> {
        for stage in &self.stages {
            if stage.kind.map_or(true, |kind| kind == obj.kind()) {
                stage.transform.apply(obj)?;
            }
        }
        Ok(())
    }
}

/// Moves namespaced objects into `namespace`.
pub fn inject_namespace(namespace: &str) -> impl Transform {
    let namespace = namespace.to_owned();
    move |obj: &mut Object| -> Result<(), Error> {
        if !obj.kind().is_cluster_scoped() {
            obj.meta_mut().namespace = Some(namespace.clone());
        }
        Ok(())
    }
}

/// Points the container named `container` at `image`.
///
/// Meant for [`Kind::Deployment`]; objects that are left unchanged are not
/// rewritten at all.
pub fn replace_image(container: &str, image: &str) -> impl Transform {
    let container = container.to_owned();
    let image = image.to_owned();
    move |obj: &mut Object| -> Result<(), Error> {
        let mut deploy: Deployment = obj.typed().map_err(|source| Error::Convert {
            kind: obj.gvk().kind.clone(),
            name: obj.name().to_owned(),
            target: "Deployment",
            source,
        })?;

        let Some(target) = deploy
            .spec
            .as_mut()
            .and_then(|spec| spec.template.spec.as_mut())
            .and_then(|pod| pod.containers.iter_mut().find(|c| c.name == container))
        else {
            return Ok(());
        };
        if target.image.as_deref() == Some(image.as_str()) {
            return Ok(());
        }

        log::info!(
            "Replacing image of container {container} in deployment {} with {image}",
            obj.key()
        );
        target.image = Some(image.clone());
        *obj = Object::from_typed(obj.gvk().clone(), &deploy).map_err(|source| Error::Convert {
            kind: "Deployment".to_owned(),
            name: obj.name().to_owned(),
            target: "object",
            source,
        })?;
        Ok(())
    }
}

/// Records `owner` in the ownership annotations.
pub fn stamp_owner(owner: &QualifiedName) -> impl Transform {
    let owner = owner.clone();
    move |obj: &mut Object| -> Result<(), Error> {
        obj.set_annotation(OWNER_NAME_ANNOTATION, &owner.name);
        if let Some(namespace) = &owner.namespace {
            obj.set_annotation(OWNER_NAMESPACE_ANNOTATION, namespace);
        }
        Ok(())
    }
}
