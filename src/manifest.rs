//! Loading object templates and rendering them for an owner.

use std::{
    fs,
    path::{Path, PathBuf},
};

use kube_core::DynamicObject;
use serde::Deserialize;

use crate::{
    config::Config,
    object::{Kind, Object, QualifiedName},
};

pub mod transform;
pub use transform::{Pipeline, Transform};

/// The error type returned while loading or rendering manifests.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid object in manifest {path} (document {index}): {reason}")]
    Invalid {
        path: PathBuf,
        index: usize,
        reason: String,
    },
    #[error("failed to transform {kind} {key}: {source}")]
    Transform {
        kind: String,
        key: QualifiedName,
        #[source]
        source: transform::Error,
    },
}

/// An ordered set of object descriptors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    objects: Vec<Object>,
}

impl Manifest {
    /// Reads a manifest file, or every `.yaml`, `.yml` and `.json` file of a
    /// directory in lexical order.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let read_err = |source| Error::Read {
            path: path.to_owned(),
            source,
        };
        if !fs::metadata(path).map_err(read_err)?.is_dir() {
            let source = fs::read_to_string(path).map_err(read_err)?;
            return Self::parse(&source, path);
        }

        let mut files = fs::read_dir(path)
            .map_err(read_err)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_err)?;
        files.retain(|file| {
            matches!(
                file.extension().and_then(|ext| ext.to_str()),
                Some("yaml" | "yml" | "json")
            )
        });
        files.sort();

        let mut manifest = Self::default();
        for file in files {
            manifest.objects.extend(Self::from_path(&file)?.objects);
        }
        Ok(manifest)
    }

    /// Parses a stream of YAML documents. `path` is only used for error
    /// reporting.
    ///
    /// Empty documents are skipped; any other document that is not a typed,
    /// named object fails the whole manifest.
    pub fn parse(source: &str, path: &Path) -> Result<Self, Error> {
        let mut objects = Vec::new();
        for (index, document) in serde_yaml::Deserializer::from_str(source).enumerate() {
            let value = serde_yaml::Value::deserialize(document).map_err(|source| Error::Parse {
                path: path.to_owned(),
                source,
            })?;
            if value.is_null() {
                continue;
            }

            let invalid = |reason: String| Error::Invalid {
                path: path.to_owned(),
                index,
                reason,
            };
            let json = serde_json::to_value(&value).map_err(|err| invalid(err.to_string()))?;
            let dynamic: DynamicObject =
                serde_json::from_value(json).map_err(|err| invalid(err.to_string()))?;
            let obj = Object::from_dynamic(dynamic).map_err(|err| invalid(err.to_string()))?;
            if obj.name().is_empty() {
                return Err(invalid("object has no metadata.name".to_owned()));
            }
            objects.push(obj);
        }
        Ok(Self { objects })
    }

    /// Runs `pipeline` over every object. The first failure aborts the whole
    /// manifest.
    pub fn transform(mut self, pipeline: &Pipeline) -> Result<Self, Error> {
        for obj in &mut self.objects {
            pipeline.run(obj).map_err(|source| Error::Transform {
                kind: obj.gvk().kind.clone(),
                key: obj.key(),
                source,
            })?;
        }
        Ok(self)
    }

    pub fn objects(&self) -> &[Object] {
        &self.objects
    }

    pub fn into_objects(self) -> Vec<Object> {
        self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Renders the configured manifest sources for an owner.
#[derive(Debug, Clone)]
pub struct Renderer {
    sources: Vec<PathBuf>,
    image: Option<(String, String)>,
}

impl Renderer {
    pub fn new(config: &Config) -> Self {
        Self {
            sources: config.manifests.clone(),
            image: config
                .image
                .clone()
                .map(|image| (config.image_container.clone(), image)),
        }
    }

    /// The transforms applied for `owner`, in order: namespace injection,
    /// image substitution, owner stamping.
    pub fn pipeline(&self, owner: &QualifiedName) -> Pipeline {
        let mut pipeline = Pipeline::new();
        if let Some(namespace) = &owner.namespace {
            pipeline = pipeline.with(transform::inject_namespace(namespace));
        }
        if let Some((container, image)) = &self.image {
            pipeline = pipeline.with_for(Kind::Deployment, transform::replace_image(container, image));
        }
        pipeline.with(transform::stamp_owner(owner))
    }

    /// Reads every source afresh and renders it for `owner`.
    pub fn render(&self, owner: &QualifiedName) -> Result<Manifest, Error> {
        let pipeline = self.pipeline(owner);
        let mut objects = Vec::new();
        for source in &self.sources {
            let manifest = Manifest::from_path(source)?.transform(&pipeline)?;
            if manifest.is_empty() {
                log::warn!("Manifest source {} holds no objects", source.display());
                continue;
            }
            log::debug!(
                "Rendered {} objects from {} for {owner}",
                manifest.len(),
                source.display()
            );
            objects.extend(manifest.into_objects());
        }
        Ok(Manifest { objects })
    }
}
