//! The object store capability the controller converges against.
//!
//! Every operation reports "not found", "already exists" and optimistic
//! concurrency conflicts as distinguishable errors so that callers can decide
//! which outcomes are benign for them.

use std::{collections::BTreeMap, fmt, future::Future};

use kube_core::GroupVersionKind;

use crate::object::{Object, QualifiedName};

pub mod kube;
pub use self::kube::KubeStore;
pub mod memory;
pub use memory::MemoryStore;

/// Store operations, for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// The error type returned by [`ObjectStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: QualifiedName },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: QualifiedName },
    #[error("conflict updating {kind} {key}: {message}")]
    Conflict {
        kind: String,
        key: QualifiedName,
        message: String,
    },
    #[error("failed to {operation} {kind} {target}: {source}")]
    Api {
        operation: Operation,
        kind: String,
        target: String,
        #[source]
        source: kube_client::Error,
    },
    #[error("failed to {operation} {kind} {target}: {message}")]
    Backend {
        operation: Operation,
        kind: String,
        target: String,
        message: String,
    },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// A conjunction of label requirements, as understood by list calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Exists(String),
    Equals(String, String),
}

impl LabelSelector {
    /// Requires the label `key` to be present with any value.
    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.requirements.push(Requirement::Exists(key.into()));
        self
    }

    /// Requires the label `key` to equal `value`.
    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements
            .push(Requirement::Equals(key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Exists(key) => labels.contains_key(key),
            Requirement::Equals(key, value) => labels.get(key) == Some(value),
        })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, req) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match req {
                Requirement::Exists(key) => f.write_str(key)?,
                Requirement::Equals(key, value) => write!(f, "{key}={value}")?,
            }
        }
        Ok(())
    }
}

/// Generic access to the backing object store.
///
/// Implementations are cheap to clone handles onto shared state, so that
/// reconcilers for distinct keys can run concurrently against one store.
pub trait ObjectStore: Send + Sync {
    fn get(
        &self,
        gvk: &GroupVersionKind,
        key: &QualifiedName,
    ) -> impl Future<Output = Result<Object, Error>> + Send;

    /// Lists objects of type `gvk` matching `selector`, across all namespaces
    /// when `namespace` is `None`.
    fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> impl Future<Output = Result<Vec<Object>, Error>> + Send;

    fn create(&self, obj: &Object) -> impl Future<Output = Result<Object, Error>> + Send;

    /// Replaces the stored object. When `obj` carries a resource version the
    /// update is conditional on it.
    fn update(&self, obj: &Object) -> impl Future<Output = Result<Object, Error>> + Send;

    fn delete(
        &self,
        gvk: &GroupVersionKind,
        key: &QualifiedName,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Like [`get`](Self::get), mapping "not found" to `None`.
    fn get_opt(
        &self,
        gvk: &GroupVersionKind,
        key: &QualifiedName,
    ) -> impl Future<Output = Result<Option<Object>, Error>> + Send {
        async move {
            match self.get(gvk, key).await {
                Ok(obj) => Ok(Some(obj)),
                Err(err) if err.is_not_found() => Ok(None),
                Err(err) => Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn selector_matching() {
        let selector = LabelSelector::default()
            .exists("serving.knative.dev/route")
            .equals("a", "b");
        assert!(selector.matches(&labels(&[("serving.knative.dev/route", "x"), ("a", "b")])));
        assert!(!selector.matches(&labels(&[("serving.knative.dev/route", "x")])));
        assert!(!selector.matches(&labels(&[("a", "b")])));
        assert!(LabelSelector::default().matches(&labels(&[])));
    }

    #[test]
    fn selector_display() {
        let selector = LabelSelector::default().exists("k").equals("a", "b");
        assert_eq!(selector.to_string(), "k,a=b");
        assert_eq!(LabelSelector::default().to_string(), "");
    }
}
