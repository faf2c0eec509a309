//! The owner reconciler.
//!
//! Nothing about an owner's progress is persisted. Every pass starts from the
//! owner's current state and walks the whole path again:
//!
//! ```text
//! Absent -> Rendering -> Applying -> AwaitingReadiness -> Derived
//!                                                           |
//! Absent <----------------- TearingDown <--- owner deleted -+
//! ```

use std::{fmt, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    apply, cli_download,
    config::Config,
    manifest::{self, Renderer},
    object::{Object, QualifiedName},
    readiness,
    store::{self, ObjectStore},
    sweep,
};

/// Where a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Absent,
    Rendering,
    Applying,
    AwaitingReadiness,
    Derived,
    TearingDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a pass has to do, decided from the owner snapshot alone.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Converge(Object),
    TearDown,
}

impl Plan {
    pub fn for_owner(owner: Option<Object>) -> Self {
        match owner {
            Some(owner) if owner.meta().deletion_timestamp.is_none() => Self::Converge(owner),
            _ => Self::TearDown,
        }
    }
}

/// The result of a successful pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub phase: Phase,
    pub applied: usize,
    pub swept: usize,
    pub host: Option<String>,
}

/// The error type returned by [`Reconciler::reconcile`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to fetch owner {key}: {source}")]
    Owner {
        key: QualifiedName,
        #[source]
        source: store::Error,
    },
    #[error("failed to render manifests: {0}")]
    Render(#[from] manifest::Error),
    #[error("failed to apply manifests: {0}")]
    Apply(#[source] store::Error),
    #[error("failed to sweep orphans: {0}")]
    Sweep(#[source] store::Error),
    #[error("download route not ready: {0}")]
    Readiness(#[from] readiness::Error),
    #[error("failed to converge CLI downloads: {0}")]
    Derive(#[from] cli_download::Error),
    #[error("failed to tear down: {0}")]
    Teardown(#[source] store::Error),
}

impl Error {
    /// Whether the failure is expected to clear up by itself, as opposed to
    /// one that needs the manifests, configuration or cluster fixed first.
    /// Both kinds are retried.
    pub fn is_transient(&self) -> bool {
        fn store_transient(err: &store::Error) -> bool {
            err.is_conflict() || err.is_not_found()
        }

        match self {
            Self::Readiness(readiness::Error::Timeout { .. } | readiness::Error::Cancelled { .. }) => {
                true
            }
            Self::Readiness(readiness::Error::Store(err)) => store_transient(err),
            Self::Readiness(readiness::Error::Malformed { .. }) => false,
            Self::Owner { source, .. }
            | Self::Apply(source)
            | Self::Sweep(source)
            | Self::Teardown(source)
            | Self::Derive(cli_download::Error::Store(source)) => store_transient(source),
            Self::Render(_) | Self::Derive(cli_download::Error::Build(_)) => false,
        }
    }
}

/// Converges the objects of one owner per call.
pub struct Reconciler<S> {
    store: S,
    config: Arc<Config>,
    renderer: Renderer,
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: S, config: Arc<Config>) -> Self {
        let renderer = Renderer::new(&config);
        Self {
            store,
            config,
            renderer,
        }
    }

    /// Runs one pass for the owner `key`.
    ///
    /// `cancel` only interrupts the wait for the download route.
    pub async fn reconcile(
        &self,
        key: &QualifiedName,
        cancel: &CancellationToken,
    ) -> Result<Outcome, Error> {
        let owner = self
            .store
            .get_opt(&self.config.owner, key)
            .await
            .map_err(|source| Error::Owner {
                key: key.clone(),
                source,
            })?;

        match Plan::for_owner(owner) {
            Plan::Converge(_) => self.converge(key, cancel).await,
            Plan::TearDown => self.teardown(key).await,
        }
    }

    async fn converge(
        &self,
        key: &QualifiedName,
        cancel: &CancellationToken,
    ) -> Result<Outcome, Error> {
        log::debug!("{key}: {}", Phase::Rendering);
        let manifest = self.renderer.render(key)?;

        log::debug!("{key}: {}", Phase::Applying);
        let applied = apply::apply(&self.store, manifest.objects())
            .await
            .map_err(Error::Apply)?;

        let sweep = &self.config.sweep;
        let swept = sweep::sweep(&self.store, &sweep.gvk, &sweep.selector, &sweep.predicate())
            .await
            .map_err(Error::Sweep)?;

        log::debug!("{key}: {}", Phase::AwaitingReadiness);
        let route = QualifiedName {
            namespace: key.namespace.clone(),
            name: self.config.route_name.clone(),
        };
        let host = readiness::wait_for_host(
            &self.store,
            &route,
            &self.config.ingress_controller,
            self.config.poll,
            cancel,
        )
        .await?;

        cli_download::upsert(&self.store, &host, key).await?;
        log::info!(
            "{key}: {} ({} objects applied, {swept} swept, host {host})",
            Phase::Derived,
            applied.len()
        );
        Ok(Outcome {
            phase: Phase::Derived,
            applied: applied.len(),
            swept,
            host: Some(host),
        })
    }

    async fn teardown(&self, key: &QualifiedName) -> Result<Outcome, Error> {
        log::info!("{key}: {}", Phase::TearingDown);
        cli_download::teardown(&self.store, key)
            .await
            .map_err(Error::Teardown)?;

        let manifest = self.renderer.render(key)?;
        let deleted = apply::delete_owned(&self.store, manifest.objects(), key)
            .await
            .map_err(Error::Teardown)?;
        log::info!("{key}: {} ({deleted} objects deleted)", Phase::Absent);
        Ok(Outcome {
            phase: Phase::Absent,
            applied: 0,
            swept: 0,
            host: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};

    use super::*;
    use crate::object::gvk;

    #[test]
    fn plan_follows_owner_existence() {
        assert_eq!(Plan::for_owner(None), Plan::TearDown);

        let owner = Object::new(gvk::knative_serving(), "knative-serving");
        assert_eq!(
            Plan::for_owner(Some(owner.clone())),
            Plan::Converge(owner.clone())
        );

        let mut deleting = owner;
        deleting.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
        assert_eq!(Plan::for_owner(Some(deleting)), Plan::TearDown);
    }

    #[test]
    fn readiness_timeouts_are_transient_render_failures_are_not() {
        let timeout = Error::Readiness(readiness::Error::Timeout {
            key: QualifiedName::namespaced("ns", "r"),
            timeout: Duration::from_secs(20),
        });
        assert!(timeout.is_transient());

        let render = Error::Render(manifest::Error::Invalid {
            path: "x.yaml".into(),
            index: 0,
            reason: "no kind".to_owned(),
        });
        assert!(!render.is_transient());

        let conflict = Error::Apply(store::Error::Conflict {
            kind: "Deployment".to_owned(),
            key: QualifiedName::namespaced("ns", "d"),
            message: "stale".to_owned(),
        });
        assert!(conflict.is_transient());
    }
}
