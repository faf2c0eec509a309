//! kube-convergence keeps a family of rendered manifests converged for every
//! instance of an owner resource, and derives dependent objects from what the
//! cluster reports back.
//!
//! For each owner key the [`reconcile::Reconciler`] renders the configured
//! manifests (namespace injection, image substitution, owner stamping),
//! applies them, sweeps orphaned ingress objects, waits for the download
//! route to be admitted and publishes a `ConsoleCLIDownload` pointing at its
//! host. Deleting the owner tears all of that down again.
//!
//! Alongside, the [`sources::SourceReconciler`] gives every event source
//! deployment a metrics Service and ServiceMonitor.
//!
//! Both are driven by [`run`], which consumes an event stream from
//! [`subscriber`] and keeps at most one pass in flight per key.

pub mod apply;
pub mod cli_download;
pub mod config;
pub use config::Config;
pub mod manifest;
pub mod object;
pub mod readiness;
pub mod reconcile;
pub mod runner;
pub use runner::run;
pub mod sources;
pub mod store;
pub mod subscriber;
pub mod sweep;
