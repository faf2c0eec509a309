use std::sync::Arc;

use anyhow::Context;
use k8s_openapi::api::apps::v1::Deployment;
use kube_client::{Api, Client};
use kube_core::{ApiResource, DynamicObject};
use kube_runtime::watcher;

use kube_convergence::{
    reconcile::Reconciler, sources::SourceReconciler, store::KubeStore, subscriber, Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);
    let client = Client::try_default()
        .await
        .context("failed to create kube client")?;
    let store = KubeStore::new(client.clone());

    let owner_resource = ApiResource::from_gvk(&config.owner);
    let (owners, deployments): (Api<DynamicObject>, Api<Deployment>) =
        match config.watch_namespace.as_deref() {
            Some(namespace) => (
                Api::namespaced_with(client.clone(), namespace, &owner_resource),
                Api::namespaced(client, namespace),
            ),
            None => (Api::all_with(client.clone(), &owner_resource), Api::all(client)),
        };

    // sources may carry their label only in the selector, so every
    // deployment is watched and filtered by the reconciler
    let owner_events = subscriber::with(owners, watcher::Config::default(), owner_resource);
    let deployment_events = subscriber::objects(deployments, watcher::Config::default());

    log::info!(
        "Watching {} owners in {}",
        config.owner.kind,
        config.watch_namespace.as_deref().unwrap_or("all namespaces")
    );
    tokio::join!(
        kube_convergence::run(
            Arc::new(Reconciler::new(store.clone(), Arc::clone(&config))),
            owner_events,
            config.backoff,
        ),
        kube_convergence::run(
            Arc::new(SourceReconciler::new(store)),
            deployment_events,
            config.backoff,
        ),
    );
    Ok(())
}
