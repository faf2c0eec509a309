//! Waiting for a route to be admitted and expose its external host.

use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    object::{gvk, Object, QualifiedName},
    store::{self, ObjectStore},
};

/// Condition type marking an ingress entry as accepted by its controller.
pub const ROUTE_ADMITTED: &str = "Admitted";

/// Shorter intervals are raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polling cadence for [`wait_for_host`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(20),
        }
    }
}

/// The error type returned by [`wait_for_host`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no admitted host on route {key} after {timeout:?}")]
    Timeout { key: QualifiedName, timeout: Duration },
    #[error("cancelled while waiting for route {key}")]
    Cancelled { key: QualifiedName },
    #[error("route {key} has a malformed status: {source}")]
    Malformed {
        key: QualifiedName,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] store::Error),
}

#[derive(Debug, Default, Deserialize)]
struct RouteStatus {
    #[serde(default)]
    ingress: Vec<RouteIngress>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteIngress {
    #[serde(default)]
    host: String,
    #[serde(default)]
    router_name: String,
    #[serde(default)]
    conditions: Vec<RouteIngressCondition>,
}

#[derive(Debug, Deserialize)]
struct RouteIngressCondition {
    #[serde(rename = "type")]
    type_: String,
    status: String,
}

impl RouteIngress {
    fn is_admitted(&self) -> bool {
        self.conditions
            .iter()
            .any(|cond| cond.type_ == ROUTE_ADMITTED && cond.status == "True")
    }
}

/// The host exposed by the ingress entry of `controller`, once that entry
/// has been admitted. Entries of other controllers are never considered.
pub fn canonical_host(route: &Object, controller: &str) -> serde_json::Result<Option<String>> {
    let status = match route.data().get("status") {
        Some(status) if !status.is_null() => RouteStatus::deserialize(status)?,
        _ => RouteStatus::default(),
    };
    Ok(status
        .ingress
        .into_iter()
        .filter(|ingress| ingress.router_name == controller)
        .find(|ingress| ingress.is_admitted() && !ingress.host.is_empty())
        .map(|ingress| ingress.host))
}

/// Polls the route `key` until [`canonical_host`] yields a host.
///
/// The first check happens immediately. A missing route counts as not ready
/// yet; any other store error ends the wait.
pub async fn wait_for_host<S: ObjectStore>(
    store: &S,
    key: &QualifiedName,
    controller: &str,
    poll: PollConfig,
    cancel: &CancellationToken,
) -> Result<String, Error> {
    // a timeout too large to represent never expires
    let deadline = Instant::now().checked_add(poll.timeout);
    let interval = poll.interval.max(MIN_POLL_INTERVAL);
    loop {
        match store.get(&gvk::route(), key).await {
            Ok(route) => {
                let host = canonical_host(&route, controller).map_err(|source| Error::Malformed {
                    key: key.clone(),
                    source,
                })?;
                if let Some(host) = host {
                    log::info!("Route {key} admitted with host {host}");
                    return Ok(host);
                }
                log::debug!("Route {key} has no admitted {controller} ingress yet");
            }
            Err(err) if err.is_not_found() => log::debug!("Route {key} does not exist yet"),
            Err(err) => return Err(err.into()),
        }

        let delay = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout {
                        key: key.clone(),
                        timeout: poll.timeout,
                    });
                }
                interval.min(deadline - now)
            }
            None => interval,
        };
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled { key: key.clone() }),
            () = tokio::time::sleep(delay) => {}
        }
    }
}
