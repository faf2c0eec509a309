use std::{path::PathBuf, time::Duration};

use kube_core::GroupVersionKind;

use crate::{object::gvk, readiness::PollConfig, runner::Backoff, sweep::SweepConfig};

mod env;
pub use env::EnvConfig;

/// Name of the container serving the CLI binaries.
pub const DOWNLOAD_SERVER_CONTAINER: &str = "kn-download-server";
/// Name shared by the download route and the derived download descriptor.
pub const CLI_DOWNLOADS_NAME: &str = "kn-cli-downloads";
/// Ingress controller whose admission is trusted for the download route.
pub const DEFAULT_INGRESS_CONTROLLER: &str = "default";

/// Parameters for the owner and source reconcilers.
///
/// Passed explicitly to every constructor that needs it; there is no
/// process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The type of the owner resource.
    pub owner: GroupVersionKind,
    /// Manifest sources rendered for every owner, one per object group.
    pub manifests: Vec<PathBuf>,
    /// Image substituted into [`image_container`](Self::image_container).
    pub image: Option<String>,
    pub image_container: String,
    /// Route polled for the download host.
    pub route_name: String,
    /// Ingress controller name the admitted predicate accepts.
    pub ingress_controller: String,
    pub poll: PollConfig,
    pub sweep: SweepConfig,
    pub backoff: Backoff,
    /// Restricts the watches to one namespace.
    pub watch_namespace: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            owner: gvk::knative_serving(),
            manifests: Vec::new(),
            image: None,
            image_container: DOWNLOAD_SERVER_CONTAINER.to_owned(),
            route_name: CLI_DOWNLOADS_NAME.to_owned(),
            ingress_controller: DEFAULT_INGRESS_CONTROLLER.to_owned(),
            poll: PollConfig::default(),
            sweep: SweepConfig::default(),
            backoff: Backoff::default(),
            watch_namespace: None,
        }
    }
}

impl Config {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, envconfig::Error> {
        use envconfig::Envconfig;

        Ok(EnvConfig::init_from_env()?.into())
    }

    /// Adds a manifest source.
    pub fn with_manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifests.push(path.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_ingress_controller(mut self, name: impl Into<String>) -> Self {
        self.ingress_controller = name.into();
        self
    }

    pub fn with_managed_ingress_class(mut self, class: impl Into<String>) -> Self {
        self.sweep.managed_class = class.into();
        self
    }

    pub fn with_poll(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll = PollConfig { interval, timeout };
        self
    }
}
