use std::time::Duration;

use envconfig::Envconfig;

use super::Config;

/// Environment variables read by [`Config::from_env`].
#[derive(Envconfig, Debug, Clone)]
pub struct EnvConfig {
    #[envconfig(from = "IMAGE_KN_CLI_ARTIFACTS")]
    pub image: Option<String>,

    #[envconfig(from = "CONSOLECLIDOWNLOAD_MANIFEST_PATH")]
    pub cli_download_manifest: Option<String>,

    #[envconfig(from = "KOURIER_MANIFEST_PATH")]
    pub kourier_manifest: Option<String>,

    #[envconfig(from = "DEFAULT_INGRESS_CONTROLLER", default = "default")]
    pub ingress_controller: String,

    #[envconfig(
        from = "MANAGED_INGRESS_CLASS",
        default = "kourier.ingress.networking.knative.dev"
    )]
    pub managed_ingress_class: String,

    #[envconfig(from = "ROUTE_POLL_INTERVAL_SECS", default = "2")]
    pub poll_interval_secs: u64,

    #[envconfig(from = "ROUTE_POLL_TIMEOUT_SECS", default = "20")]
    pub poll_timeout_secs: u64,

    #[envconfig(from = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,
}

impl From<EnvConfig> for Config {
    fn from(env: EnvConfig) -> Self {
        let mut config = Config::default()
            .with_ingress_controller(env.ingress_controller)
            .with_managed_ingress_class(env.managed_ingress_class)
            .with_poll(
                Duration::from_secs(env.poll_interval_secs),
                Duration::from_secs(env.poll_timeout_secs),
            );
        // ingress objects apply before the download resources
        for path in [env.kourier_manifest, env.cli_download_manifest]
            .into_iter()
            .flatten()
            .filter(|path| !path.is_empty())
        {
            config = config.with_manifest(path);
        }
        config.image = env.image.filter(|image| !image.is_empty());
        config.watch_namespace = env.watch_namespace.filter(|ns| !ns.is_empty());
        config
    }
}
