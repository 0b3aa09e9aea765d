//! Configuration of the deployer binary.
//!
//! The configuration is a YAML file listing the values of every component to
//! deploy. Components without values are skipped, except for the
//! gardener-resource-manager which every managed resource depends on.

use std::{collections::BTreeSet, path::Path, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    components::{cluster_identity, etcd, etcd_druid, istio, nginx_ingress, resource_manager, seed_system},
    Error, Result,
};

/// Environment variable holding the path of the configuration file
pub const ENV_CONFIG: &str = "DEPLOYER_CONFIG";
/// Environment variable overriding [`DeployerConfig::mode`]
pub const ENV_MODE: &str = "DEPLOYER_MODE";
/// Environment variable overriding [`DeployerConfig::listen_addr`]
pub const ENV_LISTEN_ADDR: &str = "DEPLOYER_LISTEN_ADDR";
/// Configuration file used when [`ENV_CONFIG`] is unset
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gardener-deployers/config.yaml";

pub mod defaults {
    /// Namespace of the seed components
    pub fn namespace() -> String {
        "garden".into()
    }
    pub fn listen_addr() -> String {
        "0.0.0.0:8080".into()
    }
    pub fn reconcile_interval_seconds() -> u64 {
        600
    }
}

/// Whether components are rolled out or torn down
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    #[default]
    Deploy,
    Destroy,
}

impl std::str::FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deploy" => Ok(Mode::Deploy),
            "destroy" => Ok(Mode::Destroy),
            other => Err(Error::IllegalConfig(format!(
                "unknown mode {other:?}, expected deploy or destroy"
            ))),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeployerConfig {
    #[serde(default)]
    pub mode: Mode,

    /// Address of the metrics and diagnostics server.
    #[serde(default = "defaults::listen_addr")]
    pub listen_addr: String,

    /// Seconds between two deploy runs.
    #[serde(default = "defaults::reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,

    pub resource_manager: resource_manager::Values,

    #[serde(default)]
    pub etcd_druid: Option<etcd_druid::Values>,

    #[serde(default)]
    pub cluster_identity: Option<cluster_identity::Values>,

    #[serde(default)]
    pub seed_system: Option<seed_system::Values>,

    #[serde(default)]
    pub etcds: Vec<etcd::Values>,

    #[serde(default)]
    pub istio: Option<istio::Values>,

    #[serde(default)]
    pub nginx_ingress: Option<nginx_ingress::Values>,
}

fn require_image(component: &str, image: &str) -> Result<()> {
    if image.trim().is_empty() {
        return Err(Error::IllegalConfig(format!("{component} needs an image")));
    }
    Ok(())
}

impl DeployerConfig {
    /// Load the configuration from [`ENV_CONFIG`] and apply the environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var(ENV_CONFIG).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = Self::from_file(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;

        info!(%path, mode = ?config.mode, "Loaded configuration");
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::IllegalConfig(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(Error::YamlError)
    }

    /// Override settings with the environment variables `lookup` knows about.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(mode) = lookup(ENV_MODE) {
            self.mode = mode.parse()?;
        }
        if let Some(addr) = lookup(ENV_LISTEN_ADDR) {
            self.listen_addr = addr;
        }
        Ok(())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconcile_interval_seconds == 0 {
            return Err(Error::IllegalConfig("reconcileIntervalSeconds must be positive".into()));
        }

        let rm = &self.resource_manager;
        require_image("gardener-resource-manager", &rm.image)?;
        if rm.replicas < 1 {
            return Err(Error::IllegalConfig(
                "gardener-resource-manager needs at least one replica".into(),
            ));
        }

        if let Some(druid) = &self.etcd_druid {
            require_image("etcd-druid", &druid.image)?;
        }

        if !self.etcds.is_empty() && self.etcd_druid.is_none() {
            return Err(Error::IllegalConfig("etcds require etcd-druid to be configured".into()));
        }
        let mut seen = BTreeSet::new();
        for etcd in &self.etcds {
            etcd.validate()?;
            if !seen.insert((etcd.namespace.as_str(), etcd.role.as_str())) {
                return Err(Error::IllegalConfig(format!(
                    "etcd-{} configured twice in namespace {}",
                    etcd.role.as_str(),
                    etcd.namespace
                )));
            }
        }

        if let Some(istio) = &self.istio {
            require_image("istiod", &istio.istiod.image)?;
            for gateway in &istio.ingress_gateways {
                require_image("istio-ingressgateway", &gateway.image)?;
            }
            istio.validate()?;
        }

        if let Some(nginx) = &self.nginx_ingress {
            require_image("nginx-ingress-controller", &nginx.image_controller)?;
            require_image("nginx-ingress-k8s-backend", &nginx.image_default_backend)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    const MINIMAL: &str = indoc! {r#"
        resourceManager:
          image: europe-docker.pkg.dev/gardener-project/releases/gardener/resource-manager:v1.80.0
    "#};

    const FULL: &str = indoc! {r#"
        mode: deploy
        reconcileIntervalSeconds: 300
        resourceManager:
          image: europe-docker.pkg.dev/gardener-project/releases/gardener/resource-manager:v1.80.0
          replicas: 3
        etcdDruid:
          image: europe-docker.pkg.dev/gardener-project/releases/gardener/etcd-druid:v0.22.0
        clusterIdentity:
          identity: seed-aws-eu1
          origin: seed
        seedSystem:
          reserveExcessCapacity:
            enabled: true
        etcds:
        - namespace: shoot--foo--bar
          role: main
          storageCapacity: 25Gi
        - namespace: shoot--foo--bar
          role: events
        istio:
          istiod:
            image: gcr.io/istio-release/pilot:1.19.3-distroless
          ingressGateways:
          - namespace: istio-ingress
            image: gcr.io/istio-release/proxyv2:1.19.3-distroless
        nginxIngress:
          imageController: registry.k8s.io/ingress-nginx/controller:v1.9.4
          imageDefaultBackend: europe-docker.pkg.dev/gardener-project/releases/gardener/ingress-default-backend:0.17.0
    "#};

    #[test]
    fn minimal_config_has_defaults() {
        let config = DeployerConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.mode, Mode::Deploy);
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.reconcile_interval(), Duration::from_secs(600));
        assert_eq!(config.resource_manager.namespace, "garden");
        assert!(config.etcds.is_empty());
        assert!(config.istio.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_config_is_valid() {
        let config = DeployerConfig::from_yaml(FULL).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.etcds.len(), 2);
        assert_eq!(config.etcds[1].role, etcd::Role::Events);
        assert_eq!(config.istio.unwrap().istiod.namespace, "istio-system");
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = DeployerConfig::from_yaml(MINIMAL).unwrap();
        config
            .apply_env(|key| match key {
                ENV_MODE => Some("destroy".into()),
                ENV_LISTEN_ADDR => Some("127.0.0.1:9090".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.mode, Mode::Destroy);
        assert_eq!(config.listen_addr, "127.0.0.1:9090");

        let result = config.apply_env(|key| (key == ENV_MODE).then(|| "upgrade".into()));
        assert!(matches!(result, Err(Error::IllegalConfig(_))));
    }

    #[test]
    fn etcds_need_druid() {
        let mut config = DeployerConfig::from_yaml(FULL).unwrap();
        config.etcd_druid = None;
        assert!(matches!(config.validate(), Err(Error::IllegalConfig(_))));
    }

    #[test]
    fn duplicate_etcds_are_rejected() {
        let mut config = DeployerConfig::from_yaml(FULL).unwrap();
        let duplicate = config.etcds[0].clone();
        config.etcds.push(duplicate);
        assert!(matches!(config.validate(), Err(Error::IllegalConfig(_))));
    }

    #[test]
    fn empty_images_are_rejected() {
        let mut config = DeployerConfig::from_yaml(MINIMAL).unwrap();
        config.resource_manager.image = " ".into();
        assert!(matches!(config.validate(), Err(Error::IllegalConfig(_))));
    }

    #[test]
    fn missing_file_is_reported() {
        let result = DeployerConfig::from_file("/nonexistent/gardener-deployers.yaml");
        assert!(matches!(result, Err(Error::IllegalConfig(msg)) if msg.contains("/nonexistent")));
    }
}
