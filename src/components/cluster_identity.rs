use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    component::{DeployWaiter, DEFAULT_WAIT_CLEANUP_TIMEOUT, DEFAULT_WAIT_TIMEOUT},
    kubernetes,
    managedresources::{self, Registry},
    meta, Error, Result,
};

/// Name of the config map holding the identity
pub const CONFIG_MAP_NAME: &str = "cluster-identity";
/// Namespace of the identity config map in the target cluster
pub const CONFIG_MAP_NAMESPACE: &str = "kube-system";
const MANAGED_RESOURCE_NAME: &str = "cluster-identity";

/// Who created the identity of a cluster
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    #[default]
    Seed,
    Shoot,
    Gardener,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Seed => "seed",
            Origin::Shoot => "shoot",
            Origin::Gardener => "gardener",
        }
    }
}

/// Which resource manager applies the identity
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ApplyVia {
    /// The resource manager of the seed, writing into the seed itself.
    #[default]
    ManagedResourceSeed,

    /// The resource manager of a shoot control plane, writing into the shoot.
    ManagedResourceShoot,
}

/// Settings of the cluster identity
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Values {
    /// Namespace holding the managed resource.
    #[serde(default = "crate::config::defaults::namespace")]
    pub namespace: String,

    /// The identity; when absent the deployed one is kept, or a random one generated.
    #[serde(default)]
    pub identity: Option<String>,

    #[serde(default)]
    pub origin: Origin,

    #[serde(default)]
    pub apply_via: ApplyVia,
}

/// Deploys the `cluster-identity` config map through a managed resource
pub struct ClusterIdentity {
    client: Client,
    values: Values,
}

impl ClusterIdentity {
    pub fn new(client: Client, values: Values) -> Self {
        Self { client, values }
    }

    /// The identity to write into the target cluster.
    ///
    /// The config map is immutable, so an identity that was deployed before is
    /// kept: first the one in `kube-system` when the seed is the target, then
    /// the one stored in the managed resource secret. Only a cluster without
    /// either gets a fresh one.
    pub async fn identity(&self) -> Result<String> {
        if let Some(identity) = &self.values.identity {
            return Ok(identity.clone());
        }

        if self.values.apply_via == ApplyVia::ManagedResourceSeed {
            let config_maps = Api::<ConfigMap>::namespaced(self.client.clone(), CONFIG_MAP_NAMESPACE);
            if let Some(identity) = kubernetes::get_if_exists(&config_maps, CONFIG_MAP_NAME)
                .await?
                .and_then(|cm| identity_of(&cm))
            {
                return Ok(identity);
            }
        }

        let secrets = Api::<Secret>::namespaced(self.client.clone(), &self.values.namespace);
        let secret = kubernetes::get_if_exists(&secrets, &managedresources::secret_name(MANAGED_RESOURCE_NAME)).await?;
        if let Some(identity) = secret.as_ref().and_then(identity_in_secret) {
            return Ok(identity);
        }

        let identity = uuid::Uuid::new_v4().to_string();
        info!(%identity, "Generated new cluster identity");
        Ok(identity)
    }

    pub(crate) fn config_map(&self, identity: &str) -> ConfigMap {
        ConfigMap {
            metadata: meta! {
                name: Some(CONFIG_MAP_NAME.into()),
                namespace: Some(CONFIG_MAP_NAMESPACE.into())
            },
            data: Some(BTreeMap::from([
                (CONFIG_MAP_NAME.into(), identity.to_string()),
                ("origin".into(), self.values.origin.as_str().into()),
            ])),
            immutable: Some(true),

            ..Default::default()
        }
    }
}

fn identity_of(config_map: &ConfigMap) -> Option<String> {
    config_map.data.as_ref()?.get(CONFIG_MAP_NAME).cloned()
}

/// The identity in the config map serialized into a managed resource secret
fn identity_in_secret(secret: &Secret) -> Option<String> {
    let key = format!("configmap__{CONFIG_MAP_NAMESPACE}__{CONFIG_MAP_NAME}.yaml");
    let manifest = secret.data.as_ref()?.get(&key)?;
    let config_map: ConfigMap = serde_yaml::from_slice(&manifest.0).ok()?;
    identity_of(&config_map)
}

#[async_trait]
impl DeployWaiter for ClusterIdentity {
    fn name(&self) -> &str {
        "cluster-identity"
    }

    async fn deploy(&self) -> Result<(), Error> {
        let identity = self.identity().await?;
        let mut registry = Registry::new();
        registry.add(&self.config_map(&identity))?;
        let data = registry.serialized_objects();

        info!(%identity, origin = self.values.origin.as_str(), "Deploying cluster identity");
        match self.values.apply_via {
            ApplyVia::ManagedResourceSeed => {
                managedresources::create_for_seed(
                    self.client.clone(),
                    &self.values.namespace,
                    MANAGED_RESOURCE_NAME,
                    false,
                    data,
                )
                .await
            }
            ApplyVia::ManagedResourceShoot => {
                managedresources::create_for_shoot(
                    self.client.clone(),
                    &self.values.namespace,
                    MANAGED_RESOURCE_NAME,
                    managedresources::ORIGIN_GARDENER,
                    false,
                    data,
                )
                .await
            }
        }
    }

    async fn destroy(&self) -> Result<(), Error> {
        managedresources::delete(self.client.clone(), &self.values.namespace, MANAGED_RESOURCE_NAME).await
    }

    async fn wait(&self) -> Result<(), Error> {
        managedresources::wait_until_healthy(
            self.client.clone(),
            &self.values.namespace,
            MANAGED_RESOURCE_NAME,
            DEFAULT_WAIT_TIMEOUT,
        )
        .await
    }

    async fn wait_cleanup(&self) -> Result<(), Error> {
        managedresources::wait_until_deleted(
            self.client.clone(),
            &self.values.namespace,
            MANAGED_RESOURCE_NAME,
            DEFAULT_WAIT_CLEANUP_TIMEOUT,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::fixtures::{timeout_after_1s, ApiServerVerifier, Scenario};

    fn values(identity: Option<&str>, origin: Origin) -> Values {
        Values {
            namespace: "garden".into(),
            identity: identity.map(Into::into),
            origin,
            apply_via: ApplyVia::ManagedResourceSeed,
        }
    }

    #[tokio::test]
    async fn config_map_is_immutable_and_carries_origin() {
        let (client, _) = ApiServerVerifier::new();
        let component = ClusterIdentity::new(client, values(Some("seed-foo"), Origin::Seed));

        assert_json_diff::assert_json_eq!(
            serde_json::to_value(component.config_map("seed-foo")).unwrap(),
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": "cluster-identity", "namespace": "kube-system" },
                "immutable": true,
                "data": { "cluster-identity": "seed-foo", "origin": "seed" },
            })
        );
    }

    #[tokio::test]
    async fn missing_identity_is_generated() {
        let (client, fakeserver) = ApiServerVerifier::new();
        let mocksrv = fakeserver.run(Scenario::ClusterIdentityMissing {
            namespace: "garden".into(),
        });

        let component = ClusterIdentity::new(client, values(None, Origin::Gardener));
        let identity = component.identity().await.unwrap();
        assert!(uuid::Uuid::parse_str(&identity).is_ok());
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn deployed_identity_is_kept() {
        let (client, fakeserver) = ApiServerVerifier::new();
        let mocksrv = fakeserver.run(Scenario::ClusterIdentityKept {
            namespace: "garden".into(),
            identity: "4cd78b64-0a8e-4f6b-9d0c-4c1e8a3b5f21".into(),
        });

        let component = ClusterIdentity::new(client, values(None, Origin::Seed));
        component.deploy().await.unwrap();
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn identity_is_read_back_from_managed_resource_secret() {
        let (client, _) = ApiServerVerifier::new();
        let component = ClusterIdentity::new(client, values(None, Origin::Shoot));

        let mut registry = Registry::new();
        registry.add(&component.config_map("shoot-identity")).unwrap();
        let secret = managedresources::Builder::new("garden", MANAGED_RESOURCE_NAME)
            .build_secret(registry.serialized_objects());
        assert_eq!(identity_in_secret(&secret).as_deref(), Some("shoot-identity"));

        assert_eq!(identity_in_secret(&Secret::default()), None);
    }

    #[test]
    fn apply_via_is_camel_case() {
        let values: Values = serde_yaml::from_str("applyVia: managedResourceShoot").unwrap();
        assert_eq!(values.apply_via, ApplyVia::ManagedResourceShoot);
        assert!(serde_yaml::from_str::<Values>("applyVia: ManagedResourceShoot").is_err());
    }

    #[tokio::test]
    async fn deploy_creates_seed_managed_resource() {
        let (client, fakeserver) = ApiServerVerifier::new();
        let mocksrv = fakeserver.run(Scenario::ManagedResourceApplied {
            namespace: "garden".into(),
            name: "cluster-identity".into(),
        });

        let component = ClusterIdentity::new(client, values(Some("seed-foo"), Origin::Seed));
        component.deploy().await.unwrap();
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn destroy_deletes_managed_resource() {
        let (client, fakeserver) = ApiServerVerifier::new();
        let mocksrv = fakeserver.run(Scenario::ManagedResourceDeleted {
            namespace: "garden".into(),
            name: "cluster-identity".into(),
        });

        let component = ClusterIdentity::new(client, values(Some("seed-foo"), Origin::Seed));
        component.destroy().await.unwrap();
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test(start_paused = true)]
    async fn wait_cleanup_returns_once_managed_resource_is_gone() {
        let (client, fakeserver) = ApiServerVerifier::new();
        let mocksrv = fakeserver.run(Scenario::ManagedResourceDeletedAfterPolls {
            namespace: "garden".into(),
            name: "cluster-identity".into(),
            polls: 2,
        });

        let component = ClusterIdentity::new(client, values(Some("seed-foo"), Origin::Seed));
        component.wait_cleanup().await.unwrap();
        timeout_after_1s(mocksrv).await;
    }
}
