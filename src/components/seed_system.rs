use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec, ResourceRequirements},
        scheduling::v1::PriorityClass,
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::LabelSelector},
};
use kube::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    component::{DeployWaiter, DEFAULT_WAIT_CLEANUP_TIMEOUT, DEFAULT_WAIT_TIMEOUT},
    labels,
    managedresources::{self, Registry},
    meta, Error, Result, LABEL_ROLE,
};

const MANAGED_RESOURCE_NAME: &str = "system";
const RESERVE_EXCESS_CAPACITY: &str = "reserve-excess-capacity";
/// Priority class of the placeholder pods, below every real workload
pub const PRIORITY_CLASS_NAME: &str = "gardener-reserve-excess-capacity";
const PRIORITY_CLASS_VALUE: i32 = -5;

/// Settings of the excess capacity reservation
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReserveExcessCapacity {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "defaults::pause_image")]
    pub image: String,

    #[serde(default = "defaults::replicas")]
    pub replicas: i32,

    /// Requests (and limits) of every placeholder pod.
    #[serde(default = "defaults::resources")]
    pub resources: BTreeMap<String, String>,
}

/// Settings of the seed system resources
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Values {
    #[serde(default = "crate::config::defaults::namespace")]
    pub namespace: String,

    #[serde(default)]
    pub reserve_excess_capacity: ReserveExcessCapacity,
}

impl Default for ReserveExcessCapacity {
    fn default() -> Self {
        Self {
            enabled: false,
            image: defaults::pause_image(),
            replicas: defaults::replicas(),
            resources: defaults::resources(),
        }
    }
}

mod defaults {
    use std::collections::BTreeMap;

    pub fn pause_image() -> String {
        "registry.k8s.io/pause:3.9".into()
    }
    pub fn replicas() -> i32 {
        2
    }
    pub fn resources() -> BTreeMap<String, String> {
        BTreeMap::from([("cpu".into(), "2".into()), ("memory".into(), "6Gi".into())])
    }
}

/// Deploys system resources every seed needs through a managed resource
pub struct SeedSystem {
    client: Client,
    values: Values,
}

impl SeedSystem {
    pub fn new(client: Client, values: Values) -> Self {
        Self { client, values }
    }

    pub(crate) fn priority_class(&self) -> PriorityClass {
        PriorityClass {
            metadata: meta! { name: Some(PRIORITY_CLASS_NAME.into()) },
            value: PRIORITY_CLASS_VALUE,
            global_default: Some(false),
            description: Some(
                "This class is used to reserve excess resource capacity on a cluster".into(),
            ),

            ..Default::default()
        }
    }

    pub(crate) fn reserve_excess_capacity_deployment(&self) -> Deployment {
        let reserve = &self.values.reserve_excess_capacity;
        let labels = labels! { app: RESERVE_EXCESS_CAPACITY, LABEL_ROLE => RESERVE_EXCESS_CAPACITY };
        let resources: BTreeMap<String, Quantity> = reserve
            .resources
            .iter()
            .map(|(name, value)| (name.clone(), Quantity(value.clone())))
            .collect();

        Deployment {
            metadata: meta! {
                name: Some(RESERVE_EXCESS_CAPACITY.into()),
                namespace: Some(self.values.namespace.clone()),
                labels: Some(labels.clone())
            },
            spec: Some(DeploymentSpec {
                replicas: Some(reserve.replicas),
                revision_history_limit: Some(2),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    match_expressions: None,
                },
                template: PodTemplateSpec {
                    metadata: Some(meta! { labels: Some(labels) }),
                    spec: Some(PodSpec {
                        termination_grace_period_seconds: Some(5),
                        priority_class_name: Some(PRIORITY_CLASS_NAME.into()),
                        containers: vec![Container {
                            name: "pause-container".into(),
                            image: Some(reserve.image.clone()),
                            image_pull_policy: Some("IfNotPresent".into()),
                            resources: Some(ResourceRequirements {
                                requests: Some(resources.clone()),
                                limits: Some(resources),
                                ..Default::default()
                            }),

                            ..Default::default()
                        }],

                        ..Default::default()
                    }),
                },

                ..Default::default()
            }),
            status: None,
        }
    }

    pub(crate) fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::new();
        registry.add(&self.priority_class())?;
        if self.values.reserve_excess_capacity.enabled {
            registry.add(&self.reserve_excess_capacity_deployment())?;
        }
        Ok(registry)
    }
}

#[async_trait]
impl DeployWaiter for SeedSystem {
    fn name(&self) -> &str {
        "seed-system"
    }

    async fn deploy(&self) -> Result<(), Error> {
        let data = self.registry()?.serialized_objects();
        managedresources::create_for_seed(
            self.client.clone(),
            &self.values.namespace,
            MANAGED_RESOURCE_NAME,
            false,
            data,
        )
        .await
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
    use super::*;
    use crate::fixtures::ApiServerVerifier;

    fn component(enabled: bool) -> SeedSystem {
        let (client, _) = ApiServerVerifier::new();
        SeedSystem::new(
            client,
            Values {
                namespace: "garden".into(),
                reserve_excess_capacity: ReserveExcessCapacity {
                    enabled,
                    ..Default::default()
                },
            },
        )
    }

    #[tokio::test]
    async fn disabled_reservation_only_ships_the_priority_class() {
        let registry = component(false).registry().unwrap();
        let keys: Vec<_> = registry.serialized_objects().into_keys().collect();
        assert_eq!(keys, vec!["priorityclass____gardener-reserve-excess-capacity.yaml"]);
    }

    #[tokio::test]
    async fn enabled_reservation_ships_pause_pods() {
        let component = component(true);
        let registry = component.registry().unwrap();
        let keys: Vec<_> = registry.serialized_objects().into_keys().collect();
        assert_eq!(
            keys,
            vec![
                "deployment__garden__reserve-excess-capacity.yaml",
                "priorityclass____gardener-reserve-excess-capacity.yaml",
            ]
        );

        let deployment = component.reserve_excess_capacity_deployment();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.priority_class_name.as_deref(), Some(PRIORITY_CLASS_NAME));
        assert_eq!(pod.termination_grace_period_seconds, Some(5));
        let requests = pod.containers[0].resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests["memory"], Quantity("6Gi".into()));
    }

    #[tokio::test]
    async fn priority_class_is_below_everything() {
        let class = component(false).priority_class();
        assert_eq!(class.value, -5);
        assert_eq!(class.global_default, Some(false));
    }
}
