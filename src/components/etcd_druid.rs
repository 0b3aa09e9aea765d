use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, PodSpec, PodTemplateSpec, ResourceRequirements, Service,
            ServicePort, ServiceSpec, ServiceAccount,
        },
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject},
    },
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::{api::ListParams, Api, Client, CustomResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    component::{DeployWaiter, DEFAULT_WAIT_CLEANUP_TIMEOUT, DEFAULT_WAIT_TIMEOUT},
    kubernetes, labels,
    managedresources::{self, Registry},
    meta,
    resources::{Etcd, VerticalPodAutoscaler},
    Error, Result, ANNOTATION_CONFIRM_DELETION, LABEL_ROLE,
};

use super::{min_allowed, quantities, service_account, vertical_pod_autoscaler};

const NAME: &str = "etcd-druid";
const CLUSTER_ROLE_NAME: &str = "gardener.cloud:system:etcd-druid";
const PORT_METRICS: i32 = 8080;
const LABEL_DELETION_PROTECTED: &str = "gardener.cloud/deletion-protected";

/// Settings of etcd-druid
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Values {
    pub image: String,

    #[serde(default = "crate::config::defaults::namespace")]
    pub namespace: String,

    #[serde(default = "defaults::replicas")]
    pub replicas: i32,

    /// Number of concurrent `Etcd` reconciliations.
    #[serde(default = "defaults::workers")]
    pub workers: u32,

    #[serde(default = "defaults::enabled")]
    pub vpa_enabled: bool,
}

mod defaults {
    pub fn replicas() -> i32 {
        1
    }
    pub fn workers() -> u32 {
        50
    }
    pub fn enabled() -> bool {
        true
    }
}

/// Bootstraps etcd-druid, the operator reconciling `Etcd` resources
pub struct EtcdDruid {
    client: Client,
    values: Values,
}

impl EtcdDruid {
    pub fn new(client: Client, values: Values) -> Self {
        Self { client, values }
    }

    fn labels() -> BTreeMap<String, String> {
        labels! { app: NAME, LABEL_ROLE => NAME }
    }

    pub(crate) fn crd() -> CustomResourceDefinition {
        let mut crd = Etcd::crd();
        crd.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(LABEL_DELETION_PROTECTED.into(), "true".into());
        crd
    }

    pub(crate) fn cluster_role(&self) -> ClusterRole {
        let rule = |api_groups: &[&str], resources: &[&str], verbs: &[&str]| PolicyRule {
            api_groups: Some(api_groups.iter().map(|g| g.to_string()).collect()),
            resources: Some(resources.iter().map(|r| r.to_string()).collect()),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        };
        let all = ["get", "list", "watch", "create", "update", "patch", "delete", "deletecollection"];

        ClusterRole {
            metadata: meta! { name: Some(CLUSTER_ROLE_NAME.into()), labels: Some(Self::labels()) },
            rules: Some(vec![
                rule(&[""], &["pods"], &["list", "watch", "delete", "get"]),
                rule(&[""], &["secrets", "endpoints"], &["get", "list", "patch", "update", "watch"]),
                rule(&[""], &["events"], &["create", "get", "list", "watch", "patch", "update"]),
                rule(&[""], &["serviceaccounts", "services", "configmaps"], &all),
                rule(&[""], &["persistentvolumeclaims"], &["get", "list", "watch"]),
                rule(&["rbac.authorization.k8s.io"], &["roles", "rolebindings"], &all),
                rule(&["apps"], &["statefulsets"], &all),
                rule(&["batch"], &["jobs"], &all),
                rule(&["coordination.k8s.io"], &["leases"], &all),
                rule(&["policy"], &["poddisruptionbudgets"], &all),
                rule(&["druid.gardener.cloud"], &["etcds", "etcdcopybackupstasks"], &all),
                rule(
                    &["druid.gardener.cloud"],
                    &["etcds/status", "etcds/finalizers", "etcdcopybackupstasks/status"],
                    &["get", "update", "patch", "create"],
                ),
            ]),

            ..Default::default()
        }
    }

    pub(crate) fn cluster_role_binding(&self) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: meta! { name: Some(CLUSTER_ROLE_NAME.into()), labels: Some(Self::labels()) },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: CLUSTER_ROLE_NAME.into(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".into(),
                name: NAME.into(),
                namespace: Some(self.values.namespace.clone()),
                ..Default::default()
            }]),
        }
    }

    pub(crate) fn service_account(&self) -> ServiceAccount {
        service_account(NAME, &self.values.namespace, Self::labels())
    }

    pub(crate) fn service(&self) -> Service {
        Service {
            metadata: meta! {
                name: Some(NAME.into()),
                namespace: Some(self.values.namespace.clone()),
                labels: Some(Self::labels())
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".into()),
                selector: Some(Self::labels()),
                ports: Some(vec![ServicePort {
                    name: Some("metrics".into()),
                    port: PORT_METRICS,
                    protocol: Some("TCP".into()),
                    target_port: Some(IntOrString::Int(PORT_METRICS)),
                    ..Default::default()
                }]),

                ..Default::default()
            }),
            status: None,
        }
    }

    pub(crate) fn deployment(&self) -> Deployment {
        let labels = Self::labels();
        let workers = self.values.workers;

        Deployment {
            metadata: meta! {
                name: Some(NAME.into()),
                namespace: Some(self.values.namespace.clone()),
                labels: Some(labels.clone())
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.values.replicas),
                revision_history_limit: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    match_expressions: None,
                },
                template: PodTemplateSpec {
                    metadata: Some(meta! { labels: Some(labels) }),
                    spec: Some(PodSpec {
                        service_account_name: Some(NAME.into()),
                        automount_service_account_token: Some(true),
                        priority_class_name: Some("gardener-system-800".into()),
                        containers: vec![Container {
                            name: NAME.into(),
                            image: Some(self.values.image.clone()),
                            image_pull_policy: Some("IfNotPresent".into()),
                            command: Some(vec![
                                "/etcd-druid".into(),
                                "--enable-leader-election=true".into(),
                                "--ignore-operation-annotation=false".into(),
                                "--disable-etcd-serviceaccount-automount=true".into(),
                                format!("--workers={workers}"),
                                format!("--custodian-workers={workers}"),
                                format!("--metrics-addr=:{PORT_METRICS}"),
                            ]),
                            ports: Some(vec![ContainerPort {
                                name: Some("metrics".into()),
                                container_port: PORT_METRICS,
                                protocol: Some("TCP".into()),
                                ..Default::default()
                            }]),
                            resources: Some(ResourceRequirements {
                                requests: Some(quantities(&[("cpu", "50m"), ("memory", "128Mi")])),
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

    pub(crate) fn vpa(&self) -> VerticalPodAutoscaler {
        vertical_pod_autoscaler(
            &format!("{NAME}-vpa"),
            &self.values.namespace,
            "Deployment",
            NAME,
            vec![min_allowed(NAME, &[("memory", "100M")])],
        )
    }

    pub(crate) fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::new();
        registry.add(&Self::crd())?;
        registry.add(&self.service_account())?;
        registry.add(&self.cluster_role())?;
        registry.add(&self.cluster_role_binding())?;
        registry.add(&self.service())?;
        registry.add(&self.deployment())?;
        if self.values.vpa_enabled {
            registry.add(&self.vpa())?;
        }
        Ok(registry)
    }

    /// Number of `Etcd` resources in the cluster; zero when their CRD is not installed.
    async fn count_etcds(&self) -> Result<usize> {
        let etcds = Api::<Etcd>::all(self.client.clone());
        match etcds.list(&ListParams::default()).await {
            Ok(list) => Ok(list.items.len()),
            Err(e) if kubernetes::is_not_found(&e) => Ok(0),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn confirm_crd_deletion(&self) -> Result<()> {
        let crds = Api::<CustomResourceDefinition>::all(self.client.clone());
        let name = Self::crd().metadata.name.unwrap_or_default();

        match kubernetes::annotate(&crds, &name, &[(ANNOTATION_CONFIRM_DELETION, "true")]).await {
            Err(e) if e.is_not_found() => {
                warn!(crd = %name, "CRD not installed, skipping deletion confirmation");
                Ok(())
            }
            other => other,
        }
    }
}

#[async_trait]
impl DeployWaiter for EtcdDruid {
    fn name(&self) -> &str {
        NAME
    }

    async fn deploy(&self) -> Result<(), Error> {
        let data = self.registry()?.serialized_objects();
        managedresources::create_for_seed(self.client.clone(), &self.values.namespace, NAME, false, data).await
    }

    async fn destroy(&self) -> Result<(), Error> {
        let count = self.count_etcds().await?;
        if count > 0 {
            return Err(Error::EtcdsStillExist(count));
        }

        self.confirm_crd_deletion().await?;
        info!(namespace = %self.values.namespace, "Destroying etcd-druid");
        managedresources::delete(self.client.clone(), &self.values.namespace, NAME).await
    }

    async fn wait(&self) -> Result<(), Error> {
        managedresources::wait_until_healthy(
            self.client.clone(),
            &self.values.namespace,
            NAME,
            DEFAULT_WAIT_TIMEOUT,
        )
        .await
    }

    async fn wait_cleanup(&self) -> Result<(), Error> {
        managedresources::wait_until_deleted(
            self.client.clone(),
            &self.values.namespace,
            NAME,
            DEFAULT_WAIT_CLEANUP_TIMEOUT,
        )
        .await
    }
}
