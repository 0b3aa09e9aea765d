use async_trait::async_trait;
use indoc::{formatdoc, indoc};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment},
        core::v1::{
            Affinity, Container, ContainerPort, HTTPGetAction, PodAffinityTerm, PodAntiAffinity,
            PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Service, ServiceAccount,
            ServicePort, ServiceSpec, WeightedPodAffinityTerm,
        },
        policy::v1::PodDisruptionBudget,
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::{Api, Client};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::try_join;
use tracing::info;

use crate::{
    component::{DeployWaiter, LoggingComponent, DEFAULT_WAIT_CLEANUP_TIMEOUT, DEFAULT_WAIT_TIMEOUT},
    health, kubernetes, labels,
    managedresources::{self, POLL_INTERVAL},
    meta,
    resources::VerticalPodAutoscaler,
    retry::{self, Outcome},
    Error, Result, LABEL_ROLE,
};

use super::{min_allowed, pod_disruption_budget, quantities, service_account, vertical_pod_autoscaler};

const NAME: &str = "gardener-resource-manager";
const PORT_METRICS: i32 = 8080;
const PORT_HEALTH: i32 = 8081;

/// Settings of the gardener-resource-manager
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Values {
    pub image: String,

    #[serde(default = "crate::config::defaults::namespace")]
    pub namespace: String,

    #[serde(default = "defaults::replicas")]
    pub replicas: i32,

    #[serde(default = "defaults::max_concurrent_workers")]
    pub max_concurrent_workers: u32,

    /// Interval in which managed resources are re-applied, e.g. `1m`.
    #[serde(default = "defaults::sync_period")]
    pub sync_period: String,

    /// Interval in which the health of applied objects is checked, e.g. `1m`.
    #[serde(default = "defaults::sync_period")]
    pub health_sync_period: String,

    /// Only watch managed resources in this namespace; all namespaces when absent.
    #[serde(default)]
    pub watched_namespace: Option<String>,

    /// Re-apply objects on every sync, even without changes.
    #[serde(default)]
    pub always_update: bool,

    /// Only reconcile managed resources of this class.
    #[serde(default)]
    pub resource_class: Option<String>,

    #[serde(default)]
    pub priority_class_name: Option<String>,

    #[serde(default = "defaults::enabled")]
    pub vpa_enabled: bool,

    #[serde(default)]
    pub leader_election: LeaderElection,
}

/// Lease settings of the leader election
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElection {
    pub lease_duration: String,
    pub renew_deadline: String,
    pub retry_period: String,
}

impl Default for LeaderElection {
    fn default() -> Self {
        Self {
            lease_duration: "15s".into(),
            renew_deadline: "10s".into(),
            retry_period: "2s".into(),
        }
    }
}

mod defaults {
    pub fn replicas() -> i32 {
        2
    }
    pub fn max_concurrent_workers() -> u32 {
        10
    }
    pub fn sync_period() -> String {
        "1m".into()
    }
    pub fn enabled() -> bool {
        true
    }
}

/// Deploys the gardener-resource-manager.
///
/// The resource manager is the controller reconciling `ManagedResource`s, so it
/// cannot be deployed through one and its objects are applied directly.
pub struct ResourceManager {
    client: Client,
    values: Values,
}

impl ResourceManager {
    pub fn new(client: Client, values: Values) -> Self {
        Self { client, values }
    }

    fn labels(&self) -> std::collections::BTreeMap<String, String> {
        labels! { app: NAME, LABEL_ROLE => "resource-manager" }
    }

    /// Command line of the resource manager container
    pub(crate) fn command(&self) -> Vec<String> {
        let values = &self.values;
        let election = &values.leader_election;

        let mut command = vec![
            "/gardener-resource-manager".to_string(),
            "--leader-election=true".into(),
            format!("--leader-election-namespace={}", values.namespace),
            format!("--leader-election-lease-duration={}", election.lease_duration),
            format!("--leader-election-renew-deadline={}", election.renew_deadline),
            format!("--leader-election-retry-period={}", election.retry_period),
            format!("--max-concurrent-workers={}", values.max_concurrent_workers),
            format!("--sync-period={}", values.sync_period),
            format!("--health-sync-period={}", values.health_sync_period),
            format!("--metrics-bind-address=:{PORT_METRICS}"),
            format!("--health-bind-address=:{PORT_HEALTH}"),
        ];
        if let Some(namespace) = &values.watched_namespace {
            command.push(format!("--namespace={namespace}"));
        }
        if let Some(class) = &values.resource_class {
            command.push(format!("--resource-class={class}"));
        }
        if values.always_update {
            command.push("--always-update=true".into());
        }

        command
    }

    pub(crate) fn service_account(&self) -> ServiceAccount {
        service_account(NAME, &self.values.namespace, self.labels())
    }

    fn policy_rules() -> Vec<PolicyRule> {
        vec![PolicyRule {
            api_groups: Some(vec!["*".into()]),
            resources: Some(vec!["*".into()]),
            verbs: vec!["*".into()],
            ..Default::default()
        }]
    }

    fn subjects(&self) -> Vec<Subject> {
        vec![Subject {
            kind: "ServiceAccount".into(),
            name: NAME.into(),
            namespace: Some(self.values.namespace.clone()),
            ..Default::default()
        }]
    }

    pub(crate) fn cluster_role(&self) -> ClusterRole {
        ClusterRole {
            metadata: meta! { name: Some(format!("gardener.cloud:{NAME}")), labels: Some(self.labels()) },
            rules: Some(Self::policy_rules()),
            ..Default::default()
        }
    }

    pub(crate) fn cluster_role_binding(&self) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: meta! { name: Some(format!("gardener.cloud:{NAME}")), labels: Some(self.labels()) },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: format!("gardener.cloud:{NAME}"),
            },
            subjects: Some(self.subjects()),
        }
    }

    pub(crate) fn role(&self, namespace: &str) -> Role {
        Role {
            metadata: meta! {
                name: Some(NAME.into()),
                namespace: Some(namespace.into()),
                labels: Some(self.labels())
            },
            rules: Some(Self::policy_rules()),
        }
    }

    pub(crate) fn role_binding(&self, namespace: &str) -> RoleBinding {
        RoleBinding {
            metadata: meta! {
                name: Some(NAME.into()),
                namespace: Some(namespace.into()),
                labels: Some(self.labels())
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "Role".into(),
                name: NAME.into(),
            },
            subjects: Some(self.subjects()),
        }
    }

    pub(crate) fn service(&self) -> Service {
        let ports = [("metrics", PORT_METRICS), ("health", PORT_HEALTH)];

        Service {
            metadata: meta! {
                name: Some(NAME.into()),
                namespace: Some(self.values.namespace.clone()),
                labels: Some(self.labels())
            },
            spec: Some(ServiceSpec {
                selector: Some(self.labels()),
                ports: Some(
                    ports
                        .into_iter()
                        .map(|(name, port)| ServicePort {
                            name: Some(name.into()),
                            port,
                            protocol: Some("TCP".into()),
                            target_port: Some(IntOrString::Int(port)),
                            ..Default::default()
                        })
                        .collect(),
                ),

                ..Default::default()
            }),
            status: None,
        }
    }

    pub(crate) fn deployment(&self) -> Deployment {
        let labels = self.labels();
        let probe = |path: &str| Probe {
            http_get: Some(HTTPGetAction {
                path: Some(path.into()),
                port: IntOrString::Int(PORT_HEALTH),
                scheme: Some("HTTP".into()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(10),
            timeout_seconds: Some(5),
            failure_threshold: Some(3),
            ..Default::default()
        };

        Deployment {
            metadata: meta! {
                name: Some(NAME.into()),
                namespace: Some(self.values.namespace.clone()),
                labels: Some(labels.clone())
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.values.replicas),
                revision_history_limit: Some(2),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    match_expressions: None,
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".into()),
                    rolling_update: Some(RollingUpdateDeployment {
                        max_surge: Some(IntOrString::Int(1)),
                        max_unavailable: Some(IntOrString::Int(0)),
                    }),
                }),
                template: PodTemplateSpec {
                    metadata: Some(meta! { labels: Some(labels.clone()) }),
                    spec: Some(PodSpec {
                        service_account_name: Some(NAME.into()),
                        automount_service_account_token: Some(true),
                        priority_class_name: self.values.priority_class_name.clone(),
                        affinity: Some(Affinity {
                            pod_anti_affinity: Some(PodAntiAffinity {
                                preferred_during_scheduling_ignored_during_execution: Some(vec![
                                    WeightedPodAffinityTerm {
                                        weight: 100,
                                        pod_affinity_term: PodAffinityTerm {
                                            topology_key: "kubernetes.io/hostname".into(),
                                            label_selector: Some(LabelSelector {
                                                match_labels: Some(labels),
                                                match_expressions: None,
                                            }),
                                            ..Default::default()
                                        },
                                    },
                                ]),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        containers: vec![Container {
                            name: NAME.into(),
                            image: Some(self.values.image.clone()),
                            image_pull_policy: Some("IfNotPresent".into()),
                            command: Some(self.command()),
                            ports: Some(
                                [("metrics", PORT_METRICS), ("health", PORT_HEALTH)]
                                    .into_iter()
                                    .map(|(name, port)| ContainerPort {
                                        name: Some(name.into()),
                                        container_port: port,
                                        protocol: Some("TCP".into()),
                                        ..Default::default()
                                    })
                                    .collect(),
                            ),
                            liveness_probe: Some(probe("/healthz")),
                            readiness_probe: Some(probe("/readyz")),
                            resources: Some(ResourceRequirements {
                                requests: Some(quantities(&[("cpu", "23m"), ("memory", "47Mi")])),
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
            vec![min_allowed(NAME, &[("memory", "30M")])],
        )
    }

    pub(crate) fn pdb(&self) -> PodDisruptionBudget {
        pod_disruption_budget(NAME, &self.values.namespace, self.labels())
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &self.values.namespace)
    }

    async fn deploy_rbac(&self) -> Result<()> {
        match &self.values.watched_namespace {
            Some(namespace) => {
                let roles = Api::<Role>::namespaced(self.client.clone(), namespace);
                let bindings = Api::<RoleBinding>::namespaced(self.client.clone(), namespace);
                kubernetes::apply(&roles, &self.role(namespace)).await?;
                kubernetes::apply(&bindings, &self.role_binding(namespace)).await?;
            }
            None => {
                let roles = Api::<ClusterRole>::all(self.client.clone());
                let bindings = Api::<ClusterRoleBinding>::all(self.client.clone());
                kubernetes::apply(&roles, &self.cluster_role()).await?;
                kubernetes::apply(&bindings, &self.cluster_role_binding()).await?;
            }
        }
        Ok(())
    }

    async fn deploy_autoscaling(&self) -> Result<()> {
        let vpas = self.api::<VerticalPodAutoscaler>();
        if self.values.vpa_enabled {
            kubernetes::apply(&vpas, &self.vpa()).await?;
        } else {
            kubernetes::delete_if_exists(&vpas, &format!("{NAME}-vpa")).await?;
        }

        let pdbs = self.api::<PodDisruptionBudget>();
        if self.values.replicas > 1 {
            kubernetes::apply(&pdbs, &self.pdb()).await?;
        } else {
            kubernetes::delete_if_exists(&pdbs, NAME).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DeployWaiter for ResourceManager {
    fn name(&self) -> &str {
        NAME
    }

    async fn deploy(&self) -> Result<(), Error> {
        info!(namespace = %self.values.namespace, replicas = self.values.replicas, "Deploying gardener-resource-manager");

        // Everything the deployment refers to goes first
        try_join!(
            async { kubernetes::apply(&self.api::<ServiceAccount>(), &self.service_account()).await.map(|_| ()) },
            async { kubernetes::apply(&self.api::<Service>(), &self.service()).await.map(|_| ()) },
            self.deploy_rbac(),
        )?;

        kubernetes::apply(&self.api::<Deployment>(), &self.deployment()).await?;
        self.deploy_autoscaling().await
    }

    async fn destroy(&self) -> Result<(), Error> {
        let namespace = &self.values.namespace;
        info!(%namespace, "Destroying gardener-resource-manager");

        kubernetes::delete_if_exists(&self.api::<VerticalPodAutoscaler>(), &format!("{NAME}-vpa")).await?;
        kubernetes::delete_if_exists(&self.api::<PodDisruptionBudget>(), NAME).await?;
        kubernetes::delete_if_exists(&self.api::<Deployment>(), NAME).await?;
        kubernetes::delete_if_exists(&self.api::<Service>(), NAME).await?;
        kubernetes::delete_if_exists(&self.api::<ServiceAccount>(), NAME).await?;

        match &self.values.watched_namespace {
            Some(watched) => {
                kubernetes::delete_if_exists(&Api::<RoleBinding>::namespaced(self.client.clone(), watched), NAME).await?;
                kubernetes::delete_if_exists(&Api::<Role>::namespaced(self.client.clone(), watched), NAME).await
            }
            None => {
                let name = format!("gardener.cloud:{NAME}");
                kubernetes::delete_if_exists(&Api::<ClusterRoleBinding>::all(self.client.clone()), &name).await?;
                kubernetes::delete_if_exists(&Api::<ClusterRole>::all(self.client.clone()), &name).await
            }
        }
    }

    async fn wait(&self) -> Result<(), Error> {
        let deployments = self.api::<Deployment>();
        let what = format!("deployment {}/{NAME}", self.values.namespace);

        retry::until_timeout(POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT, what.clone(), || {
            let deployments = deployments.clone();
            let what = what.clone();
            async move {
                match kubernetes::get_if_exists(&deployments, NAME).await {
                    Ok(Some(deployment)) => Outcome::retry_on_error(
                        health::check_deployment(&deployment)
                            .map_err(|e| Error::Unhealthy(what, e.to_string())),
                    ),
                    Ok(None) => Outcome::Retry(Error::Unhealthy(what, "not found".into())),
                    Err(e) => Outcome::Retry(e),
                }
            }
        })
        .await
    }

    async fn wait_cleanup(&self) -> Result<(), Error> {
        managedresources::wait_until_gone::<Deployment>(
            self.client.clone(),
            &self.values.namespace,
            NAME,
            DEFAULT_WAIT_CLEANUP_TIMEOUT,
        )
        .await
    }
}

impl LoggingComponent for ResourceManager {
    fn logging_parsers(&self) -> String {
        indoc! {r#"
            [PARSER]
                Name        gardenerResourceManagerParser
                Format      json
                Time_Key    ts
                Time_Format %Y-%m-%dT%H:%M:%S.%L
        "#}
        .to_string()
    }

    fn logging_filters(&self) -> String {
        formatdoc! {r#"
            [FILTER]
                Name                parser
                Match               kubernetes.*{NAME}*{NAME}*
                Key_Name            log
                Parser              gardenerResourceManagerParser
                Reserve_Data        True
        "#}
    }
}
