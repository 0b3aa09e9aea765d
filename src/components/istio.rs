//! Deploys istiod and any number of ingress gateways.
//!
//! istiod and every gateway live in namespaces of their own, each holding a
//! separate managed resource. Those namespaces have to exist before the managed
//! resources can be stored in them, so they are applied directly first and
//! additionally kept in sync through the managed resources.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::try_join_all;
use indoc::formatdoc;
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        autoscaling::v2::{
            CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
            MetricSpec, MetricTarget, ResourceMetricSource,
        },
        core::v1::{
            Affinity, ConfigMap, Container, ContainerPort, HTTPGetAction, Namespace, NodeAffinity,
            NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodSpec, PodTemplateSpec, Probe,
            ResourceRequirements, Service, ServicePort, ServiceSpec,
        },
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::{Api, Client};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    component::{DeployWaiter, DEFAULT_WAIT_CLEANUP_TIMEOUT, DEFAULT_WAIT_TIMEOUT},
    kubernetes, labels,
    managedresources::{self, Registry},
    meta, Error, Result, LABEL_ROLE,
};

use super::{env, field_env, pod_disruption_budget, quantities, service_account};

const MANAGED_RESOURCE_ISTIOD: &str = "istio";
const MANAGED_RESOURCE_INGRESS: &str = "istio-ingress";
const ISTIOD: &str = "istiod";
const INGRESS_GATEWAY: &str = "istio-ingressgateway";
const PORT_STATUS: i32 = 15021;

/// Settings of the istio control plane
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IstiodValues {
    pub image: String,

    #[serde(default = "defaults::istiod_namespace")]
    pub namespace: String,

    #[serde(default = "defaults::trust_domain")]
    pub trust_domain: String,

    /// Availability zones istiod may be scheduled to; any zone when empty.
    #[serde(default)]
    pub zones: Vec<String>,
}

/// A port exposed by an ingress gateway
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPort {
    pub name: String,
    pub port: i32,
    pub target_port: i32,
}

/// Settings of one ingress gateway
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressGatewayValues {
    pub namespace: String,
    pub image: String,

    /// Labels identifying the gateway, selected by `Gateway` resources.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Annotations of the load balancer service.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default = "defaults::gateway_ports")]
    pub ports: Vec<GatewayPort>,

    #[serde(default = "defaults::min_replicas")]
    pub min_replicas: i32,

    #[serde(default = "defaults::max_replicas")]
    pub max_replicas: i32,

    /// `Cluster` or `Local`.
    #[serde(default)]
    pub external_traffic_policy: Option<String>,
}

/// Settings of istio
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Values {
    pub istiod: IstiodValues,

    #[serde(default)]
    pub ingress_gateways: Vec<IngressGatewayValues>,
}

mod defaults {
    use super::GatewayPort;

    pub fn istiod_namespace() -> String {
        "istio-system".into()
    }
    pub fn trust_domain() -> String {
        "cluster.local".into()
    }
    pub fn gateway_ports() -> Vec<GatewayPort> {
        vec![
            GatewayPort { name: "tcp".into(), port: 443, target_port: 9443 },
            GatewayPort { name: "tls-tunnel".into(), port: 8132, target_port: 8132 },
        ]
    }
    pub fn min_replicas() -> i32 {
        2
    }
    pub fn max_replicas() -> i32 {
        5
    }
}

impl Values {
    pub fn validate(&self) -> Result<()> {
        for gateway in &self.ingress_gateways {
            if gateway.min_replicas < 1 || gateway.max_replicas < gateway.min_replicas {
                return Err(Error::IllegalConfig(format!(
                    "ingress gateway in {} needs 1 <= minReplicas ({}) <= maxReplicas ({})",
                    gateway.namespace, gateway.min_replicas, gateway.max_replicas
                )));
            }
        }

        let mut namespaces: Vec<_> = self.ingress_gateways.iter().map(|g| &g.namespace).collect();
        namespaces.sort();
        if let Some(pair) = namespaces.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(Error::IllegalConfig(format!(
                "more than one ingress gateway in namespace {}",
                pair[0]
            )));
        }
        Ok(())
    }
}

/// Deploys istiod and the ingress gateways
pub struct Istio {
    client: Client,
    values: Values,
}

fn namespace(name: &str, labels: BTreeMap<String, String>) -> Namespace {
    Namespace {
        metadata: meta! { name: Some(name.into()), labels: Some(labels) },
        ..Default::default()
    }
}

impl Istio {
    pub fn new(client: Client, values: Values) -> Self {
        Self { client, values }
    }

    fn istiod_labels() -> BTreeMap<String, String> {
        labels! { app: ISTIOD, "istio" => "pilot" }
    }

    fn gateway_labels(gateway: &IngressGatewayValues) -> BTreeMap<String, String> {
        let mut labels = labels! { app: INGRESS_GATEWAY, "istio" => "ingressgateway" };
        labels.extend(gateway.labels.clone());
        labels
    }

    pub(crate) fn istiod_namespace(&self) -> Namespace {
        namespace(
            &self.values.istiod.namespace,
            labels! { app: "istio", LABEL_ROLE => "istio-system", "istio-injection" => "disabled" },
        )
    }

    pub(crate) fn mesh_config(&self) -> ConfigMap {
        let istiod = &self.values.istiod;
        let mesh = formatdoc! {r#"
            # Istio mesh configuration shared by istiod and every proxy
            defaultConfig:
              discoveryAddress: istiod.{namespace}.svc:15012
              holdApplicationUntilProxyStarts: true
              terminationDrainDuration: 5s
            enablePrometheusMerge: false
            rootNamespace: {namespace}
            trustDomain: {trust_domain}
            outboundTrafficPolicy:
              mode: REGISTRY_ONLY
        "#,
            namespace = istiod.namespace,
            trust_domain = istiod.trust_domain,
        };

        ConfigMap {
            metadata: meta! {
                name: Some("istio".into()),
                namespace: Some(istiod.namespace.clone()),
                labels: Some(Self::istiod_labels())
            },
            data: Some(BTreeMap::from([
                ("mesh".into(), mesh),
                ("meshNetworks".into(), "networks: {}".into()),
            ])),

            ..Default::default()
        }
    }

    pub(crate) fn istiod_deployment(&self) -> Deployment {
        let istiod = &self.values.istiod;
        let labels = Self::istiod_labels();
        let ports = [("grpc-xds", 15010), ("https-xds", 15012), ("http-monitoring", 15014), ("https-webhook", 10250)];

        let affinity = (!istiod.zones.is_empty()).then(|| Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: "topology.kubernetes.io/zone".into(),
                            operator: "In".into(),
                            values: Some(istiod.zones.clone()),
                        }]),
                        match_fields: None,
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        Deployment {
            metadata: meta! {
                name: Some(ISTIOD.into()),
                namespace: Some(istiod.namespace.clone()),
                labels: Some(labels.clone())
            },
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                revision_history_limit: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    match_expressions: None,
                },
                template: PodTemplateSpec {
                    metadata: Some(meta! {
                        labels: Some(labels),
                        annotations: Some(BTreeMap::from([("sidecar.istio.io/inject".into(), "false".into())]))
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(ISTIOD.into()),
                        automount_service_account_token: Some(true),
                        priority_class_name: Some("gardener-system-critical".into()),
                        affinity,
                        containers: vec![Container {
                            name: "discovery".into(),
                            image: Some(istiod.image.clone()),
                            image_pull_policy: Some("IfNotPresent".into()),
                            args: Some(vec![
                                "discovery".into(),
                                "--monitoringAddr=:15014".into(),
                                "--grpcAddr=".into(),
                                "--httpsAddr=:10250".into(),
                                "--log_output_level=all:warn,ads:error".into(),
                                "--domain".into(),
                                istiod.trust_domain.clone(),
                                "--keepaliveMaxServerConnectionAge".into(),
                                "30m".into(),
                            ]),
                            env: Some(vec![
                                field_env("POD_NAME", "metadata.name"),
                                field_env("POD_NAMESPACE", "metadata.namespace"),
                                env("REVISION", "default"),
                                env("PILOT_ENABLE_ANALYSIS", "false"),
                                env("PILOT_ENABLE_STATUS", "false"),
                                env("VALIDATION_WEBHOOK_CONFIG_NAME", ""),
                            ]),
                            ports: Some(
                                ports
                                    .into_iter()
                                    .map(|(name, port)| ContainerPort {
                                        name: Some(name.into()),
                                        container_port: port,
                                        protocol: Some("TCP".into()),
                                        ..Default::default()
                                    })
                                    .collect(),
                            ),
                            readiness_probe: Some(Probe {
                                http_get: Some(HTTPGetAction {
                                    path: Some("/ready".into()),
                                    port: IntOrString::Int(8080),
                                    ..Default::default()
                                }),
                                initial_delay_seconds: Some(5),
                                period_seconds: Some(5),
                                timeout_seconds: Some(5),
                                ..Default::default()
                            }),
                            resources: Some(ResourceRequirements {
                                requests: Some(quantities(&[("cpu", "250m"), ("memory", "500Mi")])),
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

    pub(crate) fn istiod_service(&self) -> Service {
        let ports = [
            ("grpc-xds", 15010, 15010),
            ("https-xds", 15012, 15012),
            ("https-webhook", 443, 10250),
            ("http-monitoring", 15014, 15014),
        ];

        Service {
            metadata: meta! {
                name: Some(ISTIOD.into()),
                namespace: Some(self.values.istiod.namespace.clone()),
                labels: Some(Self::istiod_labels())
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".into()),
                selector: Some(Self::istiod_labels()),
                ports: Some(
                    ports
                        .into_iter()
                        .map(|(name, port, target)| ServicePort {
                            name: Some(name.into()),
                            port,
                            protocol: Some("TCP".into()),
                            target_port: Some(IntOrString::Int(target)),
                            ..Default::default()
                        })
                        .collect(),
                ),

                ..Default::default()
            }),
            status: None,
        }
    }

    fn istiod_cluster_role_name(&self) -> String {
        format!("istiod-clusterrole-{}", self.values.istiod.namespace)
    }

    fn istiod_subjects(&self) -> Option<Vec<Subject>> {
        Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name: ISTIOD.into(),
            namespace: Some(self.values.istiod.namespace.clone()),
            ..Default::default()
        }])
    }

    /// Read access to the mesh inputs, write access to webhooks and workload entries
    pub(crate) fn istiod_cluster_role(&self) -> ClusterRole {
        let rule = |api_groups: &[&str], resources: &[&str], verbs: &[&str]| PolicyRule {
            api_groups: Some(api_groups.iter().map(|g| g.to_string()).collect()),
            resources: Some(resources.iter().map(|r| r.to_string()).collect()),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        };
        let read = ["get", "list", "watch"];
        let istio_groups = [
            "config.istio.io",
            "security.istio.io",
            "networking.istio.io",
            "authentication.istio.io",
            "rbac.istio.io",
            "telemetry.istio.io",
            "extensions.istio.io",
        ];

        ClusterRole {
            metadata: meta! {
                name: Some(self.istiod_cluster_role_name()),
                labels: Some(Self::istiod_labels())
            },
            rules: Some(vec![
                rule(
                    &["admissionregistration.k8s.io"],
                    &["mutatingwebhookconfigurations", "validatingwebhookconfigurations"],
                    &["get", "list", "watch", "update", "patch"],
                ),
                rule(&istio_groups, &["*"], &read),
                rule(
                    &["networking.istio.io"],
                    &["workloadentries", "workloadentries/status"],
                    &["get", "list", "watch", "update", "patch", "create", "delete"],
                ),
                rule(&["apiextensions.k8s.io"], &["customresourcedefinitions"], &read),
                rule(&[""], &["pods", "nodes", "services", "namespaces", "endpoints", "serviceaccounts"], &read),
                rule(&["discovery.k8s.io"], &["endpointslices"], &read),
                rule(&["networking.k8s.io"], &["ingresses", "ingressclasses"], &read),
                rule(&["networking.k8s.io"], &["ingresses/status"], &["*"]),
                rule(&[""], &["configmaps"], &["create", "get", "list", "watch", "update", "delete"]),
                rule(&["authentication.k8s.io"], &["tokenreviews"], &["create"]),
                rule(&["authorization.k8s.io"], &["subjectaccessreviews"], &["create"]),
                rule(&["gateway.networking.k8s.io"], &["*"], &read),
            ]),

            ..Default::default()
        }
    }

    pub(crate) fn istiod_cluster_role_binding(&self) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: meta! {
                name: Some(self.istiod_cluster_role_name()),
                labels: Some(Self::istiod_labels())
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: self.istiod_cluster_role_name(),
            },
            subjects: self.istiod_subjects(),
        }
    }

    /// istiod keeps its CA and the remote cluster secrets in its own namespace
    pub(crate) fn istiod_role(&self) -> Role {
        Role {
            metadata: meta! {
                name: Some(ISTIOD.into()),
                namespace: Some(self.values.istiod.namespace.clone()),
                labels: Some(Self::istiod_labels())
            },
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec!["".into()]),
                resources: Some(vec!["secrets".into()]),
                verbs: ["create", "get", "watch", "list", "update", "delete"]
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
                ..Default::default()
            }]),
        }
    }

    pub(crate) fn istiod_role_binding(&self) -> RoleBinding {
        RoleBinding {
            metadata: meta! {
                name: Some(ISTIOD.into()),
                namespace: Some(self.values.istiod.namespace.clone()),
                labels: Some(Self::istiod_labels())
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "Role".into(),
                name: ISTIOD.into(),
            },
            subjects: self.istiod_subjects(),
        }
    }

    pub(crate) fn istiod_registry(&self) -> Result<Registry> {
        let namespace = &self.values.istiod.namespace;
        let mut registry = Registry::new();
        registry.add(&self.istiod_namespace())?;
        registry.add(&service_account(ISTIOD, namespace, Self::istiod_labels()))?;
        registry.add(&self.istiod_cluster_role())?;
        registry.add(&self.istiod_cluster_role_binding())?;
        registry.add(&self.istiod_role())?;
        registry.add(&self.istiod_role_binding())?;
        registry.add(&self.mesh_config())?;
        registry.add(&self.istiod_deployment())?;
        registry.add(&self.istiod_service())?;
        registry.add(&pod_disruption_budget(ISTIOD, namespace, Self::istiod_labels()))?;
        Ok(registry)
    }

    pub(crate) fn gateway_namespace(&self, gateway: &IngressGatewayValues) -> Namespace {
        namespace(
            &gateway.namespace,
            labels! { app: INGRESS_GATEWAY, LABEL_ROLE => "istio-ingress", "istio-injection" => "disabled" },
        )
    }

    pub(crate) fn gateway_deployment(&self, gateway: &IngressGatewayValues) -> Deployment {
        let labels = Self::gateway_labels(gateway);
        let trust_domain = &self.values.istiod.trust_domain;
        let discovery = format!("istiod.{}.svc:15012", self.values.istiod.namespace);

        let mut ports: Vec<ContainerPort> = gateway
            .ports
            .iter()
            .map(|p| ContainerPort {
                name: Some(p.name.clone()),
                container_port: p.target_port,
                protocol: Some("TCP".into()),
                ..Default::default()
            })
            .collect();
        ports.push(ContainerPort {
            name: Some("status-port".into()),
            container_port: PORT_STATUS,
            protocol: Some("TCP".into()),
            ..Default::default()
        });

        Deployment {
            metadata: meta! {
                name: Some(INGRESS_GATEWAY.into()),
                namespace: Some(gateway.namespace.clone()),
                labels: Some(labels.clone())
            },
            spec: Some(DeploymentSpec {
                replicas: Some(gateway.min_replicas),
                revision_history_limit: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    match_expressions: None,
                },
                template: PodTemplateSpec {
                    metadata: Some(meta! {
                        labels: Some(labels),
                        annotations: Some(BTreeMap::from([("sidecar.istio.io/inject".into(), "false".into())]))
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(INGRESS_GATEWAY.into()),
                        automount_service_account_token: Some(true),
                        priority_class_name: Some("gardener-system-critical".into()),
                        containers: vec![Container {
                            name: "istio-proxy".into(),
                            image: Some(gateway.image.clone()),
                            image_pull_policy: Some("IfNotPresent".into()),
                            args: Some(vec![
                                "proxy".into(),
                                "router".into(),
                                "--domain".into(),
                                format!("$(POD_NAMESPACE).svc.{trust_domain}"),
                                "--proxyLogLevel=warning".into(),
                                "--proxyComponentLogLevel=misc:error".into(),
                                "--log_output_level=all:warn".into(),
                            ]),
                            env: Some(vec![
                                field_env("POD_NAME", "metadata.name"),
                                field_env("POD_NAMESPACE", "metadata.namespace"),
                                field_env("INSTANCE_IP", "status.podIP"),
                                env("ISTIO_META_CLUSTER_ID", "Kubernetes"),
                                env("CA_ADDR", &discovery),
                                env("PILOT_CERT_PROVIDER", "istiod"),
                            ]),
                            ports: Some(ports),
                            readiness_probe: Some(Probe {
                                http_get: Some(HTTPGetAction {
                                    path: Some("/healthz/ready".into()),
                                    port: IntOrString::Int(PORT_STATUS),
                                    scheme: Some("HTTP".into()),
                                    ..Default::default()
                                }),
                                initial_delay_seconds: Some(1),
                                period_seconds: Some(2),
                                failure_threshold: Some(30),
                                ..Default::default()
                            }),
                            resources: Some(ResourceRequirements {
                                requests: Some(quantities(&[("cpu", "300m"), ("memory", "128Mi")])),
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

    pub(crate) fn gateway_service(&self, gateway: &IngressGatewayValues) -> Service {
        let mut ports: Vec<ServicePort> = gateway
            .ports
            .iter()
            .map(|p| ServicePort {
                name: Some(p.name.clone()),
                port: p.port,
                protocol: Some("TCP".into()),
                target_port: Some(IntOrString::Int(p.target_port)),
                ..Default::default()
            })
            .collect();
        ports.push(ServicePort {
            name: Some("status-port".into()),
            port: PORT_STATUS,
            protocol: Some("TCP".into()),
            target_port: Some(IntOrString::Int(PORT_STATUS)),
            ..Default::default()
        });

        Service {
            metadata: meta! {
                name: Some(INGRESS_GATEWAY.into()),
                namespace: Some(gateway.namespace.clone()),
                labels: Some(Self::gateway_labels(gateway)),
                annotations: Some(gateway.annotations.clone())
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                external_traffic_policy: gateway.external_traffic_policy.clone(),
                selector: Some(Self::gateway_labels(gateway)),
                ports: Some(ports),

                ..Default::default()
            }),
            status: None,
        }
    }

    pub(crate) fn gateway_hpa(&self, gateway: &IngressGatewayValues) -> HorizontalPodAutoscaler {
        HorizontalPodAutoscaler {
            metadata: meta! {
                name: Some(INGRESS_GATEWAY.into()),
                namespace: Some(gateway.namespace.clone()),
                labels: Some(Self::gateway_labels(gateway))
            },
            spec: Some(HorizontalPodAutoscalerSpec {
                min_replicas: Some(gateway.min_replicas),
                max_replicas: gateway.max_replicas,
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".into()),
                    kind: "Deployment".into(),
                    name: INGRESS_GATEWAY.into(),
                },
                metrics: Some(vec![MetricSpec {
                    type_: "Resource".into(),
                    resource: Some(ResourceMetricSource {
                        name: "cpu".into(),
                        target: MetricTarget {
                            type_: "Utilization".into(),
                            average_utilization: Some(80),
                            ..Default::default()
                        },
                    }),
                    ..Default::default()
                }]),
                behavior: None,
            }),
            status: None,
        }
    }

    pub(crate) fn gateway_registry(&self, gateway: &IngressGatewayValues) -> Result<Registry> {
        let labels = Self::gateway_labels(gateway);
        let mut registry = Registry::new();
        registry.add(&self.gateway_namespace(gateway))?;
        registry.add(&service_account(INGRESS_GATEWAY, &gateway.namespace, labels.clone()))?;
        registry.add(&self.gateway_deployment(gateway))?;
        registry.add(&self.gateway_service(gateway))?;
        registry.add(&pod_disruption_budget(INGRESS_GATEWAY, &gateway.namespace, labels))?;
        registry.add(&self.gateway_hpa(gateway))?;
        Ok(registry)
    }

    /// Namespace and name of every managed resource, istiod first
    fn managed_resources(&self) -> Vec<(&str, &'static str)> {
        std::iter::once((self.values.istiod.namespace.as_str(), MANAGED_RESOURCE_ISTIOD))
            .chain(
                self.values
                    .ingress_gateways
                    .iter()
                    .map(|g| (g.namespace.as_str(), MANAGED_RESOURCE_INGRESS)),
            )
            .collect()
    }

    async fn deploy_into(&self, namespace: Namespace, name: &str, registry: Registry) -> Result<()> {
        let namespaces = Api::<Namespace>::all(self.client.clone());
        let target = kubernetes::apply(&namespaces, &namespace).await?;
        let target = target.metadata.name.unwrap_or_default();

        managedresources::create_for_seed(self.client.clone(), &target, name, false, registry.serialized_objects())
            .await
    }
}

#[async_trait]
impl DeployWaiter for Istio {
    fn name(&self) -> &str {
        "istio"
    }

    async fn deploy(&self) -> Result<(), Error> {
        self.values.validate()?;
        info!(gateways = self.values.ingress_gateways.len(), "Deploying istio");

        self.deploy_into(self.istiod_namespace(), MANAGED_RESOURCE_ISTIOD, self.istiod_registry()?)
            .await?;

        try_join_all(self.values.ingress_gateways.iter().map(|gateway| async move {
            let registry = self.gateway_registry(gateway)?;
            self.deploy_into(self.gateway_namespace(gateway), MANAGED_RESOURCE_INGRESS, registry)
                .await
        }))
        .await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), Error> {
        // gateways first, they depend on istiod
        for (namespace, name) in self.managed_resources().into_iter().rev() {
            managedresources::delete(self.client.clone(), namespace, name).await?;
        }
        Ok(())
    }

    async fn wait(&self) -> Result<(), Error> {
        try_join_all(self.managed_resources().into_iter().map(|(namespace, name)| {
            managedresources::wait_until_healthy(self.client.clone(), namespace, name, DEFAULT_WAIT_TIMEOUT)
        }))
        .await?;
        Ok(())
    }

    async fn wait_cleanup(&self) -> Result<(), Error> {
        try_join_all(self.managed_resources().into_iter().map(|(namespace, name)| {
            managedresources::wait_until_deleted(
                self.client.clone(),
                namespace,
                name,
                DEFAULT_WAIT_CLEANUP_TIMEOUT,
            )
        }))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::fixtures::{timeout_after_1s, ApiServerVerifier, Scenario};

    fn values() -> Values {
        serde_yaml::from_str(indoc! {r#"
            istiod:
              image: gcr.io/istio-release/pilot:1.19.3-distroless
              zones: [europe-1a, europe-1b]
            ingressGateways:
            - namespace: istio-ingress
              image: gcr.io/istio-release/proxyv2:1.19.3-distroless
              labels:
                app: istio-ingressgateway
                istio: ingressgateway
              annotations:
                service.beta.kubernetes.io/aws-load-balancer-type: nlb
              externalTrafficPolicy: Local
            - namespace: istio-ingress--europe-1a
              image: gcr.io/istio-release/proxyv2:1.19.3-distroless
              labels:
                istio: ingressgateway--zone--europe-1a
              minReplicas: 1
              maxReplicas: 2
        "#})
        .unwrap()
    }

    fn component() -> Istio {
        let (client, _) = ApiServerVerifier::new();
        Istio::new(client, values())
    }

    #[tokio::test]
    async fn istiod_registry_contents() {
        let keys: Vec<_> = component().istiod_registry().unwrap().serialized_objects().into_keys().collect();
        assert_eq!(
            keys,
            vec![
                "clusterrole____istiod-clusterrole-istio-system.yaml",
                "clusterrolebinding____istiod-clusterrole-istio-system.yaml",
                "configmap__istio-system__istio.yaml",
                "deployment__istio-system__istiod.yaml",
                "namespace____istio-system.yaml",
                "poddisruptionbudget__istio-system__istiod.yaml",
                "role__istio-system__istiod.yaml",
                "rolebinding__istio-system__istiod.yaml",
                "service__istio-system__istiod.yaml",
                "serviceaccount__istio-system__istiod.yaml",
            ]
        );
    }

    #[tokio::test]
    async fn istiod_may_watch_the_mesh() {
        let component = component();
        let rules = component.istiod_cluster_role().rules.unwrap();
        let grants = |group: &str, resource: &str, verb: &str| {
            rules.iter().any(|rule| {
                rule.api_groups.as_ref().unwrap().iter().any(|g| g == group)
                    && rule.resources.as_ref().unwrap().iter().any(|r| r == resource || r == "*")
                    && rule.verbs.iter().any(|v| v == verb || v == "*")
            })
        };
        assert!(grants("", "services", "watch"));
        assert!(grants("", "namespaces", "list"));
        assert!(grants("discovery.k8s.io", "endpointslices", "watch"));
        assert!(grants("networking.istio.io", "virtualservices", "watch"));
        assert!(grants("", "configmaps", "update"));

        let binding = component.istiod_cluster_role_binding();
        assert_eq!(binding.role_ref.name, "istiod-clusterrole-istio-system");
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.name, ISTIOD);
        assert_eq!(subject.namespace.as_deref(), Some("istio-system"));
    }

    #[tokio::test]
    async fn mesh_config_uses_trust_domain() {
        let config = component().mesh_config();
        let mesh: serde_yaml::Value = serde_yaml::from_str(&config.data.unwrap()["mesh"]).unwrap();
        assert_eq!(mesh["trustDomain"], "cluster.local");
        assert_eq!(mesh["defaultConfig"]["discoveryAddress"], "istiod.istio-system.svc:15012");
    }

    #[tokio::test]
    async fn istiod_is_pinned_to_zones() {
        let deployment = component().istiod_deployment();
        let affinity = deployment.spec.unwrap().template.spec.unwrap().affinity.unwrap();
        let terms = affinity
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        let requirement = &terms[0].match_expressions.as_ref().unwrap()[0];
        assert_eq!(requirement.values.as_deref(), Some(&["europe-1a".to_string(), "europe-1b".to_string()][..]));
    }

    #[tokio::test]
    async fn gateway_service_exposes_ports_and_status() {
        let component = component();
        let gateway = &component.values.ingress_gateways[0];
        let service = component.gateway_service(gateway);

        assert_eq!(
            service.metadata.annotations.unwrap()["service.beta.kubernetes.io/aws-load-balancer-type"],
            "nlb"
        );
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(spec.external_traffic_policy.as_deref(), Some("Local"));
        let ports: Vec<_> = spec.ports.unwrap().into_iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![443, 8132, PORT_STATUS]);
    }

    #[tokio::test]
    async fn gateway_autoscales_between_bounds() {
        let component = component();
        let gateway = &component.values.ingress_gateways[1];
        let hpa = component.gateway_hpa(gateway).spec.unwrap();
        assert_eq!(hpa.min_replicas, Some(1));
        assert_eq!(hpa.max_replicas, 2);

        let registry = component.gateway_registry(gateway).unwrap();
        assert!(registry
            .serialized_objects()
            .contains_key("horizontalpodautoscaler__istio-ingress--europe-1a__istio-ingressgateway.yaml"));
    }

    #[tokio::test]
    async fn gateway_labels_are_merged() {
        let component = component();
        let labels = Istio::gateway_labels(&component.values.ingress_gateways[1]);
        assert_eq!(labels["app"], INGRESS_GATEWAY);
        assert_eq!(labels["istio"], "ingressgateway--zone--europe-1a");
    }

    #[tokio::test]
    async fn managed_resources_start_with_istiod() {
        let component = component();
        assert_eq!(
            component.managed_resources(),
            vec![
                ("istio-system", "istio"),
                ("istio-ingress", "istio-ingress"),
                ("istio-ingress--europe-1a", "istio-ingress"),
            ]
        );
    }

    #[test]
    fn validation_rejects_shared_namespaces() {
        let mut values = values();
        assert!(values.validate().is_ok());

        values.ingress_gateways[1].namespace = "istio-ingress".into();
        assert!(matches!(values.validate(), Err(Error::IllegalConfig(_))));
    }

    #[tokio::test]
    async fn destroy_removes_gateways_before_istiod() {
        let (client, fakeserver) = ApiServerVerifier::new();
        let mocksrv = fakeserver.run(Scenario::ManagedResourcesDeletedInOrder(vec![
            ("istio-ingress--europe-1a".into(), "istio-ingress".into()),
            ("istio-ingress".into(), "istio-ingress".into()),
            ("istio-system".into(), "istio".into()),
        ]));

        Istio::new(client, values()).destroy().await.unwrap();
        timeout_after_1s(mocksrv).await;
    }
}
