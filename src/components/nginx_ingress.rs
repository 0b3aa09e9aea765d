use std::collections::BTreeMap;

use async_trait::async_trait;
use indoc::{formatdoc, indoc};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Capabilities, ConfigMap, Container, ContainerPort, HTTPGetAction, PodSpec,
            PodTemplateSpec, Probe, ResourceRequirements, SecurityContext, Service, ServicePort,
            ServiceSpec,
        },
        networking::v1::{IngressClass, IngressClassSpec},
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    component::{
        DeployWaiter, LoggingComponent, MonitoringComponent, DEFAULT_WAIT_CLEANUP_TIMEOUT,
        DEFAULT_WAIT_TIMEOUT,
    },
    labels,
    managedresources::{self, Registry},
    meta, Error, Result, LABEL_ROLE,
};

use super::{env, field_env, min_allowed, pod_disruption_budget, quantities, service_account, vertical_pod_autoscaler};

const MANAGED_RESOURCE_NAME: &str = "nginx-ingress";
const CONTROLLER: &str = "nginx-ingress-controller";
const BACKEND: &str = "nginx-ingress-k8s-backend";
const SERVICE_ACCOUNT: &str = "nginx-ingress";
const RBAC_NAME: &str = "gardener.cloud:seed:nginx-ingress";
const PORT_METRICS: i32 = 10254;
const PORT_BACKEND: i32 = 8080;

/// Settings of the seed's nginx ingress controller
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Values {
    #[serde(default = "crate::config::defaults::namespace")]
    pub namespace: String,

    pub image_controller: String,
    pub image_default_backend: String,

    #[serde(default = "defaults::ingress_class")]
    pub ingress_class: String,

    /// Controller settings, overriding the defaults key by key.
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    #[serde(default)]
    pub load_balancer_annotations: BTreeMap<String, String>,

    #[serde(default = "defaults::enabled")]
    pub vpa_enabled: bool,
}

mod defaults {
    pub fn ingress_class() -> String {
        "nginx-ingress-gardener".into()
    }
    pub fn enabled() -> bool {
        true
    }
}

/// Deploys nginx-ingress into the seed
pub struct NginxIngress {
    client: Client,
    values: Values,
}

impl NginxIngress {
    pub fn new(client: Client, values: Values) -> Self {
        Self { client, values }
    }

    fn labels(component: &str) -> BTreeMap<String, String> {
        labels! { app: "nginx-ingress", "component" => component, LABEL_ROLE => "optional-addon" }
    }

    fn controller_class(&self) -> String {
        format!("k8s.io/{}", self.values.ingress_class)
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}/{name}", self.values.namespace)
    }

    /// Controller settings after merging the configured ones into the defaults
    pub(crate) fn config_map(&self) -> ConfigMap {
        let mut data: BTreeMap<String, String> = [
            ("allow-snippet-annotations", "false"),
            ("server-name-hash-bucket-size", "256"),
            ("use-proxy-protocol", "false"),
            ("worker-processes", "2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        data.extend(self.values.config.clone());

        ConfigMap {
            metadata: meta! {
                name: Some(CONTROLLER.into()),
                namespace: Some(self.values.namespace.clone()),
                labels: Some(Self::labels("controller"))
            },
            data: Some(data),

            ..Default::default()
        }
    }

    pub(crate) fn controller_service(&self) -> Service {
        let ports = [("http", 80), ("https", 443)];

        Service {
            metadata: meta! {
                name: Some(CONTROLLER.into()),
                namespace: Some(self.values.namespace.clone()),
                labels: Some(Self::labels("controller")),
                annotations: Some(self.values.load_balancer_annotations.clone())
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                external_traffic_policy: Some("Cluster".into()),
                selector: Some(Self::labels("controller")),
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

    pub(crate) fn backend_service(&self) -> Service {
        Service {
            metadata: meta! {
                name: Some(BACKEND.into()),
                namespace: Some(self.values.namespace.clone()),
                labels: Some(Self::labels(BACKEND))
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".into()),
                selector: Some(Self::labels(BACKEND)),
                ports: Some(vec![ServicePort {
                    port: 80,
                    protocol: Some("TCP".into()),
                    target_port: Some(IntOrString::Int(PORT_BACKEND)),
                    ..Default::default()
                }]),

                ..Default::default()
            }),
            status: None,
        }
    }

    pub(crate) fn controller_deployment(&self) -> Deployment {
        let labels = Self::labels("controller");
        let probe = |initial_delay: i32| Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".into()),
                port: IntOrString::Int(PORT_METRICS),
                scheme: Some("HTTP".into()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(initial_delay),
            period_seconds: Some(10),
            timeout_seconds: Some(1),
            failure_threshold: Some(3),
            ..Default::default()
        };
        let ports = [("http", 80), ("https", 443), ("metrics", PORT_METRICS)];

        Deployment {
            metadata: meta! {
                name: Some(CONTROLLER.into()),
                namespace: Some(self.values.namespace.clone()),
                labels: Some(labels.clone())
            },
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                revision_history_limit: Some(2),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    match_expressions: None,
                },
                template: PodTemplateSpec {
                    metadata: Some(meta! { labels: Some(labels) }),
                    spec: Some(PodSpec {
                        service_account_name: Some(SERVICE_ACCOUNT.into()),
                        automount_service_account_token: Some(true),
                        priority_class_name: Some("gardener-system-600".into()),
                        termination_grace_period_seconds: Some(60),
                        containers: vec![Container {
                            name: CONTROLLER.into(),
                            image: Some(self.values.image_controller.clone()),
                            image_pull_policy: Some("IfNotPresent".into()),
                            args: Some(vec![
                                "/nginx-ingress-controller".into(),
                                format!("--default-backend-service={}", self.qualified(BACKEND)),
                                "--enable-ssl-passthrough=true".into(),
                                format!("--publish-service={}", self.qualified(CONTROLLER)),
                                "--election-id=ingress-controller-seed-leader".into(),
                                "--update-status=true".into(),
                                "--annotations-prefix=nginx.ingress.kubernetes.io".into(),
                                format!("--configmap={}", self.qualified(CONTROLLER)),
                                format!("--ingress-class={}", self.values.ingress_class),
                                format!("--controller-class={}", self.controller_class()),
                            ]),
                            env: Some(vec![
                                field_env("POD_NAME", "metadata.name"),
                                field_env("POD_NAMESPACE", "metadata.namespace"),
                                env("LD_PRELOAD", "/usr/local/lib/libmimalloc.so"),
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
                            liveness_probe: Some(probe(40)),
                            readiness_probe: Some(probe(10)),
                            security_context: Some(SecurityContext {
                                allow_privilege_escalation: Some(true),
                                run_as_user: Some(101),
                                capabilities: Some(Capabilities {
                                    add: Some(vec!["NET_BIND_SERVICE".into()]),
                                    drop: Some(vec!["ALL".into()]),
                                }),
                                ..Default::default()
                            }),
                            resources: Some(ResourceRequirements {
                                requests: Some(quantities(&[("cpu", "100m"), ("memory", "375Mi")])),
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

    pub(crate) fn backend_deployment(&self) -> Deployment {
        let labels = Self::labels(BACKEND);

        Deployment {
            metadata: meta! {
                name: Some(BACKEND.into()),
                namespace: Some(self.values.namespace.clone()),
                labels: Some(labels.clone())
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                revision_history_limit: Some(2),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    match_expressions: None,
                },
                template: PodTemplateSpec {
                    metadata: Some(meta! { labels: Some(labels) }),
                    spec: Some(PodSpec {
                        priority_class_name: Some("gardener-system-600".into()),
                        containers: vec![Container {
                            name: BACKEND.into(),
                            image: Some(self.values.image_default_backend.clone()),
                            image_pull_policy: Some("IfNotPresent".into()),
                            ports: Some(vec![ContainerPort {
                                container_port: PORT_BACKEND,
                                protocol: Some("TCP".into()),
                                ..Default::default()
                            }]),
                            liveness_probe: Some(Probe {
                                http_get: Some(HTTPGetAction {
                                    path: Some("/healthy".into()),
                                    port: IntOrString::Int(PORT_BACKEND),
                                    scheme: Some("HTTP".into()),
                                    ..Default::default()
                                }),
                                initial_delay_seconds: Some(30),
                                timeout_seconds: Some(5),
                                ..Default::default()
                            }),
                            resources: Some(ResourceRequirements {
                                requests: Some(quantities(&[("cpu", "20m"), ("memory", "20Mi")])),
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

    fn subjects(&self) -> Vec<Subject> {
        vec![Subject {
            kind: "ServiceAccount".into(),
            name: SERVICE_ACCOUNT.into(),
            namespace: Some(self.values.namespace.clone()),
            ..Default::default()
        }]
    }

    pub(crate) fn cluster_role(&self) -> ClusterRole {
        let rule = |api_groups: &[&str], resources: &[&str], verbs: &[&str]| PolicyRule {
            api_groups: Some(api_groups.iter().map(|g| g.to_string()).collect()),
            resources: Some(resources.iter().map(|r| r.to_string()).collect()),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        };

        ClusterRole {
            metadata: meta! { name: Some(RBAC_NAME.into()), labels: Some(Self::labels("controller")) },
            rules: Some(vec![
                rule(
                    &[""],
                    &["endpoints", "nodes", "pods", "secrets", "configmaps", "namespaces"],
                    &["list", "watch"],
                ),
                rule(&[""], &["nodes"], &["get"]),
                rule(&[""], &["services"], &["get", "list", "update", "watch"]),
                rule(&[""], &["events"], &["create", "patch"]),
                rule(&["networking.k8s.io"], &["ingresses", "ingressclasses"], &["get", "list", "watch"]),
                rule(&["networking.k8s.io"], &["ingresses/status"], &["update"]),
                rule(&["discovery.k8s.io"], &["endpointslices"], &["get", "list", "watch"]),
            ]),

            ..Default::default()
        }
    }

    pub(crate) fn cluster_role_binding(&self) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: meta! { name: Some(RBAC_NAME.into()), labels: Some(Self::labels("controller")) },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: RBAC_NAME.into(),
            },
            subjects: Some(self.subjects()),
        }
    }

    pub(crate) fn role(&self) -> Role {
        let rule = |resources: &[&str], names: Option<Vec<String>>, verbs: &[&str]| PolicyRule {
            api_groups: Some(vec!["".into()]),
            resources: Some(resources.iter().map(|r| r.to_string()).collect()),
            resource_names: names,
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        };

        Role {
            metadata: meta! {
                name: Some(RBAC_NAME.into()),
                namespace: Some(self.values.namespace.clone()),
                labels: Some(Self::labels("controller"))
            },
            rules: Some(vec![
                rule(&["configmaps", "namespaces", "pods", "secrets", "endpoints"], None, &["get"]),
                rule(&["configmaps"], Some(vec![CONTROLLER.into()]), &["get", "update"]),
                rule(&["configmaps"], None, &["create"]),
                PolicyRule {
                    api_groups: Some(vec!["coordination.k8s.io".into()]),
                    resources: Some(vec!["leases".into()]),
                    resource_names: Some(vec!["ingress-controller-seed-leader".into()]),
                    verbs: vec!["get".into(), "update".into()],
                    ..Default::default()
                },
                PolicyRule {
                    api_groups: Some(vec!["coordination.k8s.io".into()]),
                    resources: Some(vec!["leases".into()]),
                    verbs: vec!["create".into()],
                    ..Default::default()
                },
            ]),
        }
    }

    pub(crate) fn role_binding(&self) -> RoleBinding {
        RoleBinding {
            metadata: meta! {
                name: Some(RBAC_NAME.into()),
                namespace: Some(self.values.namespace.clone()),
                labels: Some(Self::labels("controller"))
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "Role".into(),
                name: RBAC_NAME.into(),
            },
            subjects: Some(self.subjects()),
        }
    }

    pub(crate) fn ingress_class(&self) -> IngressClass {
        IngressClass {
            metadata: meta! {
                name: Some(self.values.ingress_class.clone()),
                labels: Some(Self::labels("controller"))
            },
            spec: Some(IngressClassSpec {
                controller: Some(self.controller_class()),
                parameters: None,
            }),
        }
    }

    pub(crate) fn registry(&self) -> Result<Registry> {
        let namespace = &self.values.namespace;
        let mut registry = Registry::new();
        registry.add(&service_account(SERVICE_ACCOUNT, namespace, Self::labels("controller")))?;
        registry.add(&self.config_map())?;
        registry.add(&self.controller_service())?;
        registry.add(&self.backend_service())?;
        registry.add(&self.controller_deployment())?;
        registry.add(&self.backend_deployment())?;
        registry.add(&self.cluster_role())?;
        registry.add(&self.cluster_role_binding())?;
        registry.add(&self.role())?;
        registry.add(&self.role_binding())?;
        registry.add(&self.ingress_class())?;
        registry.add(&pod_disruption_budget(CONTROLLER, namespace, Self::labels("controller")))?;
        if self.values.vpa_enabled {
            registry.add(&vertical_pod_autoscaler(
                &format!("{CONTROLLER}-vpa"),
                namespace,
                "Deployment",
                CONTROLLER,
                vec![min_allowed(CONTROLLER, &[("cpu", "25m"), ("memory", "100Mi")])],
            ))?;
        }
        Ok(registry)
    }
}

#[async_trait]
impl DeployWaiter for NginxIngress {
    fn name(&self) -> &str {
        MANAGED_RESOURCE_NAME
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

impl MonitoringComponent for NginxIngress {
    fn scrape_configs(&self) -> Vec<String> {
        vec![formatdoc! {r#"
            job_name: {CONTROLLER}
            honor_labels: false
            kubernetes_sd_configs:
            - role: pod
              namespaces:
                names: [{namespace}]
            relabel_configs:
            - source_labels: [__meta_kubernetes_pod_label_component, __meta_kubernetes_pod_container_port_number]
              action: keep
              regex: controller;{PORT_METRICS}
            - source_labels: [__meta_kubernetes_pod_name]
              target_label: pod
            metric_relabel_configs:
            - source_labels: [__name__]
              action: keep
              regex: ^(nginx_ingress_controller_requests|nginx_ingress_controller_ingress_upstream_latency_seconds_count|nginx_ingress_controller_nginx_process_connections)$
        "#,
            namespace = self.values.namespace,
        }]
    }

    fn alerting_rules(&self) -> Vec<(String, String)> {
        vec![(
            "nginx-ingress.rules.yaml".into(),
            indoc! {r#"
                groups:
                - name: nginx-ingress.rules
                  rules:
                  - alert: NginxIngressDown
                    expr: absent(up{job="nginx-ingress-controller"} == 1)
                    for: 15m
                    labels:
                      service: nginx-ingress
                      severity: warning
                      type: seed
                      visibility: operator
                    annotations:
                      description: All nginx-ingress controller instances are down or cannot be scraped.
                      summary: nginx-ingress controller is down.
            "#}
            .into(),
        )]
    }
}

impl LoggingComponent for NginxIngress {
    fn logging_parsers(&self) -> String {
        indoc! {r#"
            [PARSER]
                Name        nginxIngressParser
                Format      regex
                Regex       ^(?<severity>\w)(?<time>\d{4} [^\s]*)\s+(?<pid>\d+)\s+(?<source>[^ \]]+)\] (?<log>.*)$
                Time_Key    time
                Time_Format %m%d %H:%M:%S.%L
        "#}
        .into()
    }

    fn logging_filters(&self) -> String {
        formatdoc! {r#"
            [FILTER]
                Name                parser
                Match               kubernetes.*{CONTROLLER}*{CONTROLLER}*
                Key_Name            log
                Parser              nginxIngressParser
                Reserve_Data        True
        "#}
    }
}
