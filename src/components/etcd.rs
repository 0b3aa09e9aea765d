//! Deploys an etcd cluster as `Etcd` resource reconciled by etcd-druid.
//!
//! Every cluster comes with its autoscaler: an HVPA scaling it vertically in a
//! maintenance window when enabled, a plain VPA otherwise. The main etcd is
//! additionally guarded by a network policy only letting control plane
//! components reach its client port.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use indoc::formatdoc;
use k8s_openapi::{
    api::{
        autoscaling::v1::CrossVersionObjectReference,
        core::v1::{ResourceRequirements, SecretReference},
        networking::v1::{
            NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
            NetworkPolicySpec,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString,
    },
};
use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};
use kube_quantity::ParsedQuantity;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};

use crate::{
    component::{DeployWaiter, LoggingComponent, MonitoringComponent, DEFAULT_WAIT_CLEANUP_TIMEOUT},
    health, kubernetes, managedresources, meta,
    resources::{
        BackupSpec, ChangeParams, ContainerResourcePolicy, Etcd, EtcdConfig, EtcdSpec, HpaSpec, Hvpa,
        HvpaSpec, LeaderElectionSpec, MaintenanceTimeWindow, OwnerCheckSpec, PodResourcePolicy,
        ScaleParams, SharedConfig, StoreSpec, UpdatePolicy, VerticalPodAutoscaler, VpaSpec,
        WeightBasedScalingInterval,
    },
    retry::{self, Outcome},
    Error, Result, ANNOTATION_CONFIRM_DELETION, ANNOTATION_OPERATION, ANNOTATION_TIMESTAMP,
    FIELD_MANAGER, LABEL_ROLE, OPERATION_RECONCILE,
};

use super::{quantities, vertical_pod_autoscaler};

/// Interval in which the `Etcd` status is polled
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Time an etcd gets to become ready
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

const PORT_CLIENT: i32 = 2379;
const PORT_SERVER: i32 = 2380;
const PORT_BACKUP: i32 = 8080;
const NETWORK_POLICY_NAME: &str = "allow-etcd";
const CONTAINER_ETCD: &str = "etcd";
const CONTAINER_BACKUP: &str = "backup-restore";

/// Which data an etcd cluster holds
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// Every object of the cluster except events.
    #[default]
    Main,

    /// Events only, neither backed up nor restored.
    Events,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Main => "main",
            Role::Events => "events",
        }
    }
}

/// How closely an etcd cluster is watched
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Class {
    #[default]
    Normal,
    Important,
}

/// Where and how often backups are taken
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Name of the object storage provider, e.g. `S3` or `GCS`.
    pub provider: String,
    pub secret_ref_name: String,
    pub container: String,
    pub prefix: String,

    /// Cron schedule of full snapshots.
    pub full_snapshot_schedule: String,

    #[serde(default = "defaults::delta_snapshot_period")]
    pub delta_snapshot_period: String,

    #[serde(default = "defaults::garbage_collection_policy")]
    pub garbage_collection_policy: String,

    #[serde(default)]
    pub leader_election: Option<LeaderElectionConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    pub etcd_connection_timeout: String,
    pub reelection_period: String,
}

/// Vertical scaling through an HVPA
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HvpaConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub maintenance_window: Option<MaintenanceWindow>,

    /// Update mode when scaling down; defaults to `MaintenanceWindow`.
    #[serde(default)]
    pub scale_down_update_mode: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceWindow {
    pub begin: String,
    pub end: String,
}

/// DNS record whose value has to match the owner id for backups to be taken
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerCheckConfig {
    pub name: String,
    pub id: String,

    #[serde(default = "defaults::owner_check_interval")]
    pub interval: String,

    #[serde(default = "defaults::owner_check_timeout")]
    pub timeout: String,

    #[serde(default = "defaults::owner_check_interval")]
    pub dns_cache_ttl: String,
}

/// Settings of one etcd cluster
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Values {
    pub namespace: String,

    #[serde(default)]
    pub role: Role,

    #[serde(default)]
    pub class: Class,

    #[serde(default = "defaults::replicas")]
    pub replicas: i32,

    /// Size of the volume of every member, e.g. `10Gi`.
    #[serde(default = "defaults::storage_capacity")]
    pub storage_capacity: String,

    #[serde(default)]
    pub storage_class_name: Option<String>,

    /// Cron schedule of the defragmentation; a daily one is used when absent.
    #[serde(default)]
    pub defragmentation_schedule: Option<String>,

    #[serde(default)]
    pub priority_class_name: Option<String>,

    #[serde(default)]
    pub backup: Option<BackupConfig>,

    #[serde(default)]
    pub hvpa: Option<HvpaConfig>,

    #[serde(default)]
    pub owner_check: Option<OwnerCheckConfig>,

    /// Run three members regardless of `replicas`.
    #[serde(default)]
    pub high_availability: bool,
}

mod defaults {
    pub fn replicas() -> i32 {
        1
    }
    pub fn storage_capacity() -> String {
        "10Gi".into()
    }
    pub fn delta_snapshot_period() -> String {
        "5m".into()
    }
    pub fn garbage_collection_policy() -> String {
        "Exponential".into()
    }
    pub fn owner_check_interval() -> String {
        "30s".into()
    }
    pub fn owner_check_timeout() -> String {
        "2m".into()
    }
}

impl Values {
    /// Reject values etcd-druid would only fail on later.
    pub fn validate(&self) -> Result<()> {
        if self.replicas < 0 {
            return Err(Error::IllegalConfig(format!(
                "etcd-{} replicas must not be negative",
                self.role.as_str()
            )));
        }

        let capacity = ParsedQuantity::try_from(Quantity(self.storage_capacity.clone())).map_err(|e| {
            Error::IllegalConfig(format!("invalid storage capacity {:?}: {e}", self.storage_capacity))
        })?;
        match capacity.to_bytes_i64() {
            None => {
                return Err(Error::IllegalConfig(format!(
                    "storage capacity {:?} cannot be expressed in whole bytes",
                    self.storage_capacity
                )))
            }
            Some(bytes) if bytes <= 0 => {
                return Err(Error::IllegalConfig(format!(
                    "storage capacity {:?} must be positive",
                    self.storage_capacity
                )))
            }
            Some(_) => {}
        }

        if let Some(backup) = &self.backup {
            if backup.container.is_empty() || backup.provider.is_empty() {
                return Err(Error::IllegalConfig(
                    "backup needs a provider and a container".into(),
                ));
            }
        }
        Ok(())
    }

    fn effective_replicas(&self) -> i32 {
        if self.high_availability && self.replicas > 0 {
            3
        } else {
            self.replicas
        }
    }
}

/// An etcd cluster of a shoot control plane
pub struct EtcdCluster {
    client: Client,
    values: Values,
    name: String,
}

impl EtcdCluster {
    pub fn new(client: Client, values: Values) -> Self {
        let name = format!("etcd-{}", values.role.as_str());
        Self {
            client,
            values,
            name,
        }
    }

    fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("instance".into(), self.name.clone()),
            ("name".into(), "etcd".into()),
        ])
    }

    fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(LABEL_ROLE.into(), "controlplane".into());
        labels.insert("role".into(), self.values.role.as_str().into());
        labels
    }

    fn vpa_name(&self) -> String {
        format!("{}-vpa", self.name)
    }

    fn client_service(&self) -> String {
        format!("{}-client", self.name)
    }

    /// The network policy guarding the main etcd, `None` for other roles
    pub(crate) fn network_policy(&self) -> Option<NetworkPolicy> {
        if self.values.role != Role::Main {
            return None;
        }

        let peer = |pairs: &[(&str, &str)]| NetworkPolicyPeer {
            pod_selector: Some(LabelSelector {
                match_labels: Some(labels(pairs)),
                match_expressions: None,
            }),
            ..Default::default()
        };
        let port = |port: i32| NetworkPolicyPort {
            port: Some(IntOrString::Int(port)),
            protocol: Some("TCP".into()),
            end_port: None,
        };

        Some(NetworkPolicy {
            metadata: meta! {
                name: Some(NETWORK_POLICY_NAME.into()),
                namespace: Some(self.values.namespace.clone()),
                annotations: Some(BTreeMap::from([(
                    "gardener.cloud/description".into(),
                    "Allows inbound traffic from the kube-apiserver, the backup sidecars and prometheus to the main etcd".into(),
                )]))
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector {
                    match_labels: Some(self.selector_labels()),
                    match_expressions: None,
                },
                policy_types: Some(vec!["Ingress".into()]),
                ingress: Some(vec![
                    NetworkPolicyIngressRule {
                        from: Some(vec![
                            peer(&[(LABEL_ROLE, "controlplane"), ("app", "kubernetes"), ("role", "apiserver")]),
                            peer(&[(LABEL_ROLE, "controlplane"), ("app", "etcd-statefulset")]),
                            peer(&[(LABEL_ROLE, "monitoring"), ("app", "prometheus"), ("role", "monitoring")]),
                        ]),
                        ports: Some(vec![port(PORT_CLIENT), port(PORT_BACKUP)]),
                    },
                    NetworkPolicyIngressRule {
                        from: Some(vec![peer(&[("instance", self.name.as_str()), ("name", "etcd")])]),
                        ports: Some(vec![port(PORT_SERVER)]),
                    },
                ]),
                egress: None,
            }),

            ..Default::default()
        })
    }

    fn backup_spec(&self) -> BackupSpec {
        let mut spec = BackupSpec {
            port: Some(PORT_BACKUP),
            resources: Some(ResourceRequirements {
                requests: Some(quantities(&[("cpu", "23m"), ("memory", "128Mi")])),
                ..Default::default()
            }),
            ..Default::default()
        };

        if let Some(backup) = &self.values.backup {
            spec.store = Some(StoreSpec {
                secret_ref: SecretReference {
                    name: Some(backup.secret_ref_name.clone()),
                    namespace: None,
                },
                container: backup.container.clone(),
                provider: backup.provider.clone(),
                prefix: format!("{}/etcd-{}", backup.prefix, self.values.role.as_str()),
            });
            spec.full_snapshot_schedule = Some(backup.full_snapshot_schedule.clone());
            spec.delta_snapshot_period = Some(backup.delta_snapshot_period.clone());
            spec.garbage_collection_policy = Some(backup.garbage_collection_policy.clone());
            spec.leader_election = backup.leader_election.as_ref().map(|le| LeaderElectionSpec {
                etcd_connection_timeout: Some(le.etcd_connection_timeout.clone()),
                reelection_period: Some(le.reelection_period.clone()),
            });
        }

        spec.owner_check = self.values.owner_check.as_ref().map(|check| OwnerCheckSpec {
            name: check.name.clone(),
            id: check.id.clone(),
            interval: Some(check.interval.clone()),
            timeout: Some(check.timeout.clone()),
            dns_cache_ttl: Some(check.dns_cache_ttl.clone()),
        });

        spec
    }

    /// The `Etcd` resource, annotated to be reconciled right away
    pub(crate) fn etcd(&self, timestamp: &str) -> Etcd {
        let role = self.values.role.as_str();
        let metrics = match self.values.class {
            Class::Important => "extensive",
            Class::Normal => "basic",
        };

        let mut etcd = Etcd::new(
            &self.name,
            EtcdSpec {
                selector: LabelSelector {
                    match_labels: Some(self.selector_labels()),
                    match_expressions: None,
                },
                labels: {
                    let mut labels = self.labels();
                    labels.insert("app".into(), "etcd-statefulset".into());
                    labels
                },
                annotations: None,
                replicas: self.values.effective_replicas(),
                priority_class_name: self.values.priority_class_name.clone(),
                storage_class: self.values.storage_class_name.clone(),
                storage_capacity: Some(Quantity(self.values.storage_capacity.clone())),
                volume_claim_template: Some(format!("{role}-etcd")),
                etcd: EtcdConfig {
                    quota: Some(Quantity("8Gi".into())),
                    defragmentation_schedule: Some(
                        self.values
                            .defragmentation_schedule
                            .clone()
                            .unwrap_or_else(|| "0 3 * * *".into()),
                    ),
                    server_port: Some(PORT_SERVER),
                    client_port: Some(PORT_CLIENT),
                    metrics: Some(metrics.into()),
                    resources: Some(ResourceRequirements {
                        requests: Some(quantities(&[("cpu", "300m"), ("memory", "1G")])),
                        ..Default::default()
                    }),
                },
                backup: self.backup_spec(),
                shared_config: Some(SharedConfig {
                    auto_compaction_mode: Some("periodic".into()),
                    auto_compaction_retention: Some("30m".into()),
                }),
            },
        );
        etcd.metadata.namespace = Some(self.values.namespace.clone());
        etcd.metadata.labels = Some(self.labels());
        etcd.metadata.annotations = Some(BTreeMap::from([
            (ANNOTATION_OPERATION.into(), OPERATION_RECONCILE.into()),
            (ANNOTATION_TIMESTAMP.into(), timestamp.into()),
        ]));
        etcd
    }

    fn target_ref(&self) -> CrossVersionObjectReference {
        CrossVersionObjectReference {
            api_version: Some("apps/v1".into()),
            kind: "StatefulSet".into(),
            name: self.name.clone(),
        }
    }

    fn container_policies(&self) -> Vec<ContainerResourcePolicy> {
        vec![
            ContainerResourcePolicy {
                container_name: CONTAINER_ETCD.into(),
                min_allowed: Some(quantities(&[("cpu", "50m"), ("memory", "200M")])),
                controlled_values: Some("RequestsOnly".into()),
                ..Default::default()
            },
            ContainerResourcePolicy {
                container_name: CONTAINER_BACKUP.into(),
                mode: Some("Off".into()),
                controlled_values: Some("RequestsOnly".into()),
                ..Default::default()
            },
        ]
    }

    pub(crate) fn hvpa(&self, config: &HvpaConfig) -> Hvpa {
        let selector = LabelSelector {
            match_labels: Some(self.selector_labels()),
            match_expressions: None,
        };
        let replicas = self.values.effective_replicas();
        let min_change = BTreeMap::from([
            ("cpu".to_string(), ChangeParams { value: Some("1".into()), percentage: Some(80) }),
            ("memory".to_string(), ChangeParams { value: Some("2G".into()), percentage: Some(80) }),
        ]);
        let scale_down_mode = config
            .scale_down_update_mode
            .clone()
            .unwrap_or_else(|| "MaintenanceWindow".into());

        let mut hvpa = Hvpa::new(
            &self.name,
            HvpaSpec {
                replicas: 1,
                maintenance_time_window: config.maintenance_window.as_ref().map(|w| MaintenanceTimeWindow {
                    begin: w.begin.clone(),
                    end: w.end.clone(),
                }),
                hpa: HpaSpec {
                    selector: selector.clone(),
                    deploy: false,
                    min_replicas: replicas,
                    max_replicas: replicas,
                    target_average_utilization_cpu: 80,
                    target_average_utilization_memory: 80,
                },
                vpa: VpaSpec {
                    selector,
                    deploy: true,
                    scale_up: ScaleParams {
                        update_policy: UpdatePolicy::auto(),
                        stabilization_duration: Some("5m".into()),
                        min_change: Some(min_change.clone()),
                    },
                    scale_down: ScaleParams {
                        update_policy: UpdatePolicy { update_mode: scale_down_mode },
                        stabilization_duration: Some("15m".into()),
                        min_change: Some(min_change),
                    },
                    resource_policy: Some(PodResourcePolicy {
                        container_policies: self.container_policies(),
                    }),
                },
                weight_based_scaling_intervals: vec![WeightBasedScalingInterval {
                    vpa_weight: 100,
                    start_replica_count: replicas,
                    last_replica_count: replicas,
                }],
                target_ref: self.target_ref(),
            },
        );
        hvpa.metadata.namespace = Some(self.values.namespace.clone());
        hvpa.metadata.labels = Some(self.labels());
        hvpa
    }

    pub(crate) fn vpa(&self) -> VerticalPodAutoscaler {
        let mut vpa = vertical_pod_autoscaler(
            &self.vpa_name(),
            &self.values.namespace,
            "StatefulSet",
            &self.name,
            self.container_policies(),
        );
        vpa.metadata.labels = Some(self.labels());
        vpa
    }

    fn etcds(&self) -> Api<Etcd> {
        Api::namespaced(self.client.clone(), &self.values.namespace)
    }

    async fn deploy_autoscaler(&self) -> Result<()> {
        let hvpas = Api::<Hvpa>::namespaced(self.client.clone(), &self.values.namespace);
        let vpas = Api::<VerticalPodAutoscaler>::namespaced(self.client.clone(), &self.values.namespace);

        match self.values.hvpa.as_ref().filter(|hvpa| hvpa.enabled) {
            Some(config) => {
                kubernetes::apply(&hvpas, &self.hvpa(config)).await?;
                kubernetes::delete_if_exists(&vpas, &self.vpa_name()).await
            }
            None => {
                kubernetes::apply(&vpas, &self.vpa()).await?;
                kubernetes::delete_if_exists(&hvpas, &self.name).await
            }
        }
    }

    /// Change the number of members, letting etcd-druid pick it up right away.
    ///
    /// Refuses while a previously requested reconciliation is still pending.
    #[instrument(skip(self), fields(etcd = %self.name))]
    pub async fn scale(&self, replicas: i32) -> Result<()> {
        let etcds = self.etcds();
        let etcd = etcds.get(&self.name).await.map_err(Error::KubeError)?;

        if etcd.annotations().get(ANNOTATION_OPERATION).map(String::as_str) == Some(OPERATION_RECONCILE) {
            return Err(Error::OperationPending(format!(
                "etcd {}/{}",
                self.values.namespace, self.name
            )));
        }

        let patch = Patch::Merge(json!({
            "metadata": {
                "annotations": {
                    ANNOTATION_OPERATION: OPERATION_RECONCILE,
                    ANNOTATION_TIMESTAMP: chrono::Utc::now().to_rfc3339(),
                },
            },
            "spec": { "replicas": replicas },
        }));
        etcds
            .patch(&self.name, &PatchParams::apply(FIELD_MANAGER), &patch)
            .await
            .map_err(Error::KubeError)?;

        info!(replicas, "Scaled etcd");
        Ok(())
    }

    /// Ask the backup sidecar for an immediate full snapshot.
    pub async fn snapshot(&self, http: &reqwest::Client) -> Result<()> {
        if self.values.backup.is_none() {
            return Err(Error::BackupNotConfigured(format!(
                "etcd {}/{}",
                self.values.namespace, self.name
            )));
        }

        let url = format!(
            "http://{}.{}:{PORT_BACKUP}/snapshot/full",
            self.client_service(),
            self.values.namespace
        );
        http.get(&url).send().await?.error_for_status()?;

        info!(etcd = %self.name, "Took full snapshot");
        Ok(())
    }
}

#[async_trait]
impl DeployWaiter for EtcdCluster {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(etcd = %self.name, namespace = %self.values.namespace))]
    async fn deploy(&self) -> Result<(), Error> {
        self.values.validate()?;

        if let Some(policy) = self.network_policy() {
            let policies = Api::<NetworkPolicy>::namespaced(self.client.clone(), &self.values.namespace);
            kubernetes::apply(&policies, &policy).await?;
        }

        let timestamp = chrono::Utc::now().to_rfc3339();
        kubernetes::apply(&self.etcds(), &self.etcd(&timestamp)).await?;
        self.deploy_autoscaler().await
    }

    #[instrument(skip(self), fields(etcd = %self.name, namespace = %self.values.namespace))]
    async fn destroy(&self) -> Result<(), Error> {
        let etcds = self.etcds();
        match kubernetes::annotate(&etcds, &self.name, &[(ANNOTATION_CONFIRM_DELETION, "true")]).await {
            Err(e) if e.is_not_found() => {}
            other => other?,
        }
        kubernetes::delete_if_exists(&etcds, &self.name).await?;

        let namespace = &self.values.namespace;
        kubernetes::delete_if_exists(&Api::<Hvpa>::namespaced(self.client.clone(), namespace), &self.name).await?;
        kubernetes::delete_if_exists(
            &Api::<VerticalPodAutoscaler>::namespaced(self.client.clone(), namespace),
            &self.vpa_name(),
        )
        .await?;
        if self.values.role == Role::Main {
            kubernetes::delete_if_exists(
                &Api::<NetworkPolicy>::namespaced(self.client.clone(), namespace),
                NETWORK_POLICY_NAME,
            )
            .await?;
        }
        Ok(())
    }

    async fn wait(&self) -> Result<(), Error> {
        let etcds = self.etcds();
        let what = format!("etcd {}/{}", self.values.namespace, self.name);

        retry::until_timeout(POLL_INTERVAL, WAIT_TIMEOUT, what.clone(), || {
            let etcds = etcds.clone();
            let what = what.clone();
            async move {
                match kubernetes::get_if_exists(&etcds, &self.name).await {
                    Ok(Some(etcd)) => Outcome::retry_on_error(
                        health::check_etcd(&etcd).map_err(|e| Error::Unhealthy(what, e.to_string())),
                    ),
                    Ok(None) => Outcome::Retry(Error::Unhealthy(what, "not found".into())),
                    Err(e) => Outcome::Retry(e),
                }
            }
        })
        .await
    }

    async fn wait_cleanup(&self) -> Result<(), Error> {
        managedresources::wait_until_gone::<Etcd>(
            self.client.clone(),
            &self.values.namespace,
            &self.name,
            DEFAULT_WAIT_CLEANUP_TIMEOUT,
        )
        .await
    }
}

impl MonitoringComponent for EtcdCluster {
    fn scrape_configs(&self) -> Vec<String> {
        let role = self.values.role.as_str();
        let namespace = &self.values.namespace;
        let service = self.client_service();

        let job = |name: &str, port_name: &str, keep: &str| {
            formatdoc! {r#"
                job_name: {name}
                scheme: https
                tls_config:
                  insecure_skip_verify: true
                  cert_file: /srv/prometheus/etcd-client-tls/tls.crt
                  key_file: /srv/prometheus/etcd-client-tls/tls.key
                kubernetes_sd_configs:
                - role: endpoints
                  namespaces:
                    names: [{namespace}]
                relabel_configs:
                - source_labels:
                  - __meta_kubernetes_service_name
                  - __meta_kubernetes_endpoint_port_name
                  action: keep
                  regex: {service};{port_name}
                - source_labels: [__meta_kubernetes_pod_name]
                  target_label: pod
                - target_label: role
                  replacement: {role}
                metric_relabel_configs:
                - source_labels: [__name__]
                  action: keep
                  regex: ^({keep})$
            "#}
        };

        vec![
            job(
                &format!("kube-etcd3-{role}"),
                "client",
                "etcd_server_has_leader|etcd_server_leader_changes_seen_total|etcd_mvcc_db_total_size_in_bytes|etcd_disk_wal_fsync_duration_seconds_bucket|etcd_disk_backend_commit_duration_seconds_bucket|etcd_network_peer_round_trip_time_seconds_bucket|process_resident_memory_bytes",
            ),
            job(
                &format!("kube-etcd3-backup-restore-{role}"),
                "backupclient",
                "etcdbr_snapshot_duration_seconds_count|etcdbr_snapshot_latest_timestamp|etcdbr_snapshot_required|etcdbr_defragmentation_duration_seconds_count|process_resident_memory_bytes",
            ),
        ]
    }

    fn alerting_rules(&self) -> Vec<(String, String)> {
        let role = self.values.role.as_str();
        let severity = match self.values.role {
            Role::Main => "critical",
            Role::Events => "warning",
        };

        let mut rules = formatdoc! {r#"
            groups:
            - name: kube-etcd3-{role}.rules
              rules:
              - alert: KubeEtcd{title}Down
                expr: sum(up{{job="kube-etcd3-{role}"}}) < {quorum}
                for: 5m
                labels:
                  service: etcd
                  severity: {severity}
                  type: seed
                  visibility: operator
                annotations:
                  description: Etcd3 cluster {role} is unavailable or cannot be scraped. As long as etcd3 {role} is down the cluster is unreachable.
                  summary: Etcd3 {role} cluster down.
              - alert: KubeEtcd3{title}NoLeader
                expr: sum(etcd_server_has_leader{{job="kube-etcd3-{role}"}}) < count(etcd_server_has_leader{{job="kube-etcd3-{role}"}})
                for: 10m
                labels:
                  service: etcd
                  severity: {severity}
                  type: seed
                  visibility: operator
                annotations:
                  description: Etcd3 member of {role} has no leader.
                  summary: Etcd3 {role} has no leader.
              - alert: KubeEtcd3HighCommitDurations
                expr: histogram_quantile(0.99, rate(etcd_disk_backend_commit_duration_seconds_bucket{{job="kube-etcd3-{role}"}}[5m])) > 0.25
                for: 10m
                labels:
                  service: etcd
                  severity: warning
                  type: seed
                  visibility: operator
                annotations:
                  description: Etcd3 {role} 99th percentile commit durations are too high.
                  summary: Etcd3 {role} commit durations are high.
              - alert: KubeEtcd3{title}DbSizeLimitApproaching
                expr: etcd_mvcc_db_total_size_in_bytes{{job="kube-etcd3-{role}"}} > 7516192768
                labels:
                  service: etcd
                  severity: warning
                  type: seed
                  visibility: all
                annotations:
                  description: Etcd3 {role} DB size is approaching its current practical limit of 8GB.
                  summary: Etcd3 {role} DB size is approaching its current practical limit.
            "#,
            title = capitalized(role),
            quorum = self.values.effective_replicas() / 2 + 1,
        };

        if self.values.backup.is_some() {
            let backup_rules = formatdoc! {r#"
                  - alert: KubeEtcdDeltaBackupFailed
                    expr: (time() - etcdbr_snapshot_latest_timestamp{{job="kube-etcd3-backup-restore-{role}",kind="Incr"}} > bool 900) + (etcdbr_snapshot_required{{job="kube-etcd3-backup-restore-{role}",kind="Incr"}} >= bool 1) == 2
                    for: 15m
                    labels:
                      service: etcd
                      severity: critical
                      type: seed
                      visibility: operator
                    annotations:
                      description: No delta snapshot for the past at least 30 minutes taken by backup-restore leader.
                      summary: Etcd delta snapshot failure.
                  - alert: KubeEtcdFullBackupFailed
                    expr: (time() - etcdbr_snapshot_latest_timestamp{{job="kube-etcd3-backup-restore-{role}",kind="Full"}} > bool 86400) + (etcdbr_snapshot_required{{job="kube-etcd3-backup-restore-{role}",kind="Full"}} >= bool 1) == 2
                    for: 15m
                    labels:
                      service: etcd
                      severity: critical
                      type: seed
                      visibility: operator
                    annotations:
                      description: No full snapshot taken in the past day.
                      summary: Etcd full snapshot failure.
            "#};
            // nested below the `rules:` key of the group
            for line in backup_rules.lines() {
                rules.push_str("  ");
                rules.push_str(line);
                rules.push('\n');
            }
        }

        vec![(format!("kube-etcd3-{role}.rules.yaml"), rules)]
    }
}

impl LoggingComponent for EtcdCluster {
    fn logging_parsers(&self) -> String {
        formatdoc! {r#"
            [PARSER]
                Name        etcdParser
                Format      json
                Time_Key    ts
                Time_Format %Y-%m-%dT%H:%M:%S.%L%z

            [PARSER]
                Name        backupRestoreParser
                Format      regex
                Regex       ^time="(?<time>\d{{4}}-\d{{2}}-\d{{2}}T[^"]*)"\s+level=(?<severity>\w+)\smsg="(?<log>.*)"
                Time_Key    time
                Time_Format %Y-%m-%dT%H:%M:%S%z
        "#}
    }

    fn logging_filters(&self) -> String {
        formatdoc! {r#"
            [FILTER]
                Name                parser
                Match               kubernetes.*{name}*{CONTAINER_ETCD}*
                Key_Name            log
                Parser              etcdParser
                Reserve_Data        True

            [FILTER]
                Name                parser
                Match               kubernetes.*{name}*{CONTAINER_BACKUP}*
                Key_Name            log
                Parser              backupRestoreParser
                Reserve_Data        True
        "#,
            name = self.name,
        }
    }
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn capitalized(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
