use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{ResourceRequirements, SecretReference},
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, Time},
    },
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of an etcd cluster managed by etcd-druid
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Etcd",
    group = "druid.gardener.cloud",
    version = "v1alpha1",
    status = "EtcdStatus",
    doc = "An etcd cluster reconciled by etcd-druid",
    namespaced,
    printcolumn = r#"{ "name": "ready", "type": "string", "description": "etcd readiness", "jsonPath": ".status.ready" }"#,
    printcolumn = r#"{ "name": "replicas", "type": "integer", "description": "desired replicas", "jsonPath": ".spec.replicas" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSpec {
    pub selector: LabelSelector,

    /// Labels put on the pods of the cluster.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_capacity: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<String>,

    pub etcd: EtcdConfig,

    pub backup: BackupSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_config: Option<SharedConfig>,
}

/// Configuration of the etcd container
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defragmentation_schedule: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<i32>,

    /// Either `basic` or `extensive`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Configuration of the backup-restore sidecar
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_snapshot_schedule: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_snapshot_period: Option<String>,

    /// Either `Exponential` or `LimitBased`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garbage_collection_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_election: Option<LeaderElectionSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_check: Option<OwnerCheckSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Location of the backups
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    pub secret_ref: SecretReference,
    pub container: String,
    pub provider: String,
    pub prefix: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_connection_timeout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reelection_period: Option<String>,
}

/// DNS based owner check, stopping backups when the cluster moved elsewhere
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerCheckSpec {
    pub name: String,
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_cache_ttl: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SharedConfig {
    /// Either `periodic` or `revision`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_compaction_mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_compaction_retention: Option<String>,
}

/// The status reported by etcd-druid
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdStatus {
    pub observed_generation: Option<i64>,

    pub ready: Option<bool>,

    pub last_error: Option<String>,

    pub replicas: Option<i32>,

    pub ready_replicas: Option<i32>,

    #[serde(default)]
    pub conditions: Vec<EtcdCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}
