use std::collections::BTreeMap;

use k8s_openapi::{
    api::autoscaling::v1::CrossVersionObjectReference,
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::LabelSelector,
    },
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Vertical pod autoscaler of the autoscaler project
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "VerticalPodAutoscaler",
    group = "autoscaling.k8s.io",
    version = "v1",
    doc = "Recommends and applies resource requests for a workload",
    shortname = "vpa",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VerticalPodAutoscalerSpec {
    pub target_ref: CrossVersionObjectReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<UpdatePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<PodResourcePolicy>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicy {
    /// One of `Off`, `Initial`, `Recreate` or `Auto`.
    pub update_mode: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodResourcePolicy {
    #[serde(default)]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    pub container_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_allowed: Option<BTreeMap<String, Quantity>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allowed: Option<BTreeMap<String, Quantity>>,

    /// Either `RequestsOnly` or `RequestsAndLimits`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlled_values: Option<String>,

    /// Either `Auto` or `Off`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl UpdatePolicy {
    pub fn auto() -> Self {
        Self {
            update_mode: "Auto".into(),
        }
    }
}

/// Horizontal and vertical pod autoscaler combining both recommendations
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "Hvpa",
    group = "autoscaling.k8s.io",
    version = "v1alpha1",
    doc = "Scales a workload horizontally and vertically in weighted intervals",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HvpaSpec {
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_time_window: Option<MaintenanceTimeWindow>,

    pub hpa: HpaSpec,

    pub vpa: VpaSpec,

    #[serde(default)]
    pub weight_based_scaling_intervals: Vec<WeightBasedScalingInterval>,

    pub target_ref: CrossVersionObjectReference,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceTimeWindow {
    pub begin: String,
    pub end: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HpaSpec {
    pub selector: LabelSelector,
    pub deploy: bool,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub target_average_utilization_cpu: i32,
    pub target_average_utilization_memory: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VpaSpec {
    pub selector: LabelSelector,
    pub deploy: bool,
    pub scale_up: ScaleParams,
    pub scale_down: ScaleParams,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<PodResourcePolicy>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleParams {
    pub update_policy: UpdatePolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stabilization_duration: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_change: Option<BTreeMap<String, ChangeParams>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeightBasedScalingInterval {
    pub vpa_weight: i32,
    pub start_replica_count: i32,
    pub last_replica_count: i32,
}
