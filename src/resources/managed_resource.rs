use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::LocalObjectReference, apimachinery::pkg::apis::meta::v1::Time,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A bundle of manifests applied and health-checked by the gardener-resource-manager
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "ManagedResource",
    group = "resources.gardener.cloud",
    version = "v1alpha1",
    status = "ManagedResourceStatus",
    doc = "A set of manifests reconciled by the gardener-resource-manager",
    shortname = "mr",
    namespaced,
    printcolumn = r#"{ "name": "class", "type": "string", "description": "resource class", "jsonPath": ".spec.class" }"#,
    printcolumn = r#"{ "name": "applied", "type": "string", "description": "resources applied", "jsonPath": ".status.conditions[?(@.type==\"ResourcesApplied\")].status" }"#,
    printcolumn = r#"{ "name": "healthy", "type": "string", "description": "resources healthy", "jsonPath": ".status.conditions[?(@.type==\"ResourcesHealthy\")].status" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceSpec {
    /// The resource class of the responsible resource manager; absent for the shoot class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    /// Secrets holding the serialized manifests.
    #[serde(default)]
    pub secret_refs: Vec<LocalObjectReference>,

    /// Labels injected into every applied object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inject_labels: Option<BTreeMap<String, String>>,

    /// Whether labels of existing objects are overwritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_overwrite_labels: Option<bool>,

    /// Whether annotations of existing objects are overwritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_overwrite_annotations: Option<bool>,

    /// Whether applied objects survive the deletion of this resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_objects: Option<bool>,

    /// Whether PVCs created by applied StatefulSets are deleted along with them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_persistent_volume_claims: Option<bool>,
}

/// The status reported by the resource manager
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceStatus {
    /// The generation the resource manager last acted on.
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<ManagedResourceCondition>,

    /// The objects currently managed.
    #[serde(default)]
    pub resources: Vec<ManagedObjectReference>,
}

/// A condition of a `ManagedResource`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// One of `True`, `False`, `Unknown` or `Progressing`.
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,
}

/// Reference to an object applied by a `ManagedResource`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedObjectReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Condition types maintained by the resource manager
pub mod conditions {
    pub const RESOURCES_APPLIED: &str = "ResourcesApplied";
    pub const RESOURCES_HEALTHY: &str = "ResourcesHealthy";
    pub const RESOURCES_PROGRESSING: &str = "ResourcesProgressing";
}

impl ManagedResourceStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&ManagedResourceCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}
