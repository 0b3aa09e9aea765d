//! Deployers of the individual seed and control plane components.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        autoscaling::v1::CrossVersionObjectReference,
        core::v1::{EnvVar, EnvVarSource, ObjectFieldSelector, ServiceAccount},
        policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec},
    },
    apimachinery::pkg::{
        api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString,
    },
};

use crate::{
    meta,
    resources::{
        ContainerResourcePolicy, PodResourcePolicy, UpdatePolicy, VerticalPodAutoscaler,
        VerticalPodAutoscalerSpec,
    },
};

pub mod cluster_identity;
pub mod etcd;
pub mod etcd_druid;
pub mod istio;
pub mod nginx_ingress;
pub mod resource_manager;
pub mod seed_system;

pub use cluster_identity::ClusterIdentity;
pub use etcd::EtcdCluster;
pub use etcd_druid::EtcdDruid;
pub use istio::Istio;
pub use nginx_ingress::NginxIngress;
pub use resource_manager::ResourceManager;
pub use seed_system::SeedSystem;

/// A service account without token automount
pub(crate) fn service_account(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
) -> ServiceAccount {
    ServiceAccount {
        metadata: meta! {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            labels: Some(labels)
        },
        automount_service_account_token: Some(false),

        ..Default::default()
    }
}

/// A disruption budget allowing one unavailable pod at a time
pub(crate) fn pod_disruption_budget(
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: meta! {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            labels: Some(labels.clone())
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(labels),
                match_expressions: None,
            }),

            ..Default::default()
        }),
        status: None,
    }
}

/// A VPA in `Auto` mode for a deployment or statefulset
pub(crate) fn vertical_pod_autoscaler(
    name: &str,
    namespace: &str,
    target_kind: &str,
    target_name: &str,
    container_policies: Vec<ContainerResourcePolicy>,
) -> VerticalPodAutoscaler {
    let mut vpa = VerticalPodAutoscaler::new(
        name,
        VerticalPodAutoscalerSpec {
            target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".into()),
                kind: target_kind.into(),
                name: target_name.into(),
            },
            update_policy: Some(UpdatePolicy::auto()),
            resource_policy: (!container_policies.is_empty()).then(|| PodResourcePolicy {
                container_policies,
            }),
        },
    );
    vpa.metadata.namespace = Some(namespace.into());
    vpa
}

/// A container policy only bounding the recommendations from below
pub(crate) fn min_allowed(container: &str, resources: &[(&str, &str)]) -> ContainerResourcePolicy {
    ContainerResourcePolicy {
        container_name: container.into(),
        min_allowed: Some(quantities(resources)),

        ..Default::default()
    }
}

/// Resource requests as a quantity map
pub(crate) fn quantities(resources: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    resources
        .iter()
        .map(|(name, value)| (name.to_string(), Quantity(value.to_string())))
        .collect()
}

/// An environment variable with a fixed value
pub(crate) fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        value_from: None,
    }
}

/// An environment variable taken from a field of the pod
pub(crate) fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.into(),
                api_version: None,
            }),
            ..Default::default()
        }),
        value: None,
    }
}
