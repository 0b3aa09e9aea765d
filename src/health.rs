//! Health predicates over the status of objects reconciled by external controllers.
//!
//! Every check returns the first problem found as a human readable message, so
//! that a timed out wait can report why the object never became healthy.

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use thiserror::Error;

use crate::{
    resources::{conditions, Etcd, ManagedResource},
    ANNOTATION_OPERATION, OPERATION_RECONCILE,
};

/// The first reason an object is not healthy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HealthError(pub String);

fn unhealthy<T>(message: impl Into<String>) -> Result<T, HealthError> {
    Err(HealthError(message.into()))
}

fn check_observed_generation(
    generation: Option<i64>,
    observed: Option<i64>,
) -> Result<(), HealthError> {
    match (generation, observed) {
        (_, None) => unhealthy("status has not been reported yet"),
        (Some(generation), Some(observed)) if observed < generation => unhealthy(format!(
            "observed generation outdated ({observed}/{generation})"
        )),
        _ => Ok(()),
    }
}

/// Whether the resource manager applied every manifest and found them healthy.
pub fn check_managed_resource(mr: &ManagedResource) -> Result<(), HealthError> {
    let Some(status) = mr.status.as_ref() else {
        return unhealthy("status has not been reported yet");
    };
    check_observed_generation(mr.metadata.generation, status.observed_generation)?;

    for required in [conditions::RESOURCES_APPLIED, conditions::RESOURCES_HEALTHY] {
        match status.condition(required) {
            None => return unhealthy(format!("condition {required} is missing")),
            Some(c) if c.status != "True" => {
                return unhealthy(format!(
                    "condition {required} has status {} ({}): {}",
                    c.status, c.reason, c.message
                ))
            }
            Some(_) => {}
        }
    }

    if let Some(c) = status.condition(conditions::RESOURCES_PROGRESSING) {
        if c.status == "True" {
            return unhealthy(format!(
                "condition {} has status True ({}): {}",
                conditions::RESOURCES_PROGRESSING,
                c.reason,
                c.message
            ));
        }
    }

    Ok(())
}

/// Whether a deployment finished rolling out and is available.
pub fn check_deployment(deployment: &Deployment) -> Result<(), HealthError> {
    let Some(status) = deployment.status.as_ref() else {
        return unhealthy("status has not been reported yet");
    };
    check_observed_generation(deployment.metadata.generation, status.observed_generation)?;

    let conditions = status.conditions.as_deref().unwrap_or_default();
    match conditions.iter().find(|c| c.type_ == "Available") {
        None => return unhealthy("condition Available is missing"),
        Some(c) if c.status != "True" => {
            return unhealthy(format!(
                "deployment is not available: {}",
                c.message.as_deref().unwrap_or_default()
            ))
        }
        Some(_) => {}
    }
    if let Some(c) = conditions.iter().find(|c| c.type_ == "Progressing") {
        if c.status == "False" {
            return unhealthy(format!(
                "deployment is not progressing: {}",
                c.message.as_deref().unwrap_or_default()
            ));
        }
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or_default();
    let available = status.available_replicas.unwrap_or_default();
    if updated < desired {
        return unhealthy(format!("only {updated}/{desired} replicas are updated"));
    }
    if available < desired {
        return unhealthy(format!("only {available}/{desired} replicas are available"));
    }

    Ok(())
}

/// Whether etcd-druid picked up the latest spec and reports the cluster ready.
pub fn check_etcd(etcd: &Etcd) -> Result<(), HealthError> {
    if etcd.annotations().get(ANNOTATION_OPERATION).map(String::as_str)
        == Some(OPERATION_RECONCILE)
    {
        return unhealthy("reconciliation has not been picked up yet");
    }

    let Some(status) = etcd.status.as_ref() else {
        return unhealthy("status has not been reported yet");
    };
    check_observed_generation(etcd.metadata.generation, status.observed_generation)?;

    if let Some(last_error) = &status.last_error {
        return unhealthy(format!("last reconciliation failed: {last_error}"));
    }
    if status.ready != Some(true) {
        return unhealthy("etcd is not ready yet");
    }

    Ok(())
}
