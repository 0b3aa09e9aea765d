use std::time::Duration;

use thiserror::Error;

/// Builds an `ObjectMeta` from the given fields, defaulting the rest.
#[macro_export]
macro_rules! meta {
    ($($lhs:ident : $rhs:expr),* $(,)?) => {{
        ::kube::core::ObjectMeta {
            $($lhs : $rhs,)*

            ..Default::default()
        }
    }};
}

/// Builds the label map used to select the pods of a component.
#[macro_export]
macro_rules! labels {
    (app: $app:expr) => {{
        ::std::collections::BTreeMap::<String, String>::from_iter([
            ("app".to_string(), ::std::string::ToString::to_string(&$app)),
        ])
    }};

    (app: $app:expr, $($lhs:expr => $rhs:expr),* $(,)?) => {{
        ::std::collections::BTreeMap::<String, String>::from_iter([
            ("app".to_string(), ::std::string::ToString::to_string(&$app)),
            $((::std::string::ToString::to_string(&$lhs), ::std::string::ToString::to_string(&$rhs))),*
        ])
    }};
}

/// Expose all deployer components used by main
pub mod component;
pub mod components;
pub mod config;
pub mod deployer;
pub mod resources;

/// Shared plumbing for the components
pub mod health;
pub mod kubernetes;
pub mod managedresources;
pub mod retry;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[cfg(test)]
pub(crate) mod fixtures;

/// Field manager used for every server-side apply.
pub const FIELD_MANAGER: &str = "gardener-deployers";

/// Label key of the gardener role of an object.
pub const LABEL_ROLE: &str = "gardener.cloud/role";
/// Annotation requesting a reconciliation from an external operator.
pub const ANNOTATION_OPERATION: &str = "gardener.cloud/operation";
/// Value of [`ANNOTATION_OPERATION`] requesting a reconciliation.
pub const OPERATION_RECONCILE: &str = "reconcile";
/// Annotation carrying the time of the last requested operation.
pub const ANNOTATION_TIMESTAMP: &str = "gardener.cloud/timestamp";
/// Annotation that must be set before protected objects may be deleted.
pub const ANNOTATION_CONFIRM_DELETION: &str = "confirmation.gardener.cloud/deletion";

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[source] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[source] prometheus::Error),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("timed out after {timeout:?} waiting for {what}{}", .last_error.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    Timeout {
        what: String,
        timeout: Duration,
        last_error: Option<Box<Error>>,
    },

    #[error("{0} is unhealthy: {1}")]
    Unhealthy(String, String),

    #[error("{0} still exists")]
    StillExists(String),

    #[error("IllegalConfig: {0}")]
    IllegalConfig(String),

    #[error("refusing to delete etcd-druid while {0} Etcd resource(s) still exist")]
    EtcdsStillExist(usize),

    #[error("duplicate object in registry: {0}")]
    DuplicateObject(String),

    #[error("backup is not configured for {0}")]
    BackupNotConfigured(String),

    #[error("an operation is already pending on {0}")]
    OperationPending(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        let label = format!("{self:?}").to_lowercase();
        match label.find(|c: char| !c.is_alphanumeric()) {
            Some(end) => label[..end].to_string(),
            None => label,
        }
    }

    /// Whether the error is a `NotFound` answer of the API server.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(e) if kubernetes::is_not_found(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_labels_only_carry_the_variant() {
        let err = Error::Unhealthy("managedresource garden/foo".into(), "not applied".into());
        assert_eq!(err.metric_label(), "unhealthy");

        let err = Error::EtcdsStillExist(3);
        assert_eq!(err.metric_label(), "etcdsstillexist");
    }

    #[test]
    fn timeouts_mention_the_last_error() {
        let err = Error::Timeout {
            what: "etcd shoot--foo/etcd-main".into(),
            timeout: Duration::from_secs(5),
            last_error: Some(Box::new(Error::Unhealthy(
                "etcd shoot--foo/etcd-main".into(),
                "not ready yet".into(),
            ))),
        };
        assert_eq!(
            err.to_string(),
            "timed out after 5s waiting for etcd shoot--foo/etcd-main: etcd shoot--foo/etcd-main is unhealthy: not ready yet"
        );
    }

    #[test]
    fn label_macro_adds_extra_pairs() {
        let labels = labels! { app: "etcd-druid", LABEL_ROLE => "etcd-druid" };
        assert_eq!(labels.get("app").map(String::as_str), Some("etcd-druid"));
        assert_eq!(labels.get(LABEL_ROLE).map(String::as_str), Some("etcd-druid"));
    }
}
