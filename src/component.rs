use std::time::Duration;

use async_trait::async_trait;

use crate::Error;

/// Default time a component gets to become healthy after being deployed
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default time a component gets to disappear after being destroyed
pub const DEFAULT_WAIT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// A component that can be deployed to and destroyed in a cluster
///
/// `deploy` and `destroy` only submit the desired state; the external controllers
/// acting on it are awaited separately through `wait` and `wait_cleanup`.
#[async_trait]
pub trait DeployWaiter: Send + Sync {
    /// Name of the component, used in logs and metrics.
    fn name(&self) -> &str;

    /// Create or update all objects of this component.
    async fn deploy(&self) -> Result<(), Error>;

    /// Delete all objects of this component.
    async fn destroy(&self) -> Result<(), Error>;

    /// Wait until the deployed objects are reported healthy.
    async fn wait(&self) -> Result<(), Error>;

    /// Wait until the destroyed objects are gone.
    async fn wait_cleanup(&self) -> Result<(), Error>;
}

/// Static monitoring configuration contributed by a component
pub trait MonitoringComponent {
    /// Prometheus scrape configurations, one YAML document each.
    fn scrape_configs(&self) -> Vec<String>;

    /// Prometheus alerting rules, keyed by file name.
    fn alerting_rules(&self) -> Vec<(String, String)>;
}

/// Static logging configuration contributed by a component
pub trait LoggingComponent {
    /// Fluent Bit parser definitions.
    fn logging_parsers(&self) -> String;

    /// Fluent Bit filter definitions.
    fn logging_filters(&self) -> String;
}
