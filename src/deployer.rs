use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use kube::Client;
use serde::Serialize;
use tokio::{
    sync::RwLock,
    time::{Interval, MissedTickBehavior},
};
use tracing::{error, field, info, instrument, warn, Span};

use crate::{
    component::{DeployWaiter, LoggingComponent, MonitoringComponent},
    components::{ClusterIdentity, EtcdCluster, EtcdDruid, Istio, NginxIngress, ResourceManager, SeedSystem},
    config::{DeployerConfig, Mode},
    telemetry, Error, Metrics, Result,
};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize, Default)]
pub struct Diagnostics {
    pub last_run: Option<DateTime<Utc>>,
    pub last_mode: Option<Mode>,
    pub last_error: Option<String>,
    pub runs: u64,
}

/// Monitoring and logging configuration collected from the components
#[derive(Clone, Serialize, Default)]
pub struct ObservabilityConfig {
    pub scrape_configs: Vec<String>,
    pub alerting_rules: Vec<(String, String)>,
    pub logging_parsers: Vec<String>,
    pub logging_filters: Vec<String>,
}

impl ObservabilityConfig {
    fn add_monitoring(&mut self, component: &dyn MonitoringComponent) {
        self.scrape_configs.extend(component.scrape_configs());
        self.alerting_rules.extend(component.alerting_rules());
    }

    fn add_logging(&mut self, component: &dyn LoggingComponent) {
        self.logging_parsers.push(component.logging_parsers());
        self.logging_filters.push(component.logging_filters());
    }
}

/// State shared between the deployer and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the deployer
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Static observability configuration of the deployed components
    observability: Arc<RwLock<ObservabilityConfig>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub async fn observability(&self) -> ObservabilityConfig {
        self.observability.read().await.clone()
    }
}

type Phase = Vec<Box<dyn DeployWaiter>>;

/// Rolls out or tears down every configured component
///
/// Components are grouped in phases. A phase is only deployed once the previous
/// one is healthy, and destroyed only once the following one is gone: the
/// resource manager applies every managed resource, and etcd-druid owns the
/// `Etcd` resources of the etcd clusters.
pub struct Deployer {
    config: DeployerConfig,
    state: State,
    metrics: Metrics,
    phases: Vec<Phase>,
}

impl Deployer {
    pub async fn new(client: Client, config: DeployerConfig, state: State) -> Result<Self> {
        let metrics = Metrics::default()
            .register(&state.registry)
            .map_err(Error::MetricsError)?;

        let mut observability = ObservabilityConfig::default();

        let resource_manager = ResourceManager::new(client.clone(), config.resource_manager.clone());
        observability.add_logging(&resource_manager);
        let mut phases: Vec<Phase> = vec![vec![Box::new(resource_manager)]];

        if let Some(values) = &config.etcd_druid {
            phases.push(vec![Box::new(EtcdDruid::new(client.clone(), values.clone()))]);
        }

        let mut rest: Phase = Vec::new();
        if let Some(values) = &config.cluster_identity {
            rest.push(Box::new(ClusterIdentity::new(client.clone(), values.clone())));
        }
        if let Some(values) = &config.seed_system {
            rest.push(Box::new(SeedSystem::new(client.clone(), values.clone())));
        }
        for values in &config.etcds {
            let etcd = EtcdCluster::new(client.clone(), values.clone());
            observability.add_monitoring(&etcd);
            observability.add_logging(&etcd);
            rest.push(Box::new(etcd));
        }
        if let Some(values) = &config.istio {
            rest.push(Box::new(Istio::new(client.clone(), values.clone())));
        }
        if let Some(values) = &config.nginx_ingress {
            let nginx = NginxIngress::new(client.clone(), values.clone());
            observability.add_monitoring(&nginx);
            observability.add_logging(&nginx);
            rest.push(Box::new(nginx));
        }
        if !rest.is_empty() {
            phases.push(rest);
        }

        *state.observability.write().await = observability;

        Ok(Self {
            config,
            state,
            metrics,
            phases,
        })
    }

    /// Names of the components per phase, in deployment order
    pub fn plan(&self) -> Vec<Vec<String>> {
        self.phases
            .iter()
            .map(|phase| phase.iter().map(|c| c.name().to_string()).collect())
            .collect()
    }

    fn observe(&self, component: &dyn DeployWaiter, operation: &str, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            warn!(component = component.name(), operation, error = %e, "Component operation failed");
            self.metrics.component_failure(component.name(), e);
        }
        result
    }

    async fn record(&self, mode: Mode, result: &Result<()>) {
        let mut diagnostics = self.state.diagnostics.write().await;
        diagnostics.last_run = Some(Utc::now());
        diagnostics.last_mode = Some(mode);
        diagnostics.last_error = result.as_ref().err().map(ToString::to_string);
        diagnostics.runs += 1;
    }

    /// Deploy every phase and wait for it to become healthy before starting the next.
    #[instrument(skip(self), fields(trace_id))]
    pub async fn deploy_all(&self) -> Result<()> {
        Span::current().record("trace_id", &field::display(&telemetry::get_trace_id()));
        let _timer = self.metrics.count_and_measure("deploy");

        let result = async {
            for phase in &self.phases {
                try_join_all(phase.iter().map(|c| async move {
                    let result = c.deploy().await;
                    self.observe(c.as_ref(), "deploy", result)
                }))
                .await?;
                try_join_all(phase.iter().map(|c| async move {
                    let result = c.wait().await;
                    self.observe(c.as_ref(), "wait", result)
                }))
                .await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        self.record(Mode::Deploy, &result).await;
        if result.is_ok() {
            info!(components = self.phases.iter().map(Vec::len).sum::<usize>(), "Deployed all components");
        }
        result
    }

    /// Destroy every phase in reverse order, waiting for each to be gone before the previous.
    #[instrument(skip(self), fields(trace_id))]
    pub async fn destroy_all(&self) -> Result<()> {
        Span::current().record("trace_id", &field::display(&telemetry::get_trace_id()));
        let _timer = self.metrics.count_and_measure("destroy");

        let result = async {
            for phase in self.phases.iter().rev() {
                try_join_all(phase.iter().map(|c| async move {
                    let result = c.destroy().await;
                    self.observe(c.as_ref(), "destroy", result)
                }))
                .await?;
                try_join_all(phase.iter().map(|c| async move {
                    let result = c.wait_cleanup().await;
                    self.observe(c.as_ref(), "wait_cleanup", result)
                }))
                .await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        self.record(Mode::Destroy, &result).await;
        if result.is_ok() {
            info!("Destroyed all components");
        }
        result
    }

    /// Ticks for the deploy loop; a run outlasting the interval delays the next one.
    fn reconcile_interval(&self) -> Interval {
        let mut interval = tokio::time::interval(self.config.reconcile_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    /// Deploy on every reconcile interval, or destroy once, until interrupted.
    pub async fn run(self) -> Result<()> {
        if self.config.mode == Mode::Destroy {
            return tokio::select! {
                result = self.destroy_all() => result,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted while destroying components");
                    Ok(())
                }
            };
        }

        let mut interval = self.reconcile_interval();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // failed runs are retried on the next tick
                    if let Err(e) = self.deploy_all().await {
                        error!("deploy failed: {e}");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                    return Ok(());
                }
            }
        }
    }
}
