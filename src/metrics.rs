use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

use crate::Error;

/// Prometheus metrics of the deploy and destroy runs
#[derive(Clone)]
pub struct Metrics {
    pub runs: IntCounter,
    pub failures: IntCounterVec,
    pub run_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let run_duration = HistogramVec::new(
            histogram_opts!(
                "gardener_deployers_run_duration_seconds",
                "The duration of a deploy or destroy run in seconds"
            )
            .buckets(vec![0.5, 1., 5., 15., 30., 60., 120., 300., 600.]),
            &["operation"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "gardener_deployers_component_failures_total",
                "component operations that failed"
            ),
            &["component", "error"],
        )
        .unwrap();
        let runs = IntCounter::new("gardener_deployers_runs_total", "runs").unwrap();
        Metrics {
            runs,
            failures,
            run_duration,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.run_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.runs.clone()))?;
        Ok(self)
    }

    pub fn component_failure(&self, component: &str, e: &Error) {
        self.failures
            .with_label_values(&[component, e.metric_label().as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self, operation: &str) -> RunMeasurer {
        self.runs.inc();
        RunMeasurer {
            start: Instant::now(),
            metric: self.run_duration.with_label_values(&[operation]),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct RunMeasurer {
    start: Instant,
    metric: prometheus::Histogram,
}

impl Drop for RunMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}
