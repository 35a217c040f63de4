//! Observability for harbor workflows
//!
//! Provides:
//! - Prometheus metrics (workflow durations, deploys, route swaps, failures)
//! - Structured logging of workflow events with tracing

use crate::models::WorkloadKind;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for workflow durations (in seconds)
const DURATION_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0];

static GLOBAL_METRICS: OnceLock<HarborMetricsInner> = OnceLock::new();

struct HarborMetricsInner {
    workflow_duration_seconds: HistogramVec,
    deploys: IntCounter,
    undeploys: IntCounter,
    route_swaps: IntCounter,
    workload_failures: IntCounterVec,
    containers_stopped: IntCounter,
}

impl HarborMetricsInner {
    fn new() -> Self {
        Self {
            workflow_duration_seconds: register_histogram_vec!(
                "harbor_workflow_duration_seconds",
                "Wall-clock time of each workflow run",
                &["workflow"],
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register workflow_duration_seconds"),

            deploys: register_int_counter!(
                "harbor_deploys_total",
                "Successful model deployments"
            )
            .expect("Failed to register deploys_total"),

            undeploys: register_int_counter!(
                "harbor_undeploys_total",
                "Deployment containers stopped by undeploy"
            )
            .expect("Failed to register undeploys_total"),

            route_swaps: register_int_counter!(
                "harbor_route_swaps_total",
                "Routing-table updates applied to the reverse proxy"
            )
            .expect("Failed to register route_swaps_total"),

            workload_failures: register_int_counter_vec!(
                "harbor_workload_failures_total",
                "Workflow runs that ended in an error",
                &["workflow"]
            )
            .expect("Failed to register workload_failures_total"),

            containers_stopped: register_int_counter!(
                "harbor_containers_stopped_total",
                "Containers stopped by harbor"
            )
            .expect("Failed to register containers_stopped_total"),
        }
    }
}

/// Handle to the process-wide metrics. Clones share the same metrics.
#[derive(Clone)]
pub struct HarborMetrics {
    _private: (),
}

impl Default for HarborMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HarborMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(HarborMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &HarborMetricsInner {
        GLOBAL_METRICS.get_or_init(HarborMetricsInner::new)
    }

    pub fn observe_workflow(&self, kind: WorkloadKind, duration_secs: f64) {
        self.inner()
            .workflow_duration_seconds
            .with_label_values(&[kind.as_str()])
            .observe(duration_secs);
    }

    /// Record an undeploy; undeploys are not a [`WorkloadKind`]
    pub fn observe_undeploy(&self, duration_secs: f64) {
        self.inner()
            .workflow_duration_seconds
            .with_label_values(&["undeploy"])
            .observe(duration_secs);
    }

    pub fn inc_deploys(&self) {
        self.inner().deploys.inc();
    }

    pub fn inc_undeploys(&self, count: u64) {
        self.inner().undeploys.inc_by(count);
    }

    pub fn inc_route_swaps(&self) {
        self.inner().route_swaps.inc();
    }

    pub fn inc_workload_failures(&self, kind: WorkloadKind) {
        self.inner()
            .workload_failures
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_containers_stopped(&self) {
        self.inner().containers_stopped.inc();
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
            warn!(error = %err, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Event-named log lines for harbor workflows
#[derive(Clone)]
pub struct StructuredLogger {
    project_id: String,
}

impl StructuredLogger {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }

    pub fn log_workflow_started(&self, kind: WorkloadKind, name: &str, container: &str) {
        info!(
            event = "workflow_started",
            project_id = %self.project_id,
            workflow = kind.as_str(),
            name = %name,
            container = %container,
            "Workflow started"
        );
    }

    pub fn log_workflow_finished(&self, kind: WorkloadKind, name: &str, duration_secs: f64) {
        info!(
            event = "workflow_finished",
            project_id = %self.project_id,
            workflow = kind.as_str(),
            name = %name,
            duration_secs,
            "Workflow finished"
        );
    }

    pub fn log_workflow_failed(&self, kind: WorkloadKind, name: &str, error: &str) {
        warn!(
            event = "workflow_failed",
            project_id = %self.project_id,
            workflow = kind.as_str(),
            name = %name,
            error = %error,
            "Workflow failed"
        );
    }

    pub fn log_route_swap(&self, model: &str, from: Option<&str>, to: &str, address: &str) {
        info!(
            event = "route_swapped",
            project_id = %self.project_id,
            model = %model,
            from = ?from,
            to = %to,
            address = %address,
            "Route swapped to new deployment"
        );
    }

    pub fn log_undeploy(&self, model: &str, version: u32) {
        info!(
            event = "model_undeployed",
            project_id = %self.project_id,
            model = %model,
            version,
            "Model undeployed"
        );
    }

    pub fn log_nothing_deployed(&self, model: &str) {
        info!(
            event = "undeploy_skipped",
            project_id = %self.project_id,
            model = %model,
            "No running endpoint for model"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration_is_shared() {
        let a = HarborMetrics::new();
        let b = HarborMetrics::new();
        a.inc_deploys();
        b.inc_route_swaps();
        a.observe_workflow(WorkloadKind::Train, 1.5);
        b.inc_workload_failures(WorkloadKind::RefreshData);

        let text = a.render();
        assert!(text.contains("harbor_deploys_total"));
        assert!(text.contains("harbor_route_swaps_total"));
        assert!(text.contains("workflow=\"train\""));
        assert!(text.contains("workflow=\"refresh_data\""));
    }

    #[test]
    fn test_structured_logger() {
        let logger = StructuredLogger::new("abc");
        logger.log_workflow_started(WorkloadKind::Deploy, "iris", "harborml_default:latest");
        logger.log_route_swap("iris", Some("deploy-abc-iris-0"), "deploy-abc-iris-1", "172.17.0.3:5000");
        logger.log_undeploy("iris", 1);
    }
}
