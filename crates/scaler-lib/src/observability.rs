//! Observability for the scaling control loop
//!
//! Provides:
//! - Prometheus metrics (fleet size by state, scaling events, decision
//!   latency, GPU and queue gauges)
//! - Structured JSON logging with tracing

use crate::decision::{ScalingAction, ScalingEvent};
use crate::lifecycle::LifecycleInfo;
use crate::models::AgentRole;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Buckets for decision latency (in seconds)
const DECISION_LATENCY_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<Option<ScalerMetricsInner>> = OnceLock::new();

struct ScalerMetricsInner {
    registry: Registry,
    agents_by_state: IntGaugeVec,
    scaling_events: IntCounterVec,
    decision_latency_seconds: Histogram,
    gpu_memory_utilization_percent: Gauge,
    gpu_utilization_percent: Gauge,
    gpu_free_memory_mb: Gauge,
    queue_length: IntGauge,
    severity_level: IntGauge,
    agents_created: IntCounter,
    agents_terminated: IntCounter,
    creation_failures: IntCounter,
    termination_failures: IntCounter,
    telemetry_errors: IntCounter,
}

impl ScalerMetricsInner {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let agents_by_state = IntGaugeVec::new(
            Opts::new("hive_scaler_agents", "Number of managed agents by lifecycle state"),
            &["state"],
        )?;
        let scaling_events = IntCounterVec::new(
            Opts::new(
                "hive_scaler_scaling_events_total",
                "Scaling events recorded, by action and strategy",
            ),
            &["action", "strategy"],
        )?;
        let decision_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "hive_scaler_decision_latency_seconds",
                "Time spent evaluating the scaling strategy",
            )
            .buckets(DECISION_LATENCY_BUCKETS.to_vec()),
        )?;
        let gpu_memory_utilization_percent = Gauge::new(
            "hive_scaler_gpu_memory_utilization_percent",
            "GPU memory utilization across all devices",
        )?;
        let gpu_utilization_percent = Gauge::new(
            "hive_scaler_gpu_utilization_percent",
            "Mean GPU compute utilization across all devices",
        )?;
        let gpu_free_memory_mb = Gauge::new(
            "hive_scaler_gpu_free_memory_mb",
            "Free GPU memory across all devices",
        )?;
        let queue_length = IntGauge::new(
            "hive_scaler_queue_length",
            "Pending tasks in the latest workload snapshot",
        )?;
        let severity_level = IntGauge::new(
            "hive_scaler_workload_severity_level",
            "Workload severity, 0 for very_low through 5 for critical",
        )?;
        let agents_created = IntCounter::new(
            "hive_scaler_agents_created_total",
            "Agents that reached the active state",
        )?;
        let agents_terminated = IntCounter::new(
            "hive_scaler_agents_terminated_total",
            "Agents that reached the terminated state",
        )?;
        let creation_failures = IntCounter::new(
            "hive_scaler_agent_creation_failures_total",
            "Agent creations that ended in the error state",
        )?;
        let termination_failures = IntCounter::new(
            "hive_scaler_agent_termination_failures_total",
            "Agent teardowns that failed",
        )?;
        let telemetry_errors = IntCounter::new(
            "hive_scaler_telemetry_errors_total",
            "Failed GPU telemetry refreshes",
        )?;

        registry.register(Box::new(agents_by_state.clone()))?;
        registry.register(Box::new(scaling_events.clone()))?;
        registry.register(Box::new(decision_latency_seconds.clone()))?;
        registry.register(Box::new(gpu_memory_utilization_percent.clone()))?;
        registry.register(Box::new(gpu_utilization_percent.clone()))?;
        registry.register(Box::new(gpu_free_memory_mb.clone()))?;
        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(severity_level.clone()))?;
        registry.register(Box::new(agents_created.clone()))?;
        registry.register(Box::new(agents_terminated.clone()))?;
        registry.register(Box::new(creation_failures.clone()))?;
        registry.register(Box::new(termination_failures.clone()))?;
        registry.register(Box::new(telemetry_errors.clone()))?;

        Ok(Self {
            registry,
            agents_by_state,
            scaling_events,
            decision_latency_seconds,
            gpu_memory_utilization_percent,
            gpu_utilization_percent,
            gpu_free_memory_mb,
            queue_length,
            severity_level,
            agents_created,
            agents_terminated,
            creation_failures,
            termination_failures,
            telemetry_errors,
        })
    }
}

/// Scaler metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics. If registration ever fails every call is a
/// no-op.
#[derive(Clone)]
pub struct ScalerMetrics {
    _private: (),
}

impl Default for ScalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(|| match ScalerMetricsInner::new() {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!(error = %e, "Failed to register metrics, exposition disabled");
                None
            }
        });
        Self { _private: () }
    }

    fn inner(&self) -> Option<&'static ScalerMetricsInner> {
        GLOBAL_METRICS.get().and_then(Option::as_ref)
    }

    pub fn set_agents_in_state(&self, state: &str, count: i64) {
        if let Some(m) = self.inner() {
            m.agents_by_state.with_label_values(&[state]).set(count);
        }
    }

    pub fn inc_scaling_event(&self, action: ScalingAction, strategy: &str) {
        if let Some(m) = self.inner() {
            m.scaling_events
                .with_label_values(&[action.as_str(), strategy])
                .inc();
        }
    }

    pub fn observe_decision_latency(&self, duration_secs: f64) {
        if let Some(m) = self.inner() {
            m.decision_latency_seconds.observe(duration_secs);
        }
    }

    pub fn set_gpu(
        &self,
        memory_utilization_percent: f64,
        utilization_percent: f64,
        free_memory_mb: u64,
    ) {
        if let Some(m) = self.inner() {
            m.gpu_memory_utilization_percent.set(memory_utilization_percent);
            m.gpu_utilization_percent.set(utilization_percent);
            m.gpu_free_memory_mb.set(free_memory_mb as f64);
        }
    }

    pub fn set_workload(&self, queue_length: usize, severity_level: i64) {
        if let Some(m) = self.inner() {
            m.queue_length.set(queue_length as i64);
            m.severity_level.set(severity_level);
        }
    }

    pub fn inc_agents_created(&self) {
        if let Some(m) = self.inner() {
            m.agents_created.inc();
        }
    }

    pub fn inc_agents_terminated(&self) {
        if let Some(m) = self.inner() {
            m.agents_terminated.inc();
        }
    }

    pub fn inc_creation_failures(&self) {
        if let Some(m) = self.inner() {
            m.creation_failures.inc();
        }
    }

    pub fn inc_termination_failures(&self) {
        if let Some(m) = self.inner() {
            m.termination_failures.inc();
        }
    }

    pub fn inc_telemetry_errors(&self) {
        if let Some(m) = self.inner() {
            m.telemetry_errors.inc();
        }
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> String {
        let Some(m) = self.inner() else {
            return String::new();
        };

        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&m.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Structured logger for scaling and lifecycle events
///
/// Keeps field names stable so log pipelines can key on `event`.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new("hive-scaler")
    }
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, strategy: &str, min_agents: usize, max_agents: usize) {
        info!(
            event = "scaler_started",
            instance = %self.instance,
            version = %version,
            strategy = %strategy,
            min_agents = min_agents,
            max_agents = max_agents,
            "Scaling control loop started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "scaler_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Scaling control loop shutting down"
        );
    }

    pub fn log_scaling_event(&self, event: &ScalingEvent) {
        info!(
            event = "scaling_event",
            instance = %self.instance,
            action = %event.action,
            strategy = %event.strategy,
            from_count = event.from_count,
            to_count = event.to_count,
            severity = %event.severity,
            queue_length = event.queue_length,
            gpu_memory_utilization = event.gpu_memory_utilization,
            free_memory_mb = event.free_memory_mb,
            success = event.success,
            execution_time_ms = event.execution_time_ms,
            reason = %event.reason,
            "Scaling decision executed"
        );
    }

    pub fn log_agent_created(&self, info: &LifecycleInfo) {
        info!(
            event = "agent_created",
            instance = %self.instance,
            agent_id = %info.agent_id,
            role = %info.role,
            model = %info.model,
            reason = %info.creation_reason,
            "Agent created"
        );
    }

    pub fn log_agent_creation_failed(&self, agent_id: &str, role: AgentRole, error: &str) {
        warn!(
            event = "agent_creation_failed",
            instance = %self.instance,
            agent_id = %agent_id,
            role = %role,
            error = %error,
            "Agent creation failed"
        );
    }

    pub fn log_agent_terminated(&self, agent_id: &str, reason: &str) {
        info!(
            event = "agent_terminated",
            instance = %self.instance,
            agent_id = %agent_id,
            reason = %reason,
            "Agent terminated"
        );
    }

    /// Teardown failures leave a counted agent behind, so they log at error level
    pub fn log_agent_termination_failed(&self, agent_id: &str, reason: &str, error: &str) {
        error!(
            event = "agent_termination_failed",
            instance = %self.instance,
            agent_id = %agent_id,
            reason = %reason,
            error = %error,
            "Agent teardown failed, agent stays counted until reconciled"
        );
    }

    pub fn log_telemetry_status(&self, available: bool, detail: &str) {
        if available {
            info!(
                event = "telemetry_restored",
                instance = %self.instance,
                detail = %detail,
                "GPU telemetry available"
            );
        } else {
            warn!(
                event = "telemetry_lost",
                instance = %self.instance,
                detail = %detail,
                "GPU telemetry unavailable, scaling bounded by fallback ceiling"
            );
        }
    }
}
