//! Control loop: wires the components together and runs their tasks
//!
//! Owns no scaling logic. Each tick it feeds the latest telemetry and
//! workload view to the engine and turns the verdict into lifecycle
//! requests.

use crate::config::ScalerConfig;
use crate::decision::{Decision, Notifier, ScalingAction, ScalingEngine, ScalingEvent};
use crate::error::Result;
use crate::gpu::{create_probe, GpuSummary, HostSampler, ModelProfiles, ResourceMonitor};
use crate::health::{components, HealthRegistry};
use crate::lifecycle::{
    AgentFactory, LifecycleManager, LifecycleSettings, LifecycleState, RequestTicket, RolePlanner,
};
use crate::observability::{ScalerMetrics, StructuredLogger};
use crate::status::{AgentSummary, StatusReport};
use crate::workload::WorkloadCollector;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Snapshot age, in collection intervals, after which the collector is stale
const STALE_SNAPSHOT_INTERVALS: u32 = 3;

/// Composition root of the scaling core
pub struct ControlLoop {
    config: ScalerConfig,
    monitor: Arc<ResourceMonitor>,
    collector: Arc<WorkloadCollector>,
    engine: Arc<ScalingEngine>,
    lifecycle: Arc<LifecycleManager>,
    planner: RolePlanner,
    health: HealthRegistry,
    metrics: ScalerMetrics,
    logger: StructuredLogger,
    telemetry_available: AtomicBool,
}

impl ControlLoop {
    pub fn new(
        config: ScalerConfig,
        monitor: Arc<ResourceMonitor>,
        collector: Arc<WorkloadCollector>,
        engine: Arc<ScalingEngine>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            planner: RolePlanner::new(config.drones_per_sub_queen),
            telemetry_available: AtomicBool::new(monitor.summary().available),
            config,
            monitor,
            collector,
            engine,
            lifecycle,
            health: HealthRegistry::new(),
            metrics: ScalerMetrics::new(),
            logger: StructuredLogger::default(),
        }
    }

    /// Build every component from configuration
    ///
    /// Detects the GPU vendor, samples host load with `sysinfo` and logs
    /// each scaling event before handing it to `notifier`.
    pub async fn from_config(
        config: ScalerConfig,
        factory: Arc<dyn AgentFactory>,
        notifier: Option<Notifier>,
    ) -> Result<Self> {
        Self::from_config_with_logger(config, factory, notifier, StructuredLogger::default()).await
    }

    pub async fn from_config_with_logger(
        config: ScalerConfig,
        factory: Arc<dyn AgentFactory>,
        notifier: Option<Notifier>,
        logger: StructuredLogger,
    ) -> Result<Self> {
        config.validate()?;

        let probe = create_probe(config.probe_timeout()).await;
        let monitor = Arc::new(ResourceMonitor::new(probe, config.monitor_interval()));
        // Populate the device list before the first decision
        if let Err(e) = monitor.refresh().await {
            debug!(error = %e, "Initial GPU refresh failed");
        }

        let collector =
            Arc::new(WorkloadCollector::new(&config).with_host_sampler(HostSampler::new()));

        let profiles = ModelProfiles::builtin().with_overrides(config.model_profiles.clone());
        let event_logger = logger.clone();
        let engine =
            ScalingEngine::new(&config, &profiles).with_notifier(move |event: &ScalingEvent| {
                event_logger.log_scaling_event(event);
                if let Some(notify) = &notifier {
                    notify(event);
                }
            });

        let lifecycle = LifecycleManager::new(factory, LifecycleSettings::from_config(&config))
            .with_collector(collector.clone())
            .with_logger(logger.clone());

        Ok(Self::new(
            config,
            monitor,
            collector,
            Arc::new(engine),
            Arc::new(lifecycle),
        )
        .with_logger(logger))
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn config(&self) -> &ScalerConfig {
        &self.config
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn metrics(&self) -> &ScalerMetrics {
        &self.metrics
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn collector(&self) -> &Arc<WorkloadCollector> {
        &self.collector
    }

    pub fn engine(&self) -> &Arc<ScalingEngine> {
        &self.engine
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// One decision tick
    ///
    /// Scale-up and scale-down verdicts become queued lifecycle requests;
    /// the queue worker executes them. The scaling event is recorded once
    /// every request of the verdict has run.
    pub async fn run_decision_cycle(&self) -> Decision {
        let started = Instant::now();

        self.lifecycle.sync_activity().await;
        self.monitor.set_agent_count(self.lifecycle.agent_count().await);
        let current = self.lifecycle.effective_count().await;

        let gpu = self.monitor.summary();
        self.track_telemetry(&gpu).await;
        let workload = self.collector.view(Utc::now());

        let decision = self.engine.decide(current, &gpu, &workload);
        self.metrics
            .observe_decision_latency(started.elapsed().as_secs_f64());
        self.metrics.set_gpu(
            gpu.memory_utilization_percent,
            gpu.utilization_percent,
            gpu.free_memory_mb,
        );
        self.metrics
            .set_workload(workload.latest.queue_length, workload.severity.level());

        let (wanted, tickets) = match decision.action {
            ScalingAction::Maintain => {
                debug!(agents = current, reason = %decision.reason, "Maintaining fleet");
                (0, Vec::new())
            }
            ScalingAction::ScaleUp => {
                let wanted = decision.target_count.saturating_sub(current);
                let roles = self
                    .planner
                    .plan(&self.lifecycle.planned_roles().await, wanted);
                let tickets = roles
                    .iter()
                    .map(|role| {
                        self.lifecycle
                            .request_creation(*role, self.config.model_for(*role), "scale_up")
                    })
                    .collect();
                (wanted, tickets)
            }
            ScalingAction::ScaleDown => {
                let excess = current.saturating_sub(decision.target_count);
                let victims = self.lifecycle.select_for_termination(excess).await;
                if victims.len() < excess {
                    warn!(
                        wanted = excess,
                        selected = victims.len(),
                        "Not enough idle or active agents to retire"
                    );
                }
                let tickets = victims
                    .iter()
                    .map(|agent_id| self.lifecycle.request_termination(agent_id, "scale_down"))
                    .collect();
                (excess, tickets)
            }
        };

        if wanted > 0 {
            let event = ScalingEvent::new(self.engine.kind(), &decision, current, &gpu, &workload);
            tokio::spawn(settle_event(
                self.engine.clone(),
                self.metrics.clone(),
                event,
                wanted,
                tickets,
                started,
            ));
        }

        self.lifecycle.publish_metrics().await;
        self.update_health().await;

        decision
    }

    async fn track_telemetry(&self, gpu: &GpuSummary) {
        let was_available = self.telemetry_available.swap(gpu.available, Ordering::Relaxed);
        let detail = gpu.last_error.as_deref().unwrap_or("");

        if was_available != gpu.available {
            self.logger.log_telemetry_status(gpu.available, detail);
        }

        if gpu.available && gpu.last_error.is_none() {
            self.health.set_healthy(components::RESOURCE_MONITOR).await;
        } else if gpu.available {
            self.health
                .set_degraded(
                    components::RESOURCE_MONITOR,
                    format!("last refresh failed: {}", detail),
                )
                .await;
        } else {
            self.health
                .set_degraded(
                    components::RESOURCE_MONITOR,
                    format!("GPU telemetry unavailable: {}", detail),
                )
                .await;
        }
    }

    async fn update_health(&self) {
        self.health.set_healthy(components::DECISION_ENGINE).await;

        let stale_after = self.config.collection_interval() * STALE_SNAPSHOT_INTERVALS;
        match self.collector.latest_snapshot() {
            Some(snapshot)
                if (Utc::now() - snapshot.timestamp)
                    .to_std()
                    .map(|age| age > stale_after)
                    .unwrap_or(false) =>
            {
                self.health
                    .set_degraded(components::WORKLOAD_COLLECTOR, "workload snapshot is stale")
                    .await;
            }
            _ => self.health.set_healthy(components::WORKLOAD_COLLECTOR).await,
        }

        let status = self.lifecycle.detailed_status().await;
        let leaked = status
            .agents
            .iter()
            .filter(|a| a.state == LifecycleState::Error && a.is_counted())
            .count();
        if leaked > 0 {
            self.health
                .set_degraded(
                    components::LIFECYCLE_MANAGER,
                    format!("{} agents failed teardown and still hold resources", leaked),
                )
                .await;
        } else {
            self.health.set_healthy(components::LIFECYCLE_MANAGER).await;
        }
    }

    /// Gather the status report with the last `events` scaling events
    pub async fn status(&self, events: usize) -> StatusReport {
        let lifecycle = self.lifecycle.detailed_status().await;

        StatusReport {
            generated_at: Utc::now(),
            strategy: self.engine.kind(),
            agent_count: lifecycle.counted_agents,
            effective_agent_count: lifecycle.effective_agents,
            pending_creations: lifecycle.pending_creations,
            pending_terminations: lifecycle.pending_terminations,
            agents: lifecycle.agents.iter().map(AgentSummary::from).collect(),
            recent_events: self.engine.recent_events(events),
            severity: self.collector.severity(),
            latest_snapshot: self.collector.latest_snapshot(),
            gpu: self.monitor.summary(),
            cooldown: self.engine.cooldown(),
        }
    }

    async fn run_decisions(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.scale_check_interval();
        info!(
            interval_secs = period.as_secs(),
            strategy = %self.engine.kind(),
            "Starting scaling decision loop"
        );
        let mut ticker = interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let decision = self.run_decision_cycle().await;
                    debug!(
                        action = %decision.action,
                        target = decision.target_count,
                        "Decision cycle complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down scaling decision loop");
                    break;
                }
            }
        }
    }

    /// Spawn all periodic tasks
    pub async fn start(self: Arc<Self>) -> ControlHandle {
        let (shutdown, _) = broadcast::channel(1);

        self.health.register_all().await;
        if !self.monitor.summary().available {
            self.health
                .set_degraded(components::RESOURCE_MONITOR, "GPU telemetry unavailable")
                .await;
        }

        let tasks = vec![
            tokio::spawn(self.monitor.clone().run(shutdown.subscribe())),
            tokio::spawn(self.collector.clone().run(shutdown.subscribe())),
            tokio::spawn(self.lifecycle.clone().run_queue_worker(shutdown.subscribe())),
            tokio::spawn(self.lifecycle.clone().run_cleanup_loop(shutdown.subscribe())),
            tokio::spawn(self.clone().run_decisions(shutdown.subscribe())),
        ];

        self.logger.log_startup(
            VERSION,
            self.engine.kind().as_str(),
            self.config.min_agents,
            self.config.max_agents,
        );
        self.health.set_ready(true).await;

        ControlHandle {
            control: self,
            shutdown,
            tasks,
        }
    }
}

/// Record `event` once every ticket of its verdict has resolved
///
/// `to_count` becomes the count actually reached; the event succeeds only
/// when all `wanted` changes were made.
async fn settle_event(
    engine: Arc<ScalingEngine>,
    metrics: ScalerMetrics,
    mut event: ScalingEvent,
    wanted: usize,
    tickets: Vec<RequestTicket>,
    started: Instant,
) {
    let mut completed = 0;
    for ticket in tickets {
        if ticket.outcome().await {
            completed += 1;
        }
    }

    event.to_count = match event.action {
        ScalingAction::ScaleDown => event.from_count.saturating_sub(completed),
        _ => event.from_count + completed,
    };
    let event = event.with_outcome(completed == wanted, started.elapsed());
    if !event.success {
        warn!(
            action = %event.action,
            wanted,
            completed,
            "Scaling verdict only partly executed"
        );
    }

    metrics.inc_scaling_event(event.action, event.strategy.as_str());
    engine.record_event(event);
}

/// Handle to a running control loop
pub struct ControlHandle {
    control: Arc<ControlLoop>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlHandle {
    pub fn control(&self) -> &Arc<ControlLoop> {
        &self.control
    }

    /// Stop every task, then gracefully terminate all agents
    ///
    /// Returns how many agents were terminated.
    pub async fn stop(self, reason: &str) -> usize {
        self.control.logger.log_shutdown(reason);
        self.control.health.set_ready(false).await;

        // Receivers may already be gone if a task exited early
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Control task ended abnormally");
            }
        }

        self.control.lifecycle.shutdown_all("system_shutdown").await
    }
}
