//! Integration tests for the control loop against a fake GPU and runtime

use async_trait::async_trait;
use scaler_lib::{
    config::ScalerConfig,
    control::ControlLoop,
    decision::{ScalingAction, ScalingEngine, StrategyKind},
    gpu::{GpuProbe, ModelProfiles, ResourceMonitor},
    health::{components, ComponentStatus},
    lifecycle::{AgentFactory, AgentHandle, LifecycleManager, LifecycleSettings, LifecycleState},
    models::{AgentRole, DeviceInfo, GpuVendor},
    workload::WorkloadCollector,
    ScalingEvent,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct FixedProbe {
    devices: Mutex<Vec<DeviceInfo>>,
}

impl FixedProbe {
    fn new(total: u64, used: u64, utilization: f64) -> Self {
        Self {
            devices: Mutex::new(vec![DeviceInfo {
                index: 0,
                name: "Test GPU".to_string(),
                vendor: GpuVendor::Nvidia,
                total_memory_mb: total,
                used_memory_mb: used,
                free_memory_mb: total - used,
                utilization_percent: utilization,
                temperature_c: None,
                power_watts: None,
            }]),
        }
    }
}

#[async_trait]
impl GpuProbe for FixedProbe {
    fn vendor(&self) -> GpuVendor {
        GpuVendor::Nvidia
    }

    async fn sample(&self) -> scaler_lib::Result<Vec<DeviceInfo>> {
        Ok(self.devices.lock().unwrap().clone())
    }
}

struct TestAgent {
    id: String,
}

impl AgentHandle for TestAgent {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Default)]
struct CountingFactory {
    created: AtomicUsize,
    terminated: AtomicUsize,
}

#[async_trait]
impl AgentFactory for CountingFactory {
    async fn create(
        &self,
        agent_id: &str,
        _role: AgentRole,
        _model: &str,
    ) -> anyhow::Result<Arc<dyn AgentHandle>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TestAgent {
            id: agent_id.to_string(),
        }))
    }

    async fn terminate(&self, _handle: Arc<dyn AgentHandle>) -> anyhow::Result<bool> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

struct FailingFactory;

#[async_trait]
impl AgentFactory for FailingFactory {
    async fn create(
        &self,
        _agent_id: &str,
        _role: AgentRole,
        _model: &str,
    ) -> anyhow::Result<Arc<dyn AgentHandle>> {
        anyhow::bail!("no capacity on runtime")
    }

    async fn terminate(&self, _handle: Arc<dyn AgentHandle>) -> anyhow::Result<bool> {
        Ok(true)
    }
}

fn config(strategy: StrategyKind, min_agents: usize) -> ScalerConfig {
    ScalerConfig {
        strategy,
        min_agents,
        max_agents: 6,
        graceful_shutdown_timeout_seconds: 1,
        ..Default::default()
    }
}

async fn control_loop(
    config: ScalerConfig,
    probe: Option<FixedProbe>,
    factory: Arc<dyn AgentFactory>,
) -> Arc<ControlLoop> {
    let probe = probe.map(|p| Arc::new(p) as Arc<dyn GpuProbe>);
    let monitor = Arc::new(ResourceMonitor::new(probe, config.monitor_interval()));
    if monitor.vendor() != GpuVendor::Unknown {
        monitor.refresh().await.unwrap();
    }

    let collector = Arc::new(WorkloadCollector::new(&config));
    let engine = Arc::new(ScalingEngine::new(&config, &ModelProfiles::builtin()));
    let lifecycle = Arc::new(
        LifecycleManager::new(factory, LifecycleSettings::from_config(&config))
            .with_collector(collector.clone()),
    );

    Arc::new(ControlLoop::new(config, monitor, collector, engine, lifecycle))
}

/// Events are recorded once their requests have run
async fn wait_for_events(control: &ControlLoop, n: usize) -> Vec<ScalingEvent> {
    for _ in 0..200 {
        if control.engine().event_count() >= n {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    control.engine().recent_events(10)
}

#[tokio::test]
async fn test_bootstrap_without_telemetry() {
    let factory = Arc::new(CountingFactory::default());
    let control = control_loop(config(StrategyKind::GpuMemory, 2), None, factory.clone()).await;

    let decision = control.run_decision_cycle().await;
    assert_eq!(decision.action, ScalingAction::ScaleUp);
    assert_eq!(decision.target_count, 2);
    assert_eq!(control.lifecycle().pending_requests(), (2, 0));

    let (created, _) = control.lifecycle().process_queue().await;
    assert_eq!(created, 2);
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    assert_eq!(control.lifecycle().agents_by_role(AgentRole::Queen).await.len(), 1);
    assert_eq!(control.lifecycle().agents_by_role(AgentRole::Drone).await.len(), 1);

    let events = wait_for_events(&control, 1).await;
    assert_eq!(events.len(), 1);
    assert!(events[0].success);
    assert_eq!(events[0].from_count, 0);
    assert_eq!(events[0].to_count, 2);

    // Fallback ceiling reached
    let decision = control.run_decision_cycle().await;
    assert_eq!(decision.action, ScalingAction::Maintain);
    assert_eq!(control.engine().event_count(), 1);

    let monitor_health = control.health().component(components::RESOURCE_MONITOR).await.unwrap();
    assert_eq!(monitor_health.status, ComponentStatus::Degraded);
}

#[tokio::test]
async fn test_memory_pressure_requests_drone() {
    let factory = Arc::new(CountingFactory::default());
    let control = control_loop(
        config(StrategyKind::GpuMemory, 1),
        Some(FixedProbe::new(16384, 14000, 60.0)),
        factory,
    )
    .await;
    control.lifecycle().create_agent(AgentRole::Queen, "llama3.2:3b", "bootstrap").await;

    let decision = control.run_decision_cycle().await;
    assert_eq!(decision.action, ScalingAction::ScaleUp);
    assert_eq!(decision.target_count, 2);
    assert_eq!(control.lifecycle().planned_roles().await.get(&AgentRole::Drone), Some(&1));
    assert_eq!(control.lifecycle().effective_count().await, 2);

    // Inside the scale-up cooldown the same pressure is held
    let decision = control.run_decision_cycle().await;
    assert_eq!(decision.action, ScalingAction::Maintain);
    assert!(decision.reason.contains("cooldown"));
    assert_eq!(control.lifecycle().pending_requests(), (1, 0));

    let monitor_health = control.health().component(components::RESOURCE_MONITOR).await.unwrap();
    assert_eq!(monitor_health.status, ComponentStatus::Healthy);
}

#[tokio::test]
async fn test_quiet_gpu_retires_idle_drone() {
    let factory = Arc::new(CountingFactory::default());
    let control = control_loop(
        config(StrategyKind::GpuMemory, 1),
        Some(FixedProbe::new(16384, 2000, 10.0)),
        factory.clone(),
    )
    .await;
    let lifecycle = control.lifecycle();
    for role in [AgentRole::Queen, AgentRole::Drone, AgentRole::Drone] {
        assert!(lifecycle.create_agent(role, "llama3.2:3b", "bootstrap").await.is_created());
    }

    let decision = control.run_decision_cycle().await;
    assert_eq!(decision.action, ScalingAction::ScaleDown);
    assert_eq!(decision.target_count, 2);
    assert_eq!(lifecycle.pending_requests(), (0, 1));

    let (_, terminated) = lifecycle.process_queue().await;
    assert_eq!(terminated, 1);
    assert_eq!(lifecycle.agent_count().await, 2);
    assert_eq!(lifecycle.agents_by_role(AgentRole::Queen).await.len(), 1);
    wait_for_events(&control, 1).await;

    let status = control.status(10).await;
    assert_eq!(status.strategy, StrategyKind::GpuMemory);
    assert_eq!(status.agent_count, 2);
    assert_eq!(status.recent_events.len(), 1);
    assert_eq!(status.recent_events[0].action, ScalingAction::ScaleDown);
    assert!(status.recent_events[0].success);
    assert_eq!(status.recent_events[0].to_count, 2);
    assert!(status.gpu.available);
    assert!(status.cooldown.last_scale_down.is_some());
    assert!(status
        .agents
        .iter()
        .any(|a| a.role == AgentRole::Drone && a.state == LifecycleState::Terminated));
}

#[tokio::test]
async fn test_from_config_notifies_on_scaling_events() {
    let seen: Arc<Mutex<Vec<ScalingEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let config = ScalerConfig {
        probe_timeout_seconds: 1,
        ..config(StrategyKind::Hybrid, 1)
    };
    let control = ControlLoop::from_config(
        config,
        Arc::new(CountingFactory::default()),
        Some(Arc::new(move |event: &ScalingEvent| {
            sink.lock().unwrap().push(event.clone());
        })),
    )
    .await
    .unwrap();

    // An empty fleet is always brought up to the minimum
    let decision = control.run_decision_cycle().await;
    assert_eq!(decision.action, ScalingAction::ScaleUp);
    assert!(seen.lock().unwrap().is_empty());

    control.lifecycle().process_queue().await;
    wait_for_events(&control, 1).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].strategy, StrategyKind::Hybrid);
    assert_eq!(seen[0].from_count, 0);
}

#[tokio::test]
async fn test_failed_creations_recorded_as_unsuccessful() {
    let config = config(StrategyKind::GpuMemory, 2);
    let control = control_loop(config, None, Arc::new(FailingFactory)).await;

    let decision = control.run_decision_cycle().await;
    assert_eq!(decision.action, ScalingAction::ScaleUp);
    assert_eq!(decision.target_count, 2);

    let (created, _) = control.lifecycle().process_queue().await;
    assert_eq!(created, 0);

    let events = wait_for_events(&control, 1).await;
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert_eq!(events[0].from_count, 0);
    assert_eq!(events[0].to_count, 0);
    assert_eq!(control.lifecycle().effective_count().await, 0);
}

#[tokio::test]
async fn test_from_config_rejects_invalid_bounds() {
    let config = ScalerConfig {
        min_agents: 4,
        max_agents: 2,
        ..Default::default()
    };
    let result = ControlLoop::from_config(config, Arc::new(CountingFactory::default()), None).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_from_config_rejects_zero_interval() {
    let config = ScalerConfig {
        scale_check_interval_seconds: Some(0),
        ..Default::default()
    };
    let result = ControlLoop::from_config(config, Arc::new(CountingFactory::default()), None).await;
    assert!(matches!(result, Err(scaler_lib::ScalerError::Config(_))));
}

#[tokio::test]
async fn test_start_and_stop_terminates_fleet() {
    let factory = Arc::new(CountingFactory::default());
    let config = ScalerConfig {
        scale_check_interval_seconds: Some(1),
        ..config(StrategyKind::GpuMemory, 1)
    };
    let control = control_loop(config, None, factory.clone()).await;

    let handle = control.clone().start().await;
    assert!(control.health().readiness().await.ready);

    let mut waited = 0;
    while control.lifecycle().agent_count().await < 1 && waited < 200 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += 1;
    }
    assert_eq!(control.lifecycle().agent_count().await, 1);

    let terminated = handle.stop("test complete").await;
    assert_eq!(terminated, 1);
    assert_eq!(factory.terminated.load(Ordering::SeqCst), 1);
    assert_eq!(control.lifecycle().agent_count().await, 0);
    assert!(!control.health().readiness().await.ready);
}
