//! Decision engine: cooldown gating, bounds and the scaling-event ring

use super::{
    CooldownState, Decision, DecisionInput, ScalingAction, ScalingPolicy, ScalingStrategy,
    StrategyKind,
};
use crate::config::ScalerConfig;
use crate::gpu::{GpuSummary, ModelProfiles};
use crate::workload::{cooldown_remaining, Severity, WorkloadView};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Callback invoked once per recorded scaling event
pub type Notifier = Arc<dyn Fn(&ScalingEvent) + Send + Sync>;

/// Immutable record of one executed decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub timestamp: DateTime<Utc>,
    pub action: ScalingAction,
    pub from_count: usize,
    pub to_count: usize,
    pub strategy: StrategyKind,
    pub reason: String,
    pub gpu_memory_utilization: f64,
    pub gpu_utilization: f64,
    pub free_memory_mb: u64,
    pub severity: Severity,
    pub queue_length: usize,
    pub success: bool,
    pub execution_time_ms: u64,
}

impl ScalingEvent {
    pub fn new(
        strategy: StrategyKind,
        decision: &Decision,
        from_count: usize,
        gpu: &GpuSummary,
        workload: &WorkloadView,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action: decision.action,
            from_count,
            to_count: decision.target_count,
            strategy,
            reason: decision.reason.clone(),
            gpu_memory_utilization: gpu.memory_utilization_percent,
            gpu_utilization: gpu.utilization_percent,
            free_memory_mb: gpu.free_memory_mb,
            severity: workload.severity,
            queue_length: workload.latest.queue_length,
            success: true,
            execution_time_ms: 0,
        }
    }

    pub fn with_outcome(mut self, success: bool, execution_time: Duration) -> Self {
        self.success = success;
        self.execution_time_ms = execution_time.as_millis() as u64;
        self
    }
}

#[derive(Default)]
struct EngineState {
    cooldown: CooldownState,
    history: VecDeque<ScalingEvent>,
}

/// Applies the configured strategy and owns cooldown state
pub struct ScalingEngine {
    strategy: Box<dyn ScalingStrategy>,
    min_agents: usize,
    max_agents: usize,
    scale_up_cooldown: Duration,
    scale_down_cooldown: Duration,
    history_capacity: usize,
    state: Mutex<EngineState>,
    notifier: Option<Notifier>,
}

impl ScalingEngine {
    /// Engine running the strategy named in the config
    pub fn new(config: &ScalerConfig, profiles: &ModelProfiles) -> Self {
        let policy = ScalingPolicy::from_config(config, profiles);
        Self::with_strategy(config, config.strategy.build(policy))
    }

    pub fn with_strategy(config: &ScalerConfig, strategy: Box<dyn ScalingStrategy>) -> Self {
        Self {
            strategy,
            min_agents: config.min_agents,
            max_agents: config.max_agents,
            scale_up_cooldown: config.scale_up_cooldown(),
            scale_down_cooldown: config.scale_down_cooldown(),
            history_capacity: config.event_history_size.max(1),
            state: Mutex::new(EngineState::default()),
            notifier: None,
        }
    }

    pub fn with_notifier(
        mut self,
        notifier: impl Fn(&ScalingEvent) + Send + Sync + 'static,
    ) -> Self {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cooldown(&self) -> CooldownState {
        self.lock().cooldown
    }

    pub fn decide(
        &self,
        current_agents: usize,
        gpu: &GpuSummary,
        workload: &WorkloadView,
    ) -> Decision {
        self.decide_at(current_agents, gpu, workload, Utc::now())
    }

    /// Evaluate the strategy, then bound, gate and stamp the result
    ///
    /// The state lock is held for the whole call so two concurrent
    /// decisions cannot both pass the same cooldown.
    pub fn decide_at(
        &self,
        current_agents: usize,
        gpu: &GpuSummary,
        workload: &WorkloadView,
        now: DateTime<Utc>,
    ) -> Decision {
        let mut state = self.lock();

        let input = DecisionInput {
            current_agents,
            gpu,
            workload,
            cooldown: state.cooldown,
            now,
        };
        let decision = self.bound(current_agents, self.strategy.evaluate(&input));

        let (last, window, direction) = match decision.action {
            ScalingAction::ScaleUp => (
                state.cooldown.last_scale_up,
                self.scale_up_cooldown,
                "scale-up",
            ),
            ScalingAction::ScaleDown => (
                state.cooldown.last_scale_down,
                self.scale_down_cooldown,
                "scale-down",
            ),
            ScalingAction::Maintain => return decision,
        };

        if let Some(remaining) = cooldown_remaining(last, window, now) {
            debug!(
                action = %decision.action,
                remaining_secs = remaining,
                "Scaling action suppressed by cooldown"
            );
            let suppressed = decision.action;
            return Decision::maintain(
                current_agents,
                format!(
                    "{} cooldown active ({:.0}s remaining); suppressed: {}",
                    direction, remaining, decision.reason
                ),
            )
            .with_diagnostics(decision.diagnostics)
            .with_diagnostic("suppressed_action", suppressed.as_str());
        }

        match decision.action {
            ScalingAction::ScaleUp => state.cooldown.last_scale_up = Some(now),
            ScalingAction::ScaleDown => state.cooldown.last_scale_down = Some(now),
            ScalingAction::Maintain => {}
        }

        decision
    }

    /// Clamp the target into `[min, max]` and derive the action from it
    fn bound(&self, current: usize, mut decision: Decision) -> Decision {
        let target = decision.target_count.clamp(self.min_agents, self.max_agents);
        let action = match target.cmp(&current) {
            std::cmp::Ordering::Greater => ScalingAction::ScaleUp,
            std::cmp::Ordering::Less => ScalingAction::ScaleDown,
            std::cmp::Ordering::Equal => ScalingAction::Maintain,
        };

        if action != decision.action {
            decision.reason = match (decision.action, action) {
                (ScalingAction::Maintain, ScalingAction::ScaleUp) => format!(
                    "below minimum agent count ({} < {}); {}",
                    current, self.min_agents, decision.reason
                ),
                (ScalingAction::Maintain, ScalingAction::ScaleDown) => format!(
                    "above maximum agent count ({} > {}); {}",
                    current, self.max_agents, decision.reason
                ),
                _ => format!(
                    "{} (target {} bounded to [{}, {}])",
                    decision.reason, decision.target_count, self.min_agents, self.max_agents
                ),
            };
        } else if target != decision.target_count {
            decision.reason = format!("{} (target capped at {})", decision.reason, target);
        }

        decision.action = action;
        decision.target_count = target;
        decision
    }

    /// Append an event to the ring and notify the callback
    pub fn record_event(&self, event: ScalingEvent) {
        {
            let mut state = self.lock();
            state.history.push_back(event.clone());
            while state.history.len() > self.history_capacity {
                state.history.pop_front();
            }
        }

        if let Some(notifier) = &self.notifier {
            notifier(&event);
        }
    }

    /// Up to `n` most recent events, oldest first
    pub fn recent_events(&self, n: usize) -> Vec<ScalingEvent> {
        let state = self.lock();
        let start = state.history.len().saturating_sub(n);
        state.history.iter().skip(start).cloned().collect()
    }

    pub fn event_count(&self) -> usize {
        self.lock().history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GpuVendor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gpu(total: u64, used: u64, util: f64) -> GpuSummary {
        GpuSummary {
            available: true,
            vendor: GpuVendor::Nvidia,
            device_count: 1,
            total_memory_mb: total,
            used_memory_mb: used,
            free_memory_mb: total - used,
            memory_utilization_percent: used as f64 / total as f64 * 100.0,
            utilization_percent: util,
            agent_count: 0,
            last_refresh: Some(Utc::now()),
            last_error: None,
        }
    }

    fn engine(strategy: StrategyKind) -> ScalingEngine {
        let config = ScalerConfig {
            strategy,
            ..Default::default()
        };
        ScalingEngine::new(&config, &ModelProfiles::builtin())
    }

    #[test]
    fn test_second_decision_inside_cooldown_maintains() {
        let engine = engine(StrategyKind::GpuMemory);
        let summary = gpu(16384, 13000, 10.0);
        let workload = WorkloadView::empty(Utc::now());
        let now = Utc::now();

        let first = engine.decide_at(2, &summary, &workload, now);
        assert_eq!(first.action, ScalingAction::ScaleUp);

        let second = engine.decide_at(2, &summary, &workload, now + chrono::Duration::seconds(5));
        assert_eq!(second.action, ScalingAction::Maintain);
        assert!(second.reason.contains("cooldown"));
        assert_eq!(second.diagnostics["suppressed_action"], "scale_up");

        let later = engine.decide_at(2, &summary, &workload, now + chrono::Duration::seconds(61));
        assert_eq!(later.action, ScalingAction::ScaleUp);
    }

    #[test]
    fn test_scale_down_cooldown_is_independent() {
        let engine = engine(StrategyKind::GpuMemory);
        let workload = WorkloadView::empty(Utc::now());
        let now = Utc::now();

        let up = engine.decide_at(2, &gpu(16384, 13000, 10.0), &workload, now);
        assert_eq!(up.action, ScalingAction::ScaleUp);

        let down = engine.decide_at(4, &gpu(16384, 2048, 15.0), &workload, now);
        assert_eq!(down.action, ScalingAction::ScaleDown);
        assert_eq!(down.target_count, 3);
        assert!(engine.cooldown().last_scale_down.is_some());
    }

    #[test]
    fn test_target_clamped_to_max() {
        let config = ScalerConfig {
            strategy: StrategyKind::GpuMemory,
            max_agents: 2,
            ..Default::default()
        };
        let engine = ScalingEngine::new(&config, &ModelProfiles::builtin());
        let decision = engine.decide(2, &gpu(16384, 13000, 10.0), &WorkloadView::empty(Utc::now()));
        assert_eq!(decision.action, ScalingAction::Maintain);
        assert_eq!(decision.target_count, 2);
        assert!(engine.cooldown().last_scale_up.is_none());
    }

    #[test]
    fn test_below_minimum_scales_up() {
        let config = ScalerConfig {
            strategy: StrategyKind::Conservative,
            min_agents: 2,
            ..Default::default()
        };
        let engine = ScalingEngine::new(&config, &ModelProfiles::builtin());
        let decision = engine.decide(0, &gpu(16384, 8192, 50.0), &WorkloadView::empty(Utc::now()));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_count, 2);
        assert!(decision.reason.contains("below minimum"));
    }

    #[test]
    fn test_event_ring_and_notifier() {
        let config = ScalerConfig {
            event_history_size: 3,
            ..Default::default()
        };
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        let engine = ScalingEngine::new(&config, &ModelProfiles::builtin()).with_notifier(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let summary = gpu(16384, 8192, 50.0);
        let workload = WorkloadView::empty(Utc::now());
        for i in 0..5 {
            let decision = Decision::scale_up(i + 1, format!("event {}", i));
            let event = ScalingEvent::new(engine.kind(), &decision, i, &summary, &workload);
            engine.record_event(event);
        }

        assert_eq!(notified.load(Ordering::SeqCst), 5);
        let events = engine.recent_events(10);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].reason, "event 2");
        assert_eq!(events[2].reason, "event 4");
        assert_eq!(engine.recent_events(1)[0].to_count, 5);
    }
}
