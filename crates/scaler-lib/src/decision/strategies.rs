//! The five scaling strategies

use super::{Decision, DecisionInput, ScalingAction, ScalingPolicy, ScalingStrategy, StrategyKind};
use crate::workload::{evaluate_scale_down, evaluate_scale_up};
use serde_json::{Map, Value};

/// GPU compute utilization that justifies another agent when memory allows
const GPU_BUSY_PERCENT: f64 = 80.0;

/// GPU compute utilization below which an agent may be removed
const GPU_QUIET_PERCENT: f64 = 30.0;

/// Free memory required before hybrid follows a workload-only scale-up
const HYBRID_WORKLOAD_UP_FREE_MB: u64 = 2048;

/// Memory utilization below which hybrid follows a one-sided scale-down
const HYBRID_DOWN_MEMORY_PERCENT: f64 = 50.0;

const CONSERVATIVE_UP_MEMORY_PERCENT: f64 = 80.0;
const CONSERVATIVE_DOWN_MEMORY_PERCENT: f64 = 30.0;
const CONSERVATIVE_DOWN_GPU_PERCENT: f64 = 20.0;

const AGGRESSIVE_PROACTIVE_FREE_MB: u64 = 4096;
const AGGRESSIVE_BATCH_FREE_MB: u64 = 8192;

/// Scales on GPU memory pressure and compute utilization
pub struct GpuMemoryStrategy {
    policy: ScalingPolicy,
}

impl GpuMemoryStrategy {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self { policy }
    }

    fn evaluate_without_telemetry(&self, input: &DecisionInput<'_>) -> Decision {
        let current = input.current_agents;
        let ceiling = self.policy.fallback_ceiling();
        let reason = input
            .gpu
            .last_error
            .as_deref()
            .unwrap_or("GPU telemetry unavailable");

        let decision = if current < self.policy.min_agents {
            Decision::scale_up(
                self.policy.min_agents,
                format!(
                    "{}; below minimum agent count ({} < {})",
                    reason, current, self.policy.min_agents
                ),
            )
        } else if current > ceiling {
            Decision::scale_down(
                ceiling,
                format!("{}; holding fleet at fallback ceiling of {}", reason, ceiling),
            )
        } else {
            Decision::maintain(
                current,
                format!("{}; maintaining within fallback ceiling of {}", reason, ceiling),
            )
        };

        decision
            .with_diagnostic("telemetry_available", false)
            .with_diagnostic("fallback_ceiling", ceiling)
    }
}

impl ScalingStrategy for GpuMemoryStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::GpuMemory
    }

    fn evaluate(&self, input: &DecisionInput<'_>) -> Decision {
        if !input.gpu.available {
            return self.evaluate_without_telemetry(input);
        }

        let current = input.current_agents;
        let gpu = input.gpu;
        let memory = gpu.memory_utilization_percent;
        let compute = gpu.utilization_percent;
        let capacity = self
            .policy
            .budget
            .agent_capacity(gpu.free_memory_mb, self.policy.per_agent_memory_mb);

        let decision = if memory > self.policy.scale_up_memory_percent {
            Decision::scale_up(
                current + 1,
                format!(
                    "GPU memory utilization {:.1}% above {:.0}% threshold",
                    memory, self.policy.scale_up_memory_percent
                ),
            )
        } else if compute > GPU_BUSY_PERCENT && capacity > 0 {
            Decision::scale_up(
                current + 1,
                format!(
                    "GPU utilization {:.1}% above {:.0}% with room for {} more agents",
                    compute, GPU_BUSY_PERCENT, capacity
                ),
            )
        } else if memory < self.policy.scale_down_memory_percent
            && compute < GPU_QUIET_PERCENT
            && current > self.policy.min_agents
        {
            Decision::scale_down(
                current - 1,
                format!(
                    "GPU memory utilization {:.1}% below {:.0}% and GPU utilization {:.1}% below {:.0}%",
                    memory, self.policy.scale_down_memory_percent, compute, GPU_QUIET_PERCENT
                ),
            )
        } else {
            Decision::maintain(
                current,
                format!(
                    "GPU memory utilization {:.1}% and GPU utilization {:.1}% within bounds",
                    memory, compute
                ),
            )
        };

        decision
            .with_diagnostic("memory_utilization_percent", memory)
            .with_diagnostic("gpu_utilization_percent", compute)
            .with_diagnostic("free_memory_mb", gpu.free_memory_mb)
            .with_diagnostic("per_agent_memory_mb", self.policy.per_agent_memory_mb)
            .with_diagnostic("agent_capacity", capacity)
    }
}

/// Scales on queue pressure through the workload rules
pub struct WorkloadStrategy {
    policy: ScalingPolicy,
}

impl WorkloadStrategy {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self { policy }
    }
}

impl ScalingStrategy for WorkloadStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Workload
    }

    fn evaluate(&self, input: &DecisionInput<'_>) -> Decision {
        let current = input.current_agents;
        let gate = input.gate();
        let view = input.workload;

        let up = evaluate_scale_up(view, &gate, &self.policy.rules);
        let down = evaluate_scale_down(view, &gate, &self.policy.rules);

        let decision = if up.scale {
            Decision::scale_up(current + up.step, up.reason)
        } else if down.scale {
            Decision::scale_down(current.saturating_sub(down.step), down.reason)
        } else {
            Decision::maintain(
                current,
                format!("no scale-up: {}; no scale-down: {}", up.reason, down.reason),
            )
        };

        decision
            .with_diagnostic("severity", view.severity.as_str())
            .with_diagnostic("queue_length", view.latest.queue_length)
            .with_diagnostic("average_wait_time", view.latest.average_wait_time)
            .with_diagnostic("idle_fraction", view.latest.idle_fraction())
    }
}

/// GPU and workload views combined by precedence rules
pub struct HybridStrategy {
    gpu: GpuMemoryStrategy,
    workload: WorkloadStrategy,
    policy: ScalingPolicy,
}

impl HybridStrategy {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            gpu: GpuMemoryStrategy::new(policy.clone()),
            workload: WorkloadStrategy::new(policy.clone()),
            policy,
        }
    }

    fn combine(&self, input: &DecisionInput<'_>, gpu: &Decision, workload: &Decision) -> Decision {
        use ScalingAction::*;

        let current = input.current_agents;
        let free = input.gpu.free_memory_mb;
        let memory = input.gpu.memory_utilization_percent;

        match (gpu.action, workload.action) {
            (ScaleUp, ScaleUp) => Decision::scale_up(
                gpu.target_count.max(workload.target_count),
                format!("GPU and workload agree on scale-up: {}; {}", gpu.reason, workload.reason),
            ),
            (ScaleDown, ScaleDown) => Decision::scale_down(
                gpu.target_count.max(workload.target_count),
                format!(
                    "GPU and workload agree on scale-down: {}; {}",
                    gpu.reason, workload.reason
                ),
            ),
            (Maintain, Maintain) => Decision::maintain(
                current,
                format!("GPU and workload agree on maintain: {}; {}", gpu.reason, workload.reason),
            ),
            (ScaleUp, Maintain) => Decision::scale_up(
                gpu.target_count,
                format!("GPU precedence: {}", gpu.reason),
            ),
            (Maintain, ScaleUp) if !input.gpu.available => {
                let ceiling = self.policy.fallback_ceiling();
                if current < ceiling {
                    Decision::scale_up(
                        workload.target_count.min(ceiling),
                        format!("{} (no GPU telemetry, capped at {})", workload.reason, ceiling),
                    )
                } else {
                    Decision::maintain(
                        current,
                        format!(
                            "workload wants scale-up but fallback ceiling of {} reached: {}",
                            ceiling, workload.reason
                        ),
                    )
                }
            }
            (Maintain, ScaleUp) => {
                if free > HYBRID_WORKLOAD_UP_FREE_MB {
                    Decision::scale_up(
                        workload.target_count,
                        format!("{} with {} MB free", workload.reason, free),
                    )
                } else {
                    Decision::maintain(
                        current,
                        format!(
                            "workload wants scale-up but only {} MB free (need more than {} MB): {}",
                            free, HYBRID_WORKLOAD_UP_FREE_MB, workload.reason
                        ),
                    )
                }
            }
            (ScaleDown, Maintain) | (Maintain, ScaleDown) => {
                let down = if gpu.action == ScaleDown { gpu } else { workload };
                if memory < HYBRID_DOWN_MEMORY_PERCENT {
                    Decision::scale_down(
                        down.target_count,
                        format!(
                            "{} with GPU memory utilization {:.1}% below {:.0}%",
                            down.reason, memory, HYBRID_DOWN_MEMORY_PERCENT
                        ),
                    )
                } else {
                    Decision::maintain(
                        current,
                        format!(
                            "scale-down held: GPU memory utilization {:.1}% not below {:.0}% ({})",
                            memory, HYBRID_DOWN_MEMORY_PERCENT, down.reason
                        ),
                    )
                }
            }
            (ScaleUp, ScaleDown) | (ScaleDown, ScaleUp) => Decision::maintain(
                current,
                format!(
                    "GPU ({}) and workload ({}) disagree: {}; {}",
                    gpu.action, workload.action, gpu.reason, workload.reason
                ),
            ),
        }
    }
}

impl ScalingStrategy for HybridStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hybrid
    }

    fn evaluate(&self, input: &DecisionInput<'_>) -> Decision {
        let gpu = self.gpu.evaluate(input);
        let workload = self.workload.evaluate(input);
        let decision = self.combine(input, &gpu, &workload);

        let mut diagnostics = Map::new();
        diagnostics.insert("gpu_action".into(), Value::from(gpu.action.as_str()));
        diagnostics.insert("workload_action".into(), Value::from(workload.action.as_str()));
        diagnostics.extend(gpu.diagnostics);
        diagnostics.extend(workload.diagnostics);

        decision.with_diagnostics(diagnostics)
    }
}

/// Hybrid with stricter thresholds and single-step changes
pub struct ConservativeStrategy {
    hybrid: HybridStrategy,
}

impl ConservativeStrategy {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            hybrid: HybridStrategy::new(policy),
        }
    }
}

impl ScalingStrategy for ConservativeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Conservative
    }

    fn evaluate(&self, input: &DecisionInput<'_>) -> Decision {
        let base = self.hybrid.evaluate(input);
        let current = input.current_agents;
        let memory = input.gpu.memory_utilization_percent;
        let compute = input.gpu.utilization_percent;
        let diagnostics = base.diagnostics.clone();

        let decision = match base.action {
            ScalingAction::ScaleUp if memory > CONSERVATIVE_UP_MEMORY_PERCENT => Decision::scale_up(
                current + 1,
                format!(
                    "conservative: GPU memory utilization {:.1}% above {:.0}%; {}",
                    memory, CONSERVATIVE_UP_MEMORY_PERCENT, base.reason
                ),
            ),
            ScalingAction::ScaleUp => Decision::maintain(
                current,
                format!(
                    "conservative: scale-up held, GPU memory utilization {:.1}% not above {:.0}% ({})",
                    memory, CONSERVATIVE_UP_MEMORY_PERCENT, base.reason
                ),
            ),
            ScalingAction::ScaleDown
                if memory < CONSERVATIVE_DOWN_MEMORY_PERCENT
                    && compute < CONSERVATIVE_DOWN_GPU_PERCENT =>
            {
                Decision::scale_down(
                    current.saturating_sub(1),
                    format!(
                        "conservative: GPU memory {:.1}% below {:.0}% and utilization {:.1}% below {:.0}%; {}",
                        memory,
                        CONSERVATIVE_DOWN_MEMORY_PERCENT,
                        compute,
                        CONSERVATIVE_DOWN_GPU_PERCENT,
                        base.reason
                    ),
                )
            }
            ScalingAction::ScaleDown => Decision::maintain(
                current,
                format!(
                    "conservative: scale-down held, GPU memory {:.1}% / utilization {:.1}% too high ({})",
                    memory, compute, base.reason
                ),
            ),
            ScalingAction::Maintain => return base,
        };

        decision.with_diagnostics(diagnostics)
    }
}

/// Hybrid with proactive and batched scale-up
pub struct AggressiveStrategy {
    hybrid: HybridStrategy,
    policy: ScalingPolicy,
}

impl AggressiveStrategy {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            hybrid: HybridStrategy::new(policy.clone()),
            policy,
        }
    }
}

impl ScalingStrategy for AggressiveStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Aggressive
    }

    fn evaluate(&self, input: &DecisionInput<'_>) -> Decision {
        let base = self.hybrid.evaluate(input);
        let current = input.current_agents;
        let free = input.gpu.free_memory_mb;
        let max = self.policy.max_agents;
        let diagnostics = base.diagnostics.clone();

        let decision = match base.action {
            ScalingAction::Maintain
                if input.gpu.available
                    && free > AGGRESSIVE_PROACTIVE_FREE_MB
                    && (current as f64) < max as f64 / 2.0 =>
            {
                Decision::scale_up(
                    current + 1,
                    format!(
                        "aggressive: proactive scale-up with {} MB free and {} of {} agents; {}",
                        free, current, max, base.reason
                    ),
                )
            }
            ScalingAction::ScaleUp if free > AGGRESSIVE_BATCH_FREE_MB => {
                // A batch never outgrows the memory it lands in
                let capacity = self
                    .policy
                    .budget
                    .agent_capacity(free, self.policy.per_agent_memory_mb);
                let batch = self.policy.aggressive_batch_size.min(capacity);
                let target = (current + batch).min(max);
                Decision::scale_up(
                    target.max(base.target_count.min(max)),
                    format!(
                        "aggressive: batch scale-up by {} (room for {}) with {} MB free; {}",
                        batch, capacity, free, base.reason
                    ),
                )
                .with_diagnostic("agent_capacity", capacity)
            }
            _ => return base,
        };

        decision.with_diagnostics(diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::CooldownState;
    use crate::gpu::GpuSummary;
    use crate::models::{GpuVendor, SystemSnapshot};
    use crate::workload::{Severity, SeverityThresholds, WorkloadView};
    use chrono::Utc;

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

    fn quiet() -> WorkloadView {
        WorkloadView::empty(Utc::now())
    }

    fn busy() -> WorkloadView {
        let snapshot = SystemSnapshot {
            total_agents: 2,
            busy_agents: 2,
            queue_length: 25,
            pending_tasks: 25,
            ..Default::default()
        };
        WorkloadView::from_history(&[snapshot], &SeverityThresholds::default()).unwrap()
    }

    fn idle() -> WorkloadView {
        let snapshot = SystemSnapshot {
            total_agents: 4,
            idle_agents: 4,
            ..Default::default()
        };
        WorkloadView::from_history(&vec![snapshot; 5], &SeverityThresholds::default()).unwrap()
    }

    fn input<'a>(
        current: usize,
        gpu: &'a GpuSummary,
        workload: &'a WorkloadView,
    ) -> DecisionInput<'a> {
        DecisionInput {
            current_agents: current,
            gpu,
            workload,
            cooldown: CooldownState::default(),
            now: Utc::now(),
        }
    }

    fn policy(max_agents: usize) -> ScalingPolicy {
        ScalingPolicy {
            max_agents,
            ..Default::default()
        }
    }

    #[test]
    fn test_gpu_memory_pressure_scales_up() {
        let summary = gpu(16384, 13000, 10.0);
        let workload = quiet();
        let decision = GpuMemoryStrategy::new(policy(10)).evaluate(&input(2, &summary, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_count, 3);
        assert!(decision.reason.contains("79.3%"));
        assert_eq!(decision.diagnostics["agent_capacity"], 0);
    }

    #[test]
    fn test_gpu_busy_needs_capacity() {
        let workload = quiet();
        let full = gpu(16384, 12000, 95.0);
        let decision = GpuMemoryStrategy::new(policy(10)).evaluate(&input(2, &full, &workload));
        assert_eq!(decision.action, ScalingAction::Maintain);

        let roomy = gpu(16384, 4000, 95.0);
        let decision = GpuMemoryStrategy::new(policy(10)).evaluate(&input(2, &roomy, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
    }

    #[test]
    fn test_gpu_quiet_scales_down_to_one_less() {
        let summary = gpu(16384, 2048, 15.0);
        let workload = quiet();
        let decision = GpuMemoryStrategy::new(policy(10)).evaluate(&input(4, &summary, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleDown);
        assert_eq!(decision.target_count, 3);

        let decision = GpuMemoryStrategy::new(policy(10)).evaluate(&input(1, &summary, &workload));
        assert_eq!(decision.action, ScalingAction::Maintain);
    }

    #[test]
    fn test_without_telemetry_holds_fallback_ceiling() {
        let summary = GpuSummary::unavailable("no supported GPU tool found");
        let workload = quiet();
        let strategy = GpuMemoryStrategy::new(policy(10));

        let decision = strategy.evaluate(&input(5, &summary, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleDown);
        assert_eq!(decision.target_count, 2);
        assert!(decision.reason.contains("no supported GPU tool found"));

        let decision = strategy.evaluate(&input(2, &summary, &workload));
        assert_eq!(decision.action, ScalingAction::Maintain);

        let decision = strategy.evaluate(&input(0, &summary, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_count, 1);
    }

    #[test]
    fn test_workload_strategy_uses_rules() {
        let summary = gpu(16384, 8192, 50.0);
        let workload = busy();
        let decision = WorkloadStrategy::new(policy(10)).evaluate(&input(2, &summary, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_count, 4);
        assert_eq!(decision.diagnostics["severity"], Severity::VeryHigh.as_str());
    }

    #[test]
    fn test_hybrid_gpu_precedence() {
        // 75.6% used, 6000 MB free
        let summary = gpu(24576, 18576, 40.0);
        let workload = quiet();
        let decision = HybridStrategy::new(policy(10)).evaluate(&input(2, &summary, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert!(decision.reason.contains("GPU precedence"));
        assert_eq!(decision.diagnostics["workload_action"], "maintain");
    }

    #[test]
    fn test_hybrid_workload_up_needs_free_memory() {
        let workload = busy();
        let tight = gpu(16384, 14500, 40.0);
        // 88.5% used, so GPU also votes up
        let decision = HybridStrategy::new(policy(10)).evaluate(&input(2, &tight, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleUp);

        let mut starved = gpu(16384, 11000, 40.0);
        starved.free_memory_mb = 1500;
        let decision = HybridStrategy::new(policy(10)).evaluate(&input(2, &starved, &workload));
        assert_eq!(decision.action, ScalingAction::Maintain);
        assert!(decision.reason.contains("1500 MB free"));

        let roomy = gpu(16384, 8000, 40.0);
        let decision = HybridStrategy::new(policy(10)).evaluate(&input(2, &roomy, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_count, 4);
    }

    #[test]
    fn test_hybrid_one_sided_scale_down_needs_low_memory() {
        let workload = idle();
        let low = gpu(16384, 7000, 45.0);
        let decision = HybridStrategy::new(policy(10)).evaluate(&input(4, &low, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleDown);
        assert_eq!(decision.target_count, 3);

        let high = gpu(16384, 9000, 45.0);
        let decision = HybridStrategy::new(policy(10)).evaluate(&input(4, &high, &workload));
        assert_eq!(decision.action, ScalingAction::Maintain);
    }

    #[test]
    fn test_hybrid_conflict_maintains() {
        let summary = gpu(16384, 2048, 10.0);
        let workload = busy();
        let decision = HybridStrategy::new(policy(10)).evaluate(&input(4, &summary, &workload));
        assert_eq!(decision.action, ScalingAction::Maintain);
        assert!(decision.reason.contains("disagree"));
    }

    #[test]
    fn test_conservative_thresholds() {
        let workload = quiet();
        let moderate = gpu(16384, 12800, 40.0);
        let strategy = ConservativeStrategy::new(policy(10));
        let decision = strategy.evaluate(&input(2, &moderate, &workload));
        assert_eq!(decision.action, ScalingAction::Maintain);

        let heavy = gpu(16384, 14000, 40.0);
        let decision = strategy.evaluate(&input(2, &heavy, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_count, 3);

        let light = gpu(16384, 5600, 25.0);
        let decision = strategy.evaluate(&input(4, &light, &idle()));
        assert_eq!(decision.action, ScalingAction::Maintain);
    }

    #[test]
    fn test_aggressive_proactive_scale_up() {
        let summary = gpu(16384, 8192, 50.0);
        let workload = quiet();
        let decision = AggressiveStrategy::new(policy(8)).evaluate(&input(2, &summary, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_count, 3);

        let decision = AggressiveStrategy::new(policy(8)).evaluate(&input(4, &summary, &workload));
        assert_eq!(decision.action, ScalingAction::Maintain);
    }

    #[test]
    fn test_aggressive_batch_is_capped() {
        // 15536 MB free leaves 12181 MB usable: room for three 3072 MB agents
        let mut summary = gpu(65536, 50000, 90.0);
        summary.free_memory_mb = 15536;
        let workload = quiet();
        let decision = AggressiveStrategy::new(policy(8)).evaluate(&input(5, &summary, &workload));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_count, 8);

        let decision = AggressiveStrategy::new(policy(20)).evaluate(&input(5, &summary, &workload));
        assert_eq!(decision.target_count, 8);
        assert_eq!(decision.diagnostics["agent_capacity"], 3);
    }

    #[test]
    fn test_aggressive_batch_limited_by_memory() {
        // 9000 MB free leaves 6626 MB usable, enough for two agents
        let summary = gpu(65536, 56536, 50.0);
        let decision = AggressiveStrategy::new(policy(20)).evaluate(&input(4, &summary, &quiet()));
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_count, 6);
        assert!(decision.reason.contains("batch scale-up by 2"));
    }
}
