//! Task and agent metrics collection
//!
//! Tracks every task through `pending → running → completed | failed`,
//! keeps a metrics-side record per agent, and rolls both up into
//! immutable `SystemSnapshot`s on every collection tick.

use super::rules::{
    evaluate_scale_down, evaluate_scale_up, ScaleGate, ScaleRules, ScaleVerdict, WorkloadView,
};
use super::severity::{classify, Severity};
use crate::config::ScalerConfig;
use crate::error::{Result, ScalerError};
use crate::gpu::{HostLoad, HostSampler};
use crate::models::{
    seconds_between, AgentRecord, AgentRole, AgentStatus, ResourceUsage, SystemSnapshot,
    TaskRecord, TaskStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Window for the throughput figure
const THROUGHPUT_WINDOW_SECS: i64 = 60;

/// Window for error rate, wait time and processing time
const RECENT_WINDOW_SECS: i64 = 300;

/// Per-agent performance summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPerformance {
    pub agent_id: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub active_tasks: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub success_rate: f64,
    pub average_response_time: f64,
    pub total_processing_time: f64,
    pub last_activity: DateTime<Utc>,
}

impl From<&AgentRecord> for AgentPerformance {
    fn from(agent: &AgentRecord) -> Self {
        Self {
            agent_id: agent.id.clone(),
            role: agent.role,
            status: agent.status,
            active_tasks: agent.active_tasks,
            tasks_completed: agent.tasks_completed,
            tasks_failed: agent.tasks_failed,
            success_rate: agent.success_rate(),
            average_response_time: agent.average_response_time(),
            total_processing_time: agent.total_processing_time,
            last_activity: agent.last_activity,
        }
    }
}

#[derive(Debug, Default)]
struct CollectorState {
    tasks: HashMap<String, TaskRecord>,
    /// Finished task ids, oldest first
    finished_order: VecDeque<String>,
    agents: HashMap<String, AgentRecord>,
    snapshots: VecDeque<SystemSnapshot>,
    host_load: HostLoad,
}

/// In-memory workload metrics
pub struct WorkloadCollector {
    state: Mutex<CollectorState>,
    rules: ScaleRules,
    snapshot_capacity: usize,
    task_history: usize,
    interval: Duration,
    host: Option<HostSampler>,
}

impl WorkloadCollector {
    pub fn new(config: &ScalerConfig) -> Self {
        Self {
            state: Mutex::new(CollectorState::default()),
            rules: ScaleRules::from_config(config),
            snapshot_capacity: config.snapshot_history_size.max(1),
            task_history: config.task_history_size.max(1),
            interval: config.collection_interval(),
            host: None,
        }
    }

    /// Sample host CPU and memory on every collection tick
    pub fn with_host_sampler(mut self, sampler: HostSampler) -> Self {
        self.host = Some(sampler);
        self
    }

    pub fn rules(&self) -> &ScaleRules {
        &self.rules
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_task_submitted(
        &self,
        task_id: &str,
        complexity_score: f64,
        priority: u8,
        estimated_duration: f64,
    ) -> TaskRecord {
        self.on_task_submitted_at(
            task_id,
            complexity_score,
            priority,
            estimated_duration,
            Utc::now(),
        )
    }

    /// Register a pending task
    ///
    /// Resubmitting a finished task starts a fresh record with an
    /// incremented retry count. Resubmitting an unfinished one returns it
    /// unchanged.
    pub fn on_task_submitted_at(
        &self,
        task_id: &str,
        complexity_score: f64,
        priority: u8,
        estimated_duration: f64,
        now: DateTime<Utc>,
    ) -> TaskRecord {
        let mut state = self.lock();

        let retry_count = match state.tasks.get(task_id) {
            Some(existing) if !existing.status.is_finished() => {
                debug!(task_id = %task_id, status = %existing.status, "Task already tracked");
                return existing.clone();
            }
            Some(existing) => existing.retry_count + 1,
            None => 0,
        };

        if retry_count > 0 {
            state.finished_order.retain(|id| id != task_id);
        }

        let mut task =
            TaskRecord::new(task_id, complexity_score, priority, estimated_duration, now);
        task.retry_count = retry_count;
        state.tasks.insert(task_id.to_string(), task.clone());

        debug!(task_id = %task_id, priority, retry_count, "Task submitted");
        task
    }

    pub fn on_task_started(&self, task_id: &str, agent_id: &str) -> Result<()> {
        self.on_task_started_at(task_id, agent_id, Utc::now())
    }

    pub fn on_task_started_at(
        &self,
        task_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock();

        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ScalerError::UnknownTask(task_id.to_string()))?;
        if task.status != TaskStatus::Pending {
            return Err(ScalerError::InvalidTaskTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.agent_id = Some(agent_id.to_string());

        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.active_tasks += 1;
                agent.current_task_id = Some(task_id.to_string());
                agent.last_activity = now;
                if agent.status != AgentStatus::Error {
                    agent.status = if agent.active_tasks > 1 {
                        AgentStatus::Overloaded
                    } else {
                        AgentStatus::Busy
                    };
                }
            }
            None => warn!(
                task_id = %task_id,
                agent_id = %agent_id,
                "Task started on unregistered agent"
            ),
        }

        Ok(())
    }

    pub fn on_task_completed(
        &self,
        task_id: &str,
        success: bool,
        usage: Option<ResourceUsage>,
    ) -> Result<TaskRecord> {
        self.on_task_completed_at(task_id, success, usage, Utc::now())
    }

    pub fn on_task_completed_at(
        &self,
        task_id: &str,
        success: bool,
        usage: Option<ResourceUsage>,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ScalerError::UnknownTask(task_id.to_string()))?;
        let next = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        if task.status != TaskStatus::Running {
            return Err(ScalerError::InvalidTaskTransition {
                task_id: task_id.to_string(),
                from: task.status.to_string(),
                to: next.to_string(),
            });
        }

        let duration = seconds_between(task.started_at.unwrap_or(task.submitted_at), now);
        task.status = next;
        task.completed_at = Some(now);
        task.actual_duration = Some(duration);
        let finished = task.clone();

        state.finished_order.push_back(task_id.to_string());
        while state.finished_order.len() > self.task_history {
            if let Some(evicted) = state.finished_order.pop_front() {
                state.tasks.remove(&evicted);
            }
        }

        let agent_id = finished.agent_id.as_deref().unwrap_or_default();
        match state.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.active_tasks = agent.active_tasks.saturating_sub(1);
                if success {
                    agent.tasks_completed += 1;
                } else {
                    agent.tasks_failed += 1;
                }
                agent.total_processing_time += duration;
                agent.push_response_time(duration);
                agent.last_activity = now;
                if let Some(usage) = usage {
                    agent.cpu_usage = usage.cpu_usage;
                    agent.memory_usage = usage.memory_usage;
                }
                if agent.current_task_id.as_deref() == Some(task_id) {
                    agent.current_task_id = None;
                }
                if agent.status != AgentStatus::Error {
                    agent.status = match agent.active_tasks {
                        0 => AgentStatus::Idle,
                        1 => AgentStatus::Busy,
                        _ => AgentStatus::Overloaded,
                    };
                }
            }
            None => debug!(task_id = %task_id, "Completed task has no registered agent"),
        }

        debug!(task_id = %task_id, success, duration_secs = duration, "Task finished");
        Ok(finished)
    }

    /// Start tracking an agent; re-registering keeps its history
    pub fn register_agent(&self, agent_id: &str, role: AgentRole) {
        let mut state = self.lock();
        state
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentRecord::new(agent_id, role, Utc::now()));
    }

    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        self.lock().agents.remove(agent_id).is_some()
    }

    pub fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        cpu_usage: f64,
        memory_usage: f64,
    ) -> Result<()> {
        let mut state = self.lock();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ScalerError::UnknownAgent(agent_id.to_string()))?;
        agent.status = status;
        agent.cpu_usage = cpu_usage;
        agent.memory_usage = memory_usage;
        agent.last_activity = Utc::now();
        Ok(())
    }

    pub fn record_host_load(&self, load: HostLoad) {
        self.lock().host_load = load;
    }

    pub fn collect_snapshot(&self) -> SystemSnapshot {
        self.collect_snapshot_at(Utc::now())
    }

    /// Roll current state into a snapshot and append it to the history
    pub fn collect_snapshot_at(&self, now: DateTime<Utc>) -> SystemSnapshot {
        let mut state = self.lock();
        let throughput_start = now - chrono::Duration::seconds(THROUGHPUT_WINDOW_SECS);
        let recent_start = now - chrono::Duration::seconds(RECENT_WINDOW_SECS);

        let mut snapshot = SystemSnapshot {
            timestamp: now,
            total_agents: state.agents.len(),
            system_cpu: state.host_load.cpu_percent,
            system_memory: state.host_load.memory_percent,
            ..Default::default()
        };

        for agent in state.agents.values() {
            match agent.status {
                AgentStatus::Idle => snapshot.idle_agents += 1,
                AgentStatus::Busy => snapshot.busy_agents += 1,
                AgentStatus::Overloaded => snapshot.overloaded_agents += 1,
                AgentStatus::Error => snapshot.error_agents += 1,
            }
        }

        let mut waits = Vec::new();
        let mut durations = Vec::new();
        let mut recent_completed = 0usize;
        let mut recent_failed = 0usize;
        let mut minute_completed = 0usize;

        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => snapshot.pending_tasks += 1,
                TaskStatus::Running => snapshot.running_tasks += 1,
                TaskStatus::Completed => snapshot.completed_tasks += 1,
                TaskStatus::Failed => snapshot.failed_tasks += 1,
            }

            if task.status == TaskStatus::Pending {
                waits.push(task.wait_time(now));
            } else if let Some(started) = task.started_at {
                if started >= recent_start {
                    waits.push(task.wait_time(now));
                }
            }

            if let Some(completed) = task.completed_at {
                if completed >= recent_start {
                    match task.status {
                        TaskStatus::Completed => recent_completed += 1,
                        TaskStatus::Failed => recent_failed += 1,
                        _ => {}
                    }
                    if let Some(duration) = task.actual_duration {
                        durations.push(duration);
                    }
                }
                if completed >= throughput_start && task.status == TaskStatus::Completed {
                    minute_completed += 1;
                }
            }
        }

        snapshot.queue_length = snapshot.pending_tasks;
        snapshot.average_wait_time = mean(&waits);
        snapshot.average_processing_time = mean(&durations);
        snapshot.throughput = minute_completed as f64 / THROUGHPUT_WINDOW_SECS as f64;
        let recent_finished = recent_completed + recent_failed;
        snapshot.error_rate = if recent_finished == 0 {
            0.0
        } else {
            recent_failed as f64 / recent_finished as f64
        };

        state.snapshots.push_back(snapshot.clone());
        while state.snapshots.len() > self.snapshot_capacity {
            state.snapshots.pop_front();
        }

        snapshot
    }

    pub fn latest_snapshot(&self) -> Option<SystemSnapshot> {
        self.lock().snapshots.back().cloned()
    }

    /// Up to `n` most recent snapshots, oldest first
    pub fn recent_snapshots(&self, n: usize) -> Vec<SystemSnapshot> {
        let state = self.lock();
        let start = state.snapshots.len().saturating_sub(n);
        state.snapshots.iter().skip(start).cloned().collect()
    }

    /// Severity of the latest snapshot, `very_low` before the first one
    pub fn severity(&self) -> Severity {
        self.latest_snapshot()
            .map(|s| classify(&s, &self.rules.thresholds))
            .unwrap_or(Severity::VeryLow)
    }

    pub fn view(&self, now: DateTime<Utc>) -> WorkloadView {
        let recent = self.recent_snapshots(super::rules::SUSTAINED_WINDOW);
        WorkloadView::from_history(&recent, &self.rules.thresholds)
            .unwrap_or_else(|| WorkloadView::empty(now))
    }

    pub fn should_scale_up(&self, gate: &ScaleGate) -> ScaleVerdict {
        evaluate_scale_up(&self.view(gate.now), gate, &self.rules)
    }

    pub fn should_scale_down(&self, gate: &ScaleGate) -> ScaleVerdict {
        evaluate_scale_down(&self.view(gate.now), gate, &self.rules)
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.lock().agents.get(agent_id).cloned()
    }

    pub fn agents(&self) -> Vec<AgentRecord> {
        self.lock().agents.values().cloned().collect()
    }

    pub fn agent_statuses(&self) -> Vec<(String, AgentStatus)> {
        self.lock()
            .agents
            .values()
            .map(|a| (a.id.clone(), a.status))
            .collect()
    }

    pub fn agent_performance(&self, agent_id: &str) -> Option<AgentPerformance> {
        self.lock().agents.get(agent_id).map(AgentPerformance::from)
    }

    pub fn task(&self, task_id: &str) -> Option<TaskRecord> {
        self.lock().tasks.get(task_id).cloned()
    }

    /// Run the collection loop until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            host_sampling = self.host.is_some(),
            "Starting workload collector"
        );

        let mut ticker = interval(self.interval);
        let mut collection_count = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(host) = &self.host {
                        let load = host.sample().await;
                        self.record_host_load(load);
                    }

                    let snapshot = self.collect_snapshot();
                    collection_count += 1;

                    if collection_count % 12 == 0 {
                        debug!(
                            agents = snapshot.total_agents,
                            queue_length = snapshot.queue_length,
                            throughput = snapshot.throughput,
                            severity = %classify(&snapshot, &self.rules.thresholds),
                            "Workload snapshot collected"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down workload collector");
                    break;
                }
            }
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn collector() -> WorkloadCollector {
        WorkloadCollector::new(&ScalerConfig::default())
    }

    #[test]
    fn test_completion_updates_agent() {
        let collector = collector();
        collector.register_agent("drone-x", AgentRole::Drone);

        let t0 = Utc::now();
        collector.on_task_submitted_at("t1", 0.5, 3, 2.0, t0);
        collector.on_task_started_at("t1", "drone-x", t0).unwrap();
        assert_eq!(collector.agent("drone-x").unwrap().status, AgentStatus::Busy);

        let done = t0 + ChronoDuration::milliseconds(2500);
        let task = collector.on_task_completed_at("t1", true, None, done).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        let agent = collector.agent("drone-x").unwrap();
        assert_eq!(agent.tasks_completed, 1);
        assert_eq!(agent.response_times.len(), 1);
        assert!((agent.response_times[0] - 2.5).abs() < 0.01);
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.current_task_id, None);
    }

    #[test]
    fn test_second_task_overloads_agent() {
        let collector = collector();
        collector.register_agent("a1", AgentRole::Drone);
        collector.on_task_submitted("t1", 0.1, 1, 1.0);
        collector.on_task_submitted("t2", 0.1, 1, 1.0);
        collector.on_task_started("t1", "a1").unwrap();
        collector.on_task_started("t2", "a1").unwrap();
        assert_eq!(collector.agent("a1").unwrap().status, AgentStatus::Overloaded);

        collector.on_task_completed("t1", true, None).unwrap();
        assert_eq!(collector.agent("a1").unwrap().status, AgentStatus::Busy);
    }

    #[test]
    fn test_transitions_are_forward_only() {
        let collector = collector();
        collector.on_task_submitted("t1", 0.1, 1, 1.0);

        assert!(matches!(
            collector.on_task_completed("t1", true, None),
            Err(ScalerError::InvalidTaskTransition { .. })
        ));
        collector.on_task_started("t1", "a1").unwrap();
        assert!(matches!(
            collector.on_task_started("t1", "a1"),
            Err(ScalerError::InvalidTaskTransition { .. })
        ));
        assert!(matches!(
            collector.on_task_started("missing", "a1"),
            Err(ScalerError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_resubmitting_finished_task_counts_retry() {
        let collector = collector();
        collector.on_task_submitted("t1", 0.1, 1, 1.0);
        collector.on_task_started("t1", "a1").unwrap();
        collector.on_task_completed("t1", false, None).unwrap();

        let retried = collector.on_task_submitted("t1", 0.1, 1, 1.0);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.status, TaskStatus::Pending);
    }

    #[test]
    fn test_snapshot_aggregates() {
        let collector = collector();
        let t0 = Utc::now();
        collector.register_agent("a1", AgentRole::Drone);
        collector.register_agent("a2", AgentRole::Drone);

        collector.on_task_submitted_at("ok", 0.1, 1, 1.0, t0);
        collector.on_task_started_at("ok", "a1", t0).unwrap();
        collector
            .on_task_completed_at("ok", true, None, t0 + ChronoDuration::seconds(4))
            .unwrap();

        collector.on_task_submitted_at("bad", 0.1, 1, 1.0, t0);
        collector.on_task_started_at("bad", "a2", t0).unwrap();
        collector
            .on_task_completed_at("bad", false, None, t0 + ChronoDuration::seconds(2))
            .unwrap();

        collector.on_task_submitted_at("queued", 0.1, 1, 1.0, t0);
        collector.record_host_load(HostLoad {
            cpu_percent: 42.0,
            memory_percent: 55.0,
        });

        let snapshot = collector.collect_snapshot_at(t0 + ChronoDuration::seconds(10));
        assert_eq!(snapshot.total_agents, 2);
        assert_eq!(snapshot.idle_agents, 2);
        assert_eq!(snapshot.completed_tasks, 1);
        assert_eq!(snapshot.failed_tasks, 1);
        assert_eq!(snapshot.queue_length, 1);
        assert!((snapshot.error_rate - 0.5).abs() < 1e-9);
        assert!((snapshot.average_processing_time - 3.0).abs() < 1e-9);
        assert!((snapshot.throughput - 1.0 / 60.0).abs() < 1e-9);
        assert_eq!(snapshot.system_cpu, 42.0);
        assert_eq!(collector.latest_snapshot(), Some(snapshot));
    }

    #[test]
    fn test_snapshot_ring_is_bounded() {
        let config = ScalerConfig {
            snapshot_history_size: 3,
            ..Default::default()
        };
        let collector = WorkloadCollector::new(&config);
        for _ in 0..5 {
            collector.collect_snapshot();
        }
        assert_eq!(collector.recent_snapshots(10).len(), 3);
    }

    #[test]
    fn test_finished_history_is_bounded() {
        let config = ScalerConfig {
            task_history_size: 2,
            ..Default::default()
        };
        let collector = WorkloadCollector::new(&config);
        for id in ["t1", "t2", "t3"] {
            collector.on_task_submitted(id, 0.1, 1, 1.0);
            collector.on_task_started(id, "a1").unwrap();
            collector.on_task_completed(id, true, None).unwrap();
        }
        assert!(collector.task("t1").is_none());
        assert!(collector.task("t3").is_some());
    }

    #[test]
    fn test_scale_verdicts_from_collected_history() {
        let collector = collector();
        for i in 0..25 {
            collector.on_task_submitted(&format!("t{}", i), 0.5, 1, 5.0);
        }
        collector.register_agent("a1", AgentRole::Queen);
        collector.collect_snapshot();

        let gate = ScaleGate::new(1, Utc::now());
        let up = collector.should_scale_up(&gate);
        let down = collector.should_scale_down(&gate);
        assert!(up.scale);
        assert_eq!(up.step, 2);
        assert!(!down.scale);
        assert_eq!(collector.severity(), Severity::VeryHigh);
    }

    #[test]
    fn test_agent_performance() {
        let collector = collector();
        collector.register_agent("a1", AgentRole::SubQueen);
        assert!(collector.agent_performance("missing").is_none());

        let perf = collector.agent_performance("a1").unwrap();
        assert_eq!(perf.role, AgentRole::SubQueen);
        assert_eq!(perf.success_rate, 1.0);
        assert!(collector.unregister_agent("a1"));
        assert!(!collector.unregister_agent("a1"));
    }
}
