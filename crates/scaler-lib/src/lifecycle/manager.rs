//! Dynamic agent lifecycle manager
//!
//! Executes scaling verdicts through an injected `AgentFactory`. Requests
//! are queued and drained by a worker task: creations in bounded
//! concurrent batches, terminations one at a time. A cleanup task retires
//! agents stuck initializing or idle for too long.

use super::{AgentFactory, AgentHandle, LifecycleInfo, LifecycleState};
use crate::config::ScalerConfig;
use crate::error::{Result, ScalerError};
use crate::models::{seconds_between, AgentRole, AgentStatus};
use crate::observability::{ScalerMetrics, StructuredLogger};
use crate::workload::WorkloadCollector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Terminated and failed records are kept this long for the status endpoint
const RECORD_RETENTION_SECS: i64 = 3600;

/// Timing and batching knobs
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub init_timeout: Duration,
    pub idle_timeout: Duration,
    pub graceful_timeout: Duration,
    /// Interval between busy checks while draining an agent
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub cleanup_interval: Duration,
    /// Worker wake-up interval when no request notifies it
    pub queue_interval: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&ScalerConfig::default())
    }
}

impl LifecycleSettings {
    pub fn from_config(config: &ScalerConfig) -> Self {
        Self {
            init_timeout: Duration::from_secs(config.init_timeout_seconds),
            idle_timeout: Duration::from_secs(config.idle_timeout_seconds),
            graceful_timeout: Duration::from_secs(config.graceful_shutdown_timeout_seconds),
            poll_interval: Duration::from_secs(1),
            batch_size: config.batch_creation_size.max(1),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds),
            queue_interval: Duration::from_secs(1),
        }
    }
}

/// Result of one creation attempt
#[derive(Debug)]
pub enum CreationOutcome {
    Created { agent_id: String },
    Failed { agent_id: String, error: ScalerError },
}

impl CreationOutcome {
    pub fn agent_id(&self) -> &str {
        match self {
            CreationOutcome::Created { agent_id } | CreationOutcome::Failed { agent_id, .. } => {
                agent_id
            }
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreationOutcome::Created { .. })
    }
}

/// Resolves once a queued request has run
///
/// Yields `false` when the request failed or was dropped unexecuted.
#[derive(Debug)]
pub struct RequestTicket(oneshot::Receiver<bool>);

impl RequestTicket {
    pub async fn outcome(self) -> bool {
        self.0.await.unwrap_or(false)
    }
}

/// Aggregate view for the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleStatus {
    pub counted_agents: usize,
    pub effective_agents: usize,
    pub by_state: BTreeMap<String, usize>,
    pub by_role: BTreeMap<String, usize>,
    pub pending_creations: usize,
    pub pending_terminations: usize,
    pub agents: Vec<LifecycleInfo>,
}

#[derive(Debug)]
struct CreationRequest {
    role: AgentRole,
    model: String,
    reason: String,
    done: oneshot::Sender<bool>,
}

#[derive(Debug)]
struct TerminationRequest {
    agent_id: String,
    reason: String,
    waiters: Vec<oneshot::Sender<bool>>,
}

#[derive(Debug, Default)]
struct RequestQueue {
    creations: VecDeque<CreationRequest>,
    terminations: VecDeque<TerminationRequest>,
}

struct ManagedAgent {
    info: LifecycleInfo,
    handle: Option<Arc<dyn AgentHandle>>,
}

/// Owns every agent's lifecycle record
///
/// The record map lock is never held across a factory call.
pub struct LifecycleManager {
    factory: Arc<dyn AgentFactory>,
    settings: LifecycleSettings,
    agents: RwLock<HashMap<String, ManagedAgent>>,
    queue: Mutex<RequestQueue>,
    wake: Notify,
    collector: Option<Arc<WorkloadCollector>>,
    logger: StructuredLogger,
    metrics: ScalerMetrics,
}

impl LifecycleManager {
    pub fn new(factory: Arc<dyn AgentFactory>, settings: LifecycleSettings) -> Self {
        Self {
            factory,
            settings,
            agents: RwLock::new(HashMap::new()),
            queue: Mutex::new(RequestQueue::default()),
            wake: Notify::new(),
            collector: None,
            logger: StructuredLogger::default(),
            metrics: ScalerMetrics::new(),
        }
    }

    /// Register agents with the collector when active, unregister on exit
    pub fn with_collector(mut self, collector: Arc<WorkloadCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    fn queue(&self) -> MutexGuard<'_, RequestQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create one agent and wait for it to become active
    ///
    /// Never panics on factory failure: the record goes to `error` and the
    /// failure is returned in the outcome.
    pub async fn create_agent(
        &self,
        role: AgentRole,
        model: &str,
        reason: &str,
    ) -> CreationOutcome {
        let agent_id = format!("{}-{}", role.as_str(), &Uuid::new_v4().simple().to_string()[..8]);
        let now = Utc::now();

        {
            let mut agents = self.agents.write().await;
            let mut info = LifecycleInfo::new(
                agent_id.clone(),
                role,
                model.to_string(),
                reason.to_string(),
                now,
            );
            info.state = LifecycleState::Initializing;
            agents.insert(agent_id.clone(), ManagedAgent { info, handle: None });
        }
        debug!(agent_id = %agent_id, role = %role, model = %model, "Initializing agent");

        let created = tokio::time::timeout(
            self.settings.init_timeout,
            self.factory.create(&agent_id, role, model),
        )
        .await;

        let failure = match created {
            Ok(Ok(handle)) => return self.activate(&agent_id, role, handle).await,
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => format!(
                "initialization timed out after {}s",
                self.settings.init_timeout.as_secs()
            ),
        };

        self.fail(&agent_id, &failure).await;
        self.metrics.inc_creation_failures();
        self.logger.log_agent_creation_failed(&agent_id, role, &failure);

        CreationOutcome::Failed {
            error: ScalerError::CreationFailure {
                agent_id: agent_id.clone(),
                reason: failure,
            },
            agent_id,
        }
    }

    async fn activate(
        &self,
        agent_id: &str,
        role: AgentRole,
        handle: Arc<dyn AgentHandle>,
    ) -> CreationOutcome {
        let activated = {
            let mut agents = self.agents.write().await;
            match agents.get_mut(agent_id) {
                Some(agent) if agent.info.state == LifecycleState::Initializing => {
                    let now = Utc::now();
                    agent.info.state = LifecycleState::Active;
                    agent.info.initialized_at = Some(now);
                    agent.info.last_activity = Some(now);
                    agent.handle = Some(handle.clone());
                    Some(agent.info.clone())
                }
                _ => None,
            }
        };

        let Some(info) = activated else {
            // Retired while the factory was still creating it
            warn!(agent_id = %agent_id, "Agent retired during initialization, tearing down");
            if let Err(e) = self.factory.terminate(handle).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to tear down orphaned agent");
            }
            return CreationOutcome::Failed {
                agent_id: agent_id.to_string(),
                error: ScalerError::CreationFailure {
                    agent_id: agent_id.to_string(),
                    reason: "agent retired during initialization".into(),
                },
            };
        };

        if let Some(collector) = &self.collector {
            collector.register_agent(agent_id, role);
        }
        self.metrics.inc_agents_created();
        self.logger.log_agent_created(&info);

        CreationOutcome::Created {
            agent_id: agent_id.to_string(),
        }
    }

    /// Move a record to `error` unless it is already terminal
    async fn fail(&self, agent_id: &str, message: &str) {
        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            if agent.info.state.can_transition_to(LifecycleState::Error) {
                agent.info.state = LifecycleState::Error;
            }
            agent.info.error_message = Some(message.to_string());
            agent.handle = None;
        }
    }

    fn busy_elsewhere(&self, agent_id: &str) -> bool {
        self.collector
            .as_ref()
            .and_then(|c| c.agent(agent_id))
            .map(|a| a.active_tasks > 0)
            .unwrap_or(false)
    }

    /// Drain and tear down one agent
    ///
    /// Waits for the agent to stop being busy for at most the graceful
    /// timeout, then tears it down regardless. Returns true once the agent
    /// is terminated.
    pub async fn terminate_agent(&self, agent_id: &str, reason: &str) -> bool {
        self.try_terminate_agent(agent_id, reason).await.is_ok()
    }

    /// Same as `terminate_agent`, reporting why the agent was not terminated
    pub async fn try_terminate_agent(&self, agent_id: &str, reason: &str) -> Result<()> {
        let handle = {
            let mut agents = self.agents.write().await;
            let Some(agent) = agents.get_mut(agent_id) else {
                warn!(agent_id = %agent_id, "Termination requested for unknown agent");
                return Err(ScalerError::UnknownAgent(agent_id.to_string()));
            };
            if !agent.info.state.can_transition_to(LifecycleState::Terminating) {
                debug!(agent_id = %agent_id, state = %agent.info.state, "Agent not terminable");
                return Err(ScalerError::InvalidTransition {
                    agent_id: agent_id.to_string(),
                    from: agent.info.state.to_string(),
                    to: LifecycleState::Terminating.to_string(),
                });
            }
            agent.info.state = LifecycleState::Terminating;
            agent.info.termination_requested_at = Some(Utc::now());
            agent.info.termination_reason = Some(reason.to_string());
            agent.handle.clone()
        };

        let outcome = match handle {
            Some(handle) => {
                self.wait_until_idle(agent_id, handle.as_ref()).await;
                let teardown = tokio::time::timeout(
                    self.settings.graceful_timeout,
                    self.factory.terminate(handle),
                );
                match teardown.await {
                    Ok(Ok(true)) => Ok(()),
                    Ok(Ok(false)) => Err("teardown refused by runtime".to_string()),
                    Ok(Err(e)) => Err(format!("{:#}", e)),
                    Err(_) => Err(format!(
                        "teardown timed out after {}s",
                        self.settings.graceful_timeout.as_secs()
                    )),
                }
            }
            None => Ok(()),
        };

        if let Err(message) = outcome {
            self.fail(agent_id, &message).await;
            self.metrics.inc_termination_failures();
            self.logger.log_agent_termination_failed(agent_id, reason, &message);
            return Err(ScalerError::TerminationFailure {
                agent_id: agent_id.to_string(),
                reason: message,
            });
        }

        {
            let mut agents = self.agents.write().await;
            let Some(agent) = agents.get_mut(agent_id) else {
                return Err(ScalerError::UnknownAgent(agent_id.to_string()));
            };
            // The record may have failed while the teardown was running
            let current = agent.info.state;
            if !current.can_transition_to(LifecycleState::Terminated) {
                warn!(
                    agent_id = %agent_id,
                    state = %current,
                    "Agent left terminating during teardown"
                );
                return Err(ScalerError::InvalidTransition {
                    agent_id: agent_id.to_string(),
                    from: current.to_string(),
                    to: LifecycleState::Terminated.to_string(),
                });
            }
            agent.info.state = LifecycleState::Terminated;
            agent.info.terminated_at = Some(Utc::now());
            agent.handle = None;
        }

        if let Some(collector) = &self.collector {
            collector.unregister_agent(agent_id);
        }
        self.metrics.inc_agents_terminated();
        self.logger.log_agent_terminated(agent_id, reason);
        Ok(())
    }

    async fn wait_until_idle(&self, agent_id: &str, handle: &dyn AgentHandle) {
        let deadline = Instant::now() + self.settings.graceful_timeout;

        while handle.is_busy() || self.busy_elsewhere(agent_id) {
            if Instant::now() >= deadline {
                warn!(
                    agent_id = %agent_id,
                    timeout_secs = self.settings.graceful_timeout.as_secs(),
                    "Agent still busy after graceful timeout, terminating anyway"
                );
                return;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Queue one creation for the worker
    pub fn request_creation(&self, role: AgentRole, model: &str, reason: &str) -> RequestTicket {
        let (done, ticket) = oneshot::channel();
        self.queue().creations.push_back(CreationRequest {
            role,
            model: model.to_string(),
            reason: reason.to_string(),
            done,
        });
        self.wake.notify_one();
        RequestTicket(ticket)
    }

    /// Queue one termination for the worker
    ///
    /// A second request for an agent already queued joins the first one.
    pub fn request_termination(&self, agent_id: &str, reason: &str) -> RequestTicket {
        let (done, ticket) = oneshot::channel();
        {
            let mut queue = self.queue();
            match queue.terminations.iter_mut().find(|r| r.agent_id == agent_id) {
                Some(queued) => queued.waiters.push(done),
                None => queue.terminations.push_back(TerminationRequest {
                    agent_id: agent_id.to_string(),
                    reason: reason.to_string(),
                    waiters: vec![done],
                }),
            }
        }
        self.wake.notify_one();
        RequestTicket(ticket)
    }

    pub fn pending_requests(&self) -> (usize, usize) {
        let queue = self.queue();
        (queue.creations.len(), queue.terminations.len())
    }

    /// Run one batch of queued creations, then every queued termination
    ///
    /// Returns how many agents were created and terminated.
    pub async fn process_queue(self: &Arc<Self>) -> (usize, usize) {
        let (batch, terminations): (Vec<_>, Vec<_>) = {
            let mut queue = self.queue();
            let take = queue.creations.len().min(self.settings.batch_size);
            (
                queue.creations.drain(..take).collect(),
                queue.terminations.drain(..).collect(),
            )
        };

        let mut created = 0;
        if !batch.is_empty() {
            let mut set = JoinSet::new();
            for request in batch {
                let manager = Arc::clone(self);
                set.spawn(async move {
                    let outcome = manager
                        .create_agent(request.role, &request.model, &request.reason)
                        .await;
                    // The requester may have stopped waiting
                    let _ = request.done.send(outcome.is_created());
                    outcome
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(outcome) if outcome.is_created() => created += 1,
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Creation task panicked"),
                }
            }
        }

        let mut terminated = 0;
        for request in terminations {
            let done = self.terminate_agent(&request.agent_id, &request.reason).await;
            if done {
                terminated += 1;
            }
            for waiter in request.waiters {
                let _ = waiter.send(done);
            }
        }

        (created, terminated)
    }

    /// Drain the request queue whenever notified, until shutdown
    pub async fn run_queue_worker(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        info!(batch_size = self.settings.batch_size, "Starting lifecycle queue worker");
        let mut ticker = interval(self.settings.queue_interval);

        loop {
            tokio::select! {
                _ = self.wake.notified() => self.drain().await,
                _ = ticker.tick() => self.drain().await,
                _ = shutdown.recv() => {
                    info!("Shutting down lifecycle queue worker");
                    break;
                }
            }
        }
    }

    async fn drain(self: &Arc<Self>) {
        loop {
            let (creations, terminations) = self.pending_requests();
            if creations == 0 && terminations == 0 {
                return;
            }
            let (created, terminated) = self.process_queue().await;
            debug!(created, terminated, "Processed lifecycle queue");
        }
    }

    pub async fn run_cleanup(&self) -> Vec<String> {
        self.run_cleanup_at(Utc::now()).await
    }

    /// Retire agents stuck initializing or idle past their timeouts
    ///
    /// Also prunes terminated and failed records older than the retention
    /// window. Returns the ids that were terminated.
    pub async fn run_cleanup_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let init_timeout = self.settings.init_timeout.as_secs_f64();
        let idle_timeout = self.settings.idle_timeout.as_secs_f64();

        let candidates: Vec<(String, &'static str)> = {
            let mut agents = self.agents.write().await;
            agents.retain(|agent_id, agent| {
                let info = &agent.info;
                let since = match info.state {
                    LifecycleState::Terminated => info.terminated_at.unwrap_or(info.created_at),
                    LifecycleState::Error => {
                        info.termination_requested_at.unwrap_or(info.created_at)
                    }
                    _ => return true,
                };
                let keep = (now - since).num_seconds() < RECORD_RETENTION_SECS;
                if !keep && info.state == LifecycleState::Error && info.is_counted() {
                    warn!(agent_id = %agent_id, "Dropping record of agent whose teardown failed");
                }
                keep
            });

            agents
                .values()
                .filter_map(|agent| {
                    let info = &agent.info;
                    match info.state {
                        LifecycleState::Initializing
                            if seconds_between(info.created_at, now) > init_timeout =>
                        {
                            Some((info.agent_id.clone(), "initialization_timeout"))
                        }
                        LifecycleState::Idle
                            if seconds_between(info.last_activity.unwrap_or(info.created_at), now)
                                > idle_timeout =>
                        {
                            Some((info.agent_id.clone(), "idle_timeout"))
                        }
                        _ => None,
                    }
                })
                .collect()
        };

        let mut terminated = Vec::new();
        for (agent_id, reason) in candidates {
            info!(agent_id = %agent_id, reason = %reason, "Cleaning up agent");
            if self.terminate_agent(&agent_id, reason).await {
                terminated.push(agent_id);
            }
        }
        terminated
    }

    /// Run the cleanup loop until shutdown
    pub async fn run_cleanup_loop(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        info!(
            interval_secs = self.settings.cleanup_interval.as_secs(),
            idle_timeout_secs = self.settings.idle_timeout.as_secs(),
            "Starting lifecycle cleanup"
        );
        let mut ticker = interval(self.settings.cleanup_interval);
        // The first tick fires immediately; nothing can be stale yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cleaned = self.run_cleanup().await;
                    if !cleaned.is_empty() {
                        info!(count = cleaned.len(), "Cleanup retired agents");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down lifecycle cleanup");
                    break;
                }
            }
        }
    }

    async fn transition_running(
        &self,
        agent_id: &str,
        next: LifecycleState,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| ScalerError::UnknownAgent(agent_id.to_string()))?;

        let current = agent.info.state;
        if current == next {
            agent.info.last_activity = Some(at);
            return Ok(());
        }
        if !current.is_running() || !current.can_transition_to(next) {
            return Err(ScalerError::InvalidTransition {
                agent_id: agent_id.to_string(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        agent.info.state = next;
        agent.info.last_activity = Some(at);
        Ok(())
    }

    pub async fn mark_busy(&self, agent_id: &str) -> Result<()> {
        self.transition_running(agent_id, LifecycleState::Busy, Utc::now()).await
    }

    pub async fn mark_idle(&self, agent_id: &str) -> Result<()> {
        self.mark_idle_at(agent_id, Utc::now()).await
    }

    /// Mark idle, with the idle period starting at `at`
    pub async fn mark_idle_at(&self, agent_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.transition_running(agent_id, LifecycleState::Idle, at).await
    }

    /// Mirror collector statuses into running lifecycle states
    ///
    /// Idle agents take the collector's last activity so the idle timeout
    /// counts from the end of their last task.
    pub async fn sync_activity(&self) {
        let Some(collector) = &self.collector else {
            return;
        };
        let records = collector.agents();

        let mut agents = self.agents.write().await;
        for record in records {
            let Some(agent) = agents.get_mut(&record.id) else {
                continue;
            };
            if !agent.info.state.is_running() {
                continue;
            }
            let next = match record.status {
                AgentStatus::Busy | AgentStatus::Overloaded => LifecycleState::Busy,
                AgentStatus::Idle => LifecycleState::Idle,
                AgentStatus::Error => continue,
            };
            if agent.info.state != next {
                agent.info.state = next;
                agent.info.last_activity = Some(record.last_activity);
            } else if next == LifecycleState::Busy {
                agent.info.last_activity = Some(record.last_activity);
            }
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<LifecycleInfo> {
        self.agents.read().await.get(agent_id).map(|a| a.info.clone())
    }

    /// Counted agents of one role
    pub async fn agents_by_role(&self, role: AgentRole) -> Vec<LifecycleInfo> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.info.role == role && a.info.is_counted())
            .map(|a| a.info.clone())
            .collect()
    }

    pub async fn idle_agents(&self) -> Vec<LifecycleInfo> {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.info.state == LifecycleState::Idle)
            .map(|a| a.info.clone())
            .collect()
    }

    /// Agents counted toward the fleet size
    pub async fn agent_count(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.info.is_counted())
            .count()
    }

    /// Counted agents adjusted by queued requests
    pub async fn effective_count(&self) -> usize {
        let counted = self.agent_count().await;
        let (creations, terminations) = self.pending_requests();
        (counted + creations).saturating_sub(terminations)
    }

    /// Role counts of counted agents plus queued creations
    pub async fn planned_roles(&self) -> HashMap<AgentRole, usize> {
        let mut roles = HashMap::new();
        for agent in self.agents.read().await.values() {
            if agent.info.is_counted() && agent.info.state != LifecycleState::Terminating {
                *roles.entry(agent.info.role).or_insert(0) += 1;
            }
        }
        for request in &self.queue().creations {
            *roles.entry(request.role).or_insert(0) += 1;
        }
        roles
    }

    /// Pick up to `n` agents to retire, longest idle first
    ///
    /// Idle agents go before active ones; busy agents and agents already
    /// queued for termination are skipped. The last queen is never picked.
    pub async fn select_for_termination(&self, n: usize) -> Vec<String> {
        let queued: Vec<String> = self
            .queue()
            .terminations
            .iter()
            .map(|r| r.agent_id.clone())
            .collect();

        let agents = self.agents.read().await;
        let mut queens = agents
            .values()
            .filter(|a| {
                a.info.role == AgentRole::Queen
                    && a.info.state.is_running()
                    && !queued.contains(&a.info.agent_id)
            })
            .count();

        let mut candidates: Vec<&LifecycleInfo> = agents
            .values()
            .map(|a| &a.info)
            .filter(|info| {
                matches!(info.state, LifecycleState::Idle | LifecycleState::Active)
                    && !queued.contains(&info.agent_id)
            })
            .collect();
        candidates.sort_by_key(|info| {
            (
                info.state != LifecycleState::Idle,
                info.last_activity.unwrap_or(info.created_at),
            )
        });

        let mut selected = Vec::with_capacity(n);
        for info in candidates {
            if selected.len() >= n {
                break;
            }
            if info.role == AgentRole::Queen {
                if queens <= 1 {
                    continue;
                }
                queens -= 1;
            }
            selected.push(info.agent_id.clone());
        }
        selected
    }

    pub async fn detailed_status(&self) -> LifecycleStatus {
        let (pending_creations, pending_terminations) = self.pending_requests();
        let agents = self.agents.read().await;

        let mut by_state = BTreeMap::new();
        let mut by_role = BTreeMap::new();
        let mut counted = 0;
        for agent in agents.values() {
            *by_state.entry(agent.info.state.to_string()).or_insert(0) += 1;
            if agent.info.is_counted() {
                counted += 1;
                *by_role.entry(agent.info.role.to_string()).or_insert(0) += 1;
            }
        }

        let mut infos: Vec<LifecycleInfo> = agents.values().map(|a| a.info.clone()).collect();
        infos.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        LifecycleStatus {
            counted_agents: counted,
            effective_agents: (counted + pending_creations).saturating_sub(pending_terminations),
            by_state,
            by_role,
            pending_creations,
            pending_terminations,
            agents: infos,
        }
    }

    /// Publish per-state agent gauges
    pub async fn publish_metrics(&self) {
        let status = self.detailed_status().await;
        for state in LifecycleState::ALL {
            let count = status.by_state.get(state.as_str()).copied().unwrap_or(0);
            self.metrics.set_agents_in_state(state.as_str(), count as i64);
        }
    }

    /// Terminate every live agent concurrently
    ///
    /// Drops queued requests first, which resolves their tickets as failed.
    /// Gives up after the graceful timeout; agents still terminating then
    /// go to `error`. Returns how many agents reached `terminated`.
    pub async fn shutdown_all(self: &Arc<Self>, reason: &str) -> usize {
        {
            let mut queue = self.queue();
            queue.creations.clear();
            queue.terminations.clear();
        }

        let ids: Vec<String> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.info.state.can_transition_to(LifecycleState::Terminating))
            .map(|a| a.info.agent_id.clone())
            .collect();
        if ids.is_empty() {
            return 0;
        }
        info!(count = ids.len(), reason = %reason, "Shutting down all agents");

        let mut set = JoinSet::new();
        for agent_id in ids.iter().cloned() {
            let manager = Arc::clone(self);
            let reason = reason.to_string();
            set.spawn(async move { manager.terminate_agent(&agent_id, &reason).await });
        }

        let mut terminated = 0;
        let deadline = self.settings.graceful_timeout;
        let joined = tokio::time::timeout(deadline, async {
            while let Some(result) = set.join_next().await {
                if matches!(result, Ok(true)) {
                    terminated += 1;
                }
            }
        })
        .await;

        if joined.is_err() {
            set.abort_all();
            warn!(
                timeout_secs = deadline.as_secs(),
                terminated,
                "Graceful shutdown timed out, abandoning remaining agents"
            );
            for agent_id in &ids {
                let stuck = matches!(
                    self.agents.read().await.get(agent_id).map(|a| a.info.state),
                    Some(LifecycleState::Terminating)
                );
                if stuck {
                    self.fail(agent_id, "shutdown timed out during teardown").await;
                }
            }
        }
        terminated
    }
}
