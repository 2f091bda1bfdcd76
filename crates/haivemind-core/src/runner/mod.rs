//! The Task Runner: DAG execution over a session's plan (spec §4.3, the
//! hardest subsystem).
//!
//! Computes wave numbers by longest-path-from-root, schedules eligible
//! tasks under a dynamically computed concurrency limit (with speculative
//! execution of likely-safe pending tasks), launches agents through the
//! `AgentManager`, retries/escalates/splits on failure, rewrites the DAG
//! in place when a task stalls long enough that its dependents turn out
//! not to need its output, and resolves human-gated tasks through a
//! one-shot `resolveGate` call.
//!
//! Mirrors the shape of a classic async orchestration loop: a semaphore-less
//! scheduling pass hands eligible tasks to `tokio::spawn`, results flow back
//! over an `mpsc` channel, and the loop is the only place that mutates
//! `TaskState` -- the single-writer model required by spec §5.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;
use uuid::Uuid;

use haivemind_state::engine::GateResolution;
use haivemind_state::models::{
    Agent, AgentStatus, Edge, FailureReport, Project, ProjectSkills, RewriteRecord, Session,
    SwarmStats, Task, TaskState, TaskStatus, TaskType,
};
use haivemind_state::{Engine, Protocol};

use crate::agent::manager::AgentManager;
use crate::broadcast::Broadcaster;
use crate::summarizer::{summarize, summary_to_context};

/// Keywords marking a dependent task as having a true data dependency on a
/// predecessor (spec §4.3 "True-data-dependency heuristic"). Presence of
/// any keyword, anywhere in the dependent's description, is sufficient to
/// preserve the edge -- the stronger "alongside the staller's label" test
/// in the spec text is subsumed by this weaker one.
const TRUE_DEP_KEYWORDS: &[&str] = &[
    "uses output of",
    "reads from",
    "depends on data from",
    "imports from",
    "requires result",
    "consumes",
    "reads output",
    "needs file from",
    "generated by",
];

/// Injected sub-planner used by task splitting (the spec's `orchestratorFn`).
/// Given a split prompt and the session's work dir, returns 2-4 sub-tasks.
pub type SplitFn = Arc<
    dyn Fn(String, PathBuf) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<Task>>> + Send>>
        + Send
        + Sync,
>;

/// Tunables not pinned down by the data model (spec §9 open questions);
/// decisions recorded in DESIGN.md.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Baseline concurrency before the `log2(eligible)` scale-up term.
    pub base_cap: usize,
    pub speculative_enabled: bool,
    /// Fraction of a task's dependencies that must be `success` before its
    /// still-running remainder makes it speculation-eligible.
    pub speculative_threshold: f64,
    pub task_split_enabled: bool,
    /// Retry count at which a task becomes eligible for splitting.
    pub task_split_after_retries: u32,
    pub stall_threshold_ms: u64,
    pub stall_check_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_cap: 2,
            speculative_enabled: true,
            speculative_threshold: 0.5,
            task_split_enabled: true,
            task_split_after_retries: 2,
            stall_threshold_ms: 5 * 60 * 1000,
            stall_check_interval_ms: 30_000,
        }
    }
}

/// Outcome of running a session's plan to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Partial,
}

struct LaunchResult {
    task_id: String,
    agent: Agent,
}

enum PassResult {
    Launch(LaunchResult),
    GateResolved {
        task_id: String,
        approved: bool,
        feedback: Option<String>,
    },
}

/// DAG execution engine for one session's plan. One instance per running
/// session; owns no state of its own beyond bookkeeping -- the session
/// itself (reached through `engine`) is the single source of truth.
pub struct TaskRunner {
    engine: Arc<Engine>,
    session_id: Uuid,
    agent_manager: Arc<AgentManager>,
    broadcaster: Broadcaster,
    project: Project,
    config: RunnerConfig,
    split_fn: Option<SplitFn>,
    waves: Mutex<HashMap<String, usize>>,
    total_waves: Mutex<usize>,
    gate_requested: Mutex<HashSet<String>>,
}

impl TaskRunner {
    pub fn new(
        engine: Arc<Engine>,
        session_id: Uuid,
        agent_manager: Arc<AgentManager>,
        broadcaster: Broadcaster,
        project: Project,
        config: RunnerConfig,
        split_fn: Option<SplitFn>,
    ) -> Self {
        Self {
            engine,
            session_id,
            agent_manager,
            broadcaster,
            project,
            config,
            split_fn,
            waves: Mutex::new(HashMap::new()),
            total_waves: Mutex::new(0),
            gate_requested: Mutex::new(HashSet::new()),
        }
    }

    fn session_handle(&self) -> impl Future<Output = Option<Arc<tokio::sync::Mutex<Session>>>> + '_ {
        self.engine.get_session(self.session_id)
    }

    /// Run the plan to completion: schedule, launch, retry/split/rewrite,
    /// gate, until every non-`prompt` task is `success` or `blocked`.
    pub async fn run(&self) -> RunOutcome {
        self.initialize().await;

        let (tx, mut rx) = mpsc::channel::<PassResult>(64);
        let mut running: usize = 0;
        let mut stall_timer = tokio::time::interval(Duration::from_millis(
            self.config.stall_check_interval_ms.max(1),
        ));
        stall_timer.tick().await; // first tick fires immediately; consume it

        loop {
            if self.is_cancelled().await {
                break;
            }

            self.auto_complete_prompt_tasks().await;

            let to_launch = self.schedule_pass(running, &tx).await;
            running += to_launch.len();
            for task in to_launch {
                self.spawn_launch(task, tx.clone());
            }

            if self.check_completion().await {
                break;
            }

            if running == 0 {
                // Nothing in flight and nothing eligible: only a gate
                // resolution or the stall timer can move things forward.
                tokio::select! {
                    Some(result) = rx.recv() => self.dispatch_pass_result(result, &mut running, &tx).await,
                    _ = stall_timer.tick() => self.check_for_stalls().await,
                }
            } else {
                tokio::select! {
                    Some(result) = rx.recv() => self.dispatch_pass_result(result, &mut running, &tx).await,
                    _ = stall_timer.tick() => self.check_for_stalls().await,
                }
            }
        }

        self.finalize().await
    }

    async fn dispatch_pass_result(
        &self,
        result: PassResult,
        running: &mut usize,
        tx: &mpsc::Sender<PassResult>,
    ) {
        match result {
            PassResult::Launch(lr) => {
                *running -= 1;
                self.handle_launch_result(lr, tx).await;
            }
            PassResult::GateResolved { task_id, approved, feedback } => {
                self.handle_gate_resolution(&task_id, approved, feedback).await;
            }
        }
    }

    async fn is_cancelled(&self) -> bool {
        match self.engine.active_context(self.session_id).await {
            Some(ctx) => ctx.cancel.is_cancelled(),
            None => true,
        }
    }

    /// Build waves, seed `TaskState` for every plan task, detect circular
    /// residue, and stamp `swarmStats.totalTasks/totalWaves`.
    async fn initialize(&self) {
        let Some(session_arc) = self.session_handle().await else { return; };
        let mut session = session_arc.lock().await;

        let ids: Vec<String> = session.plan.iter().map(|t| t.id.clone()).collect();
        for id in ids {
            session.task_states.entry(id).or_insert_with(TaskState::new);
        }

        let residue = detect_cyclic_residue(&session.plan);
        if !residue.is_empty() {
            warn!(session_id = %self.session_id, ?residue, "circular dependency residue detected in plan");
        }

        let (waves, total) = compute_waves(&session.plan);
        session.swarm_stats.total_tasks = session.plan.len();
        session.swarm_stats.total_waves = total;
        drop(session);

        *self.waves.lock().await = waves;
        *self.total_waves.lock().await = total;
    }

    /// Bridge `prompt` tasks never execute; once their deps are satisfied
    /// they settle directly into `success` (spec §3 Task.type).
    async fn auto_complete_prompt_tasks(&self) {
        let Some(session_arc) = self.session_handle().await else { return; };
        let mut session = session_arc.lock().await;
        let mut completed = Vec::new();
        for task in session.plan.clone() {
            if task.task_type != TaskType::Prompt {
                continue;
            }
            let is_pending = session
                .task_states
                .get(&task.id)
                .map(|s| s.status == TaskStatus::Pending)
                .unwrap_or(false);
            if is_pending && deps_all_success(&session, &task) {
                if let Some(ts) = session.task_states.get_mut(&task.id) {
                    ts.status = TaskStatus::Success;
                    ts.completed_at = Some(Utc::now());
                }
                completed.push(task.id.clone());
            }
        }
        drop(session);
        for task_id in completed {
            self.broadcast_task_status(&task_id, TaskStatus::Success).await;
        }
    }

    /// `_scheduleEligible`: compute the dynamic concurrency limit, enqueue
    /// eligible (and, if room remains, speculative) tasks, and flip their
    /// state to `running` atomically before releasing the session lock.
    async fn schedule_pass(&self, running: usize, tx: &mpsc::Sender<PassResult>) -> Vec<Task> {
        let Some(session_arc) = self.session_handle().await else { return Vec::new(); };
        let mut session = session_arc.lock().await;

        let eligible_ids: Vec<String> = session
            .plan
            .iter()
            .filter(|t| t.task_type != TaskType::Prompt)
            .filter(|t| {
                matches!(
                    session.task_states.get(&t.id).map(|s| s.status),
                    Some(TaskStatus::Pending) | Some(TaskStatus::Gated)
                )
            })
            .filter(|t| deps_all_success(&session, t))
            .map(|t| t.id.clone())
            .collect();

        let total_eligible = eligible_ids.len();
        let swarm_max = self.project.settings.max_concurrency;
        let scale = (((total_eligible + 1) as f64).log2() * 2.0).ceil() as usize;
        let dynamic_limit = (self.config.base_cap + scale).min(swarm_max.max(self.config.base_cap));

        if dynamic_limit > self.config.base_cap {
            drop(session);
            self.broadcaster
                .broadcast(Protocol::SwarmScaling(json!({
                    "sessionId": self.session_id.to_string(),
                    "dynamicLimit": dynamic_limit,
                    "totalEligible": total_eligible,
                })))
                .await;
            session = session_arc.lock().await;
        }

        let mut to_launch = Vec::new();
        let mut enqueued = 0usize;
        let mut gate_requests = Vec::new();
        let mut speculative_starts = Vec::new();

        for task_id in &eligible_ids {
            if running + enqueued >= dynamic_limit {
                break;
            }
            let status = session.task_states.get(task_id).map(|s| s.status);
            if status == Some(TaskStatus::Gated) {
                let task = task_by_id(&session, task_id).cloned();
                if let Some(task) = task {
                    let mut requested = self.gate_requested.lock().await;
                    if requested.insert(task_id.clone()) {
                        gate_requests.push(task);
                    }
                }
                continue;
            }
            let task = match task_by_id(&session, task_id) {
                Some(t) => t.clone(),
                None => continue,
            };
            if let Some(ts) = session.task_states.get_mut(task_id) {
                ts.status = TaskStatus::Running;
                ts.started_at = Some(Utc::now());
            }
            enqueued += 1;
            to_launch.push(task);
        }

        if self.config.speculative_enabled {
            for task in session.plan.clone() {
                if running + enqueued >= dynamic_limit {
                    break;
                }
                if task.task_type == TaskType::Prompt || task.dependencies.is_empty() {
                    continue;
                }
                let status = session.task_states.get(&task.id).map(|s| s.status);
                if status != Some(TaskStatus::Pending) {
                    continue;
                }
                let dep_states: Vec<TaskStatus> = task
                    .dependencies
                    .iter()
                    .filter_map(|d| session.task_states.get(d).map(|s| s.status))
                    .collect();
                if dep_states.contains(&TaskStatus::Blocked) {
                    continue;
                }
                let total_deps = task.dependencies.len();
                let done_deps = dep_states.iter().filter(|s| **s == TaskStatus::Success).count();
                let running_deps = dep_states.iter().filter(|s| **s == TaskStatus::Running).count();
                if total_deps == 0 || done_deps + running_deps != total_deps {
                    continue;
                }
                let frac = done_deps as f64 / total_deps as f64;
                if frac < self.config.speculative_threshold {
                    continue;
                }
                if has_true_data_dependency(&task.description) {
                    continue;
                }
                if let Some(ts) = session.task_states.get_mut(&task.id) {
                    ts.status = TaskStatus::Running;
                    ts.started_at = Some(Utc::now());
                }
                enqueued += 1;
                speculative_starts.push(task.id.clone());
                to_launch.push(task);
            }
        }

        drop(session);

        for task_id in speculative_starts {
            self.broadcaster
                .broadcast(Protocol::SpeculativeStart(json!({
                    "sessionId": self.session_id.to_string(),
                    "taskId": task_id,
                })))
                .await;
        }

        for task in gate_requests {
            self.request_gate(&task, tx.clone()).await;
        }

        to_launch
    }

    async fn request_gate(&self, task: &Task, tx: mpsc::Sender<PassResult>) {
        self.broadcaster
            .broadcast(Protocol::GateRequest(json!({
                "sessionId": self.session_id.to_string(),
                "taskId": task.id,
                "label": task.label,
            })))
            .await;

        let Some(ctx) = self.engine.active_context(self.session_id).await else { return; };
        let rx = ctx.register_gate_waiter(task.id.clone()).await;
        let task_id = task.id.clone();
        tokio::spawn(async move {
            if let Ok(resolution) = rx.await {
                let _ = tx
                    .send(PassResult::GateResolved {
                        task_id,
                        approved: resolution.approved,
                        feedback: resolution.feedback,
                    })
                    .await;
            }
        });
    }

    /// `resolveGate`: the public one-shot approval/rejection entry point.
    pub async fn resolve_gate(&self, task_id: &str, approved: bool, feedback: Option<String>) -> bool {
        let Some(ctx) = self.engine.active_context(self.session_id).await else { return false; };
        ctx.resolve_gate(task_id, GateResolution { approved, feedback }).await
    }

    async fn handle_gate_resolution(&self, task_id: &str, approved: bool, feedback: Option<String>) {
        let Some(session_arc) = self.session_handle().await else { return; };
        let mut session = session_arc.lock().await;
        self.gate_requested.lock().await.remove(task_id);

        if let Some(fb) = &feedback {
            if let Some(task) = session.plan.iter_mut().find(|t| t.id == task_id) {
                task.append_human_feedback(fb);
            }
        }
        let new_status = if approved { TaskStatus::Pending } else { TaskStatus::Blocked };
        if let Some(ts) = session.task_states.get_mut(task_id) {
            ts.status = new_status;
            if !approved {
                ts.completed_at = Some(Utc::now());
            }
        }
        drop(session);
        self.broadcast_task_status(task_id, new_status).await;
    }

    fn spawn_launch(&self, task: Task, tx: mpsc::Sender<PassResult>) {
        let engine = Arc::clone(&self.engine);
        let session_id = self.session_id;
        let agent_manager = Arc::clone(&self.agent_manager);
        let project = self.project.clone();
        let skills_summary = format_skills_summary(&project.skills);

        tokio::spawn(async move {
            let Some(session_arc) = engine.get_session(session_id).await else { return; };
            let (work_dir, retry_index, extra_context, already_spent) = {
                let session = session_arc.lock().await;
                let ts = session.task_states.get(&task.id).cloned().unwrap_or_default();
                let extra_context = ts
                    .failure_reports
                    .iter()
                    .map(|fr| summary_to_context(&fr.summary, None))
                    .collect::<Vec<_>>()
                    .join("\n\n---\n\n");
                let already_spent: f64 = session.agents.values().map(|a| a.multiplier).sum();
                (session.work_dir.clone(), ts.retries, extra_context, already_spent)
            };

            let agent = agent_manager
                .spawn(
                    &task.id,
                    retry_index,
                    &work_dir,
                    &task.label,
                    &task.description,
                    &task.affected_files,
                    &skills_summary,
                    &extra_context,
                    &project,
                    already_spent,
                    session_id,
                )
                .await;

            let _ = tx
                .send(PassResult::Launch(LaunchResult { task_id: task.id.clone(), agent }))
                .await;
        });
    }

    /// Every exit path of a launch (success, failure, timeout, cost
    /// refusal, kill-all interruption) lands here.
    async fn handle_launch_result(&self, lr: LaunchResult, tx: &mpsc::Sender<PassResult>) {
        let Some(session_arc) = self.session_handle().await else { return; };
        let mut session = session_arc.lock().await;

        let agent_id = lr.agent.id;
        let agent_status = lr.agent.status;
        let multiplier = lr.agent.multiplier;
        let tier_key = format!("{:?}", lr.agent.model_tier).to_lowercase();

        session.cost_summary.total += multiplier;
        *session.cost_summary.by_tier.entry(tier_key).or_insert(0.0) += multiplier;
        session.agents.insert(agent_id, lr.agent.clone());
        if let Some(ts) = session.task_states.get_mut(&lr.task_id) {
            ts.agent_ids.push(agent_id);
        }

        drop(session);
        self.broadcaster
            .broadcast(Protocol::AgentStatus(json!({
                "sessionId": self.session_id.to_string(),
                "agentId": agent_id.to_string(),
                "taskId": lr.task_id,
                "status": agent_status,
            })))
            .await;

        match agent_status {
            AgentStatus::Success => {
                let session_arc = match self.session_handle().await {
                    Some(s) => s,
                    None => return,
                };
                let mut session = session_arc.lock().await;
                if let Some(ts) = session.task_states.get_mut(&lr.task_id) {
                    ts.status = TaskStatus::Success;
                    ts.completed_at = Some(Utc::now());
                }
                drop(session);
                self.broadcast_task_status(&lr.task_id, TaskStatus::Success).await;
            }
            AgentStatus::Interrupted => {
                // Session-wide shutdown is in flight; leave the task's
                // status as-is (still `running`) so a resumed session can
                // pick it back up. The cancellation check at the top of
                // `run` takes over from here.
            }
            _ => {
                self.handle_failure(&lr.task_id, &lr.agent, tx).await;
            }
        }
    }

    /// `_handleFailure`: retry, escalate to `blocked`, or try a split.
    async fn handle_failure(&self, task_id: &str, agent: &Agent, _tx: &mpsc::Sender<PassResult>) {
        let raw_output = agent.output.joined();
        let summary = summarize(&raw_output);

        let Some(session_arc) = self.session_handle().await else { return; };
        let mut session = session_arc.lock().await;

        let max_retries_total = self.project.settings.max_retries_total;
        let retries = match session.task_states.get_mut(task_id) {
            Some(ts) => {
                ts.retries += 1;
                ts.retries
            }
            None => return,
        };

        if retries >= max_retries_total {
            if let Some(ts) = session.task_states.get_mut(task_id) {
                ts.status = TaskStatus::Blocked;
                ts.completed_at = Some(Utc::now());
            }
            drop(session);
            self.broadcast_task_status(task_id, TaskStatus::Blocked).await;
            return;
        }

        let category = classify_failure(&summary);
        let suggested_fix = format!(
            "Retry with context from {} error(s) and {} warning(s) surfaced in the previous attempt.",
            summary.errors.len(),
            summary.warnings.len()
        );
        if let Some(ts) = session.task_states.get_mut(task_id) {
            ts.failure_reports.push(FailureReport { summary, suggested_fix, category });
        }

        let already_split = session
            .task_states
            .get(task_id)
            .map(|ts| ts.split_attempted)
            .unwrap_or(true);
        let should_try_split = self.config.task_split_enabled
            && retries == self.config.task_split_after_retries
            && !already_split;

        if should_try_split {
            let task = task_by_id(&session, task_id).cloned();
            let work_dir = session.work_dir.clone();
            drop(session);
            if let Some(task) = task {
                if self.try_split_task(&task, &work_dir).await {
                    return;
                }
            }
            self.requeue_pending(task_id).await;
            return;
        }

        drop(session);
        self.requeue_pending(task_id).await;
    }

    async fn requeue_pending(&self, task_id: &str) {
        let Some(session_arc) = self.session_handle().await else { return; };
        let mut session = session_arc.lock().await;
        if let Some(ts) = session.task_states.get_mut(task_id) {
            ts.status = TaskStatus::Pending;
        }
        drop(session);
        self.broadcast_task_status(task_id, TaskStatus::Pending).await;
    }

    /// `_trySplitTask`: ask the injected planner for a 2-4 task sub-plan,
    /// namespace it under the parent, reroute dependents onto the sub-DAG's
    /// leaves, and mark the parent `success` (delegated). Returns `false`
    /// (falling through to a normal retry) if splitting isn't configured,
    /// the planner errors, or it returns an unusable sub-plan.
    async fn try_split_task(&self, task: &Task, work_dir: &Path) -> bool {
        let Some(split_fn) = &self.split_fn else { return false; };

        let split_prompt = format!(
            "The task \"{}\" has repeatedly failed:\n\n{}\n\nBreak it into 2-4 smaller independent sub-tasks that together accomplish it.",
            task.label, task.description
        );
        let sub_tasks = match split_fn(split_prompt, work_dir.to_path_buf()).await {
            Ok(subs) if (2..=4).contains(&subs.len()) => subs,
            _ => return false,
        };

        let namespaced: Vec<Task> = sub_tasks
            .into_iter()
            .map(|mut sub| {
                let parent_deps = task.dependencies.clone();
                sub.id = format!("{}-split-{}", task.id, sub.id);
                sub.dependencies = if sub.dependencies.is_empty() {
                    parent_deps
                } else {
                    sub.dependencies
                        .iter()
                        .map(|d| format!("{}-split-{}", task.id, d))
                        .collect()
                };
                sub
            })
            .collect();

        let sub_ids: HashSet<&str> = namespaced.iter().map(|t| t.id.as_str()).collect();
        let depended_on: HashSet<&str> = namespaced
            .iter()
            .flat_map(|t| t.dependencies.iter().map(|d| d.as_str()))
            .filter(|d| sub_ids.contains(d))
            .collect();
        let leaves: Vec<String> = namespaced
            .iter()
            .map(|t| t.id.clone())
            .filter(|id| !depended_on.contains(id.as_str()))
            .collect();

        let Some(session_arc) = self.session_handle().await else { return false; };
        let mut session = session_arc.lock().await;

        for other in session.plan.iter_mut() {
            if other.dependencies.iter().any(|d| d == &task.id) {
                other.dependencies.retain(|d| d != &task.id);
                for leaf in &leaves {
                    if !other.dependencies.contains(leaf) {
                        other.dependencies.push(leaf.clone());
                    }
                }
            }
        }

        for sub in &namespaced {
            for dep in &sub.dependencies {
                session.edges.push(Edge {
                    id: format!("{dep}->{}", sub.id),
                    source: dep.clone(),
                    target: sub.id.clone(),
                });
            }
            session.task_states.insert(sub.id.clone(), TaskState::new());
            self.engine.index_task(sub.id.clone(), self.session_id).await;
        }
        session.plan.extend(namespaced.clone());
        session.swarm_stats.task_splits += 1;
        session.swarm_stats.total_tasks = session.plan.len();

        if let Some(ts) = session.task_states.get_mut(&task.id) {
            ts.status = TaskStatus::Success;
            ts.split_attempted = true;
            ts.completed_at = Some(Utc::now());
        }

        drop(session);

        let session_arc2 = match self.session_handle().await {
            Some(s) => s,
            None => return true,
        };
        let (waves, total) = {
            let session = session_arc2.lock().await;
            compute_waves(&session.plan)
        };
        *self.waves.lock().await = waves;
        *self.total_waves.lock().await = total;

        self.broadcaster
            .broadcast(Protocol::TaskSplit(json!({
                "sessionId": self.session_id.to_string(),
                "parentTaskId": task.id,
                "subTaskIds": namespaced.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
            })))
            .await;
        self.broadcaster
            .broadcast(Protocol::PlanCreated(json!({
                "sessionId": self.session_id.to_string(),
                "append": true,
                "splitFrom": task.id,
                "tasks": namespaced,
            })))
            .await;
        self.broadcast_task_status(&task.id, TaskStatus::Success).await;

        true
    }

    /// `_checkForStalls`: for every long-`running` task, drop the edge to
    /// any `pending` dependent whose description does not read as a true
    /// data dependency. The stalled task itself is left running.
    async fn check_for_stalls(&self) {
        let Some(session_arc) = self.session_handle().await else { return; };
        let mut session = session_arc.lock().await;
        let now = Utc::now();
        let threshold = chrono::Duration::milliseconds(self.config.stall_threshold_ms as i64);

        let stalled: Vec<(String, String)> = session
            .task_states
            .iter()
            .filter(|(_, s)| s.status == TaskStatus::Running)
            .filter_map(|(id, s)| s.started_at.map(|started| (id.clone(), started)))
            .filter(|(_, started)| now - *started >= threshold)
            .map(|(id, _)| {
                let label = task_by_id(&session, &id).map(|t| t.label.clone()).unwrap_or_default();
                (id, label)
            })
            .collect();

        if stalled.is_empty() {
            return;
        }

        let mut rewrites = Vec::new();
        for (staller_id, staller_label) in &stalled {
            let dependents: Vec<String> = session
                .plan
                .iter()
                .filter(|t| t.dependencies.contains(staller_id))
                .filter(|t| {
                    session
                        .task_states
                        .get(&t.id)
                        .map(|s| s.status == TaskStatus::Pending)
                        .unwrap_or(false)
                })
                .map(|t| t.id.clone())
                .collect();

            for dep_id in dependents {
                let Some(dep_task) = task_by_id(&session, &dep_id) else { continue; };
                if has_true_data_dependency(&dep_task.description) {
                    continue;
                }
                let dep_label = dep_task.label.clone();

                if let Some(t) = session.plan.iter_mut().find(|t| t.id == dep_id) {
                    t.dependencies.retain(|d| d != staller_id);
                }
                session
                    .edges
                    .retain(|e| !(e.source == *staller_id && e.target == dep_id));

                let record = RewriteRecord {
                    from: staller_id.clone(),
                    to: dep_id.clone(),
                    from_label: staller_label.clone(),
                    to_label: dep_label,
                    reason: "stalled dependency with no detected true data dependency".to_string(),
                    timestamp: now,
                };
                session.swarm_stats.dag_rewrites += 1;
                rewrites.push(record.clone());
                session.rewrites.push(record);
            }
        }

        drop(session);
        for r in rewrites {
            self.broadcaster
                .broadcast(Protocol::DagRewrite(json!({
                    "sessionId": self.session_id.to_string(),
                    "from": r.from,
                    "to": r.to,
                    "fromLabel": r.from_label,
                    "toLabel": r.to_label,
                    "reason": r.reason,
                })))
                .await;
        }
    }

    /// `_checkCompletion`: every non-`prompt` task must be `success` or
    /// `blocked`.
    async fn check_completion(&self) -> bool {
        let Some(session_arc) = self.session_handle().await else { return true; };
        let session = session_arc.lock().await;
        let executable: Vec<TaskStatus> = session
            .plan
            .iter()
            .filter(|t| t.task_type != TaskType::Prompt)
            .filter_map(|t| session.task_states.get(&t.id).map(|s| s.status))
            .collect();
        if executable.is_empty() {
            return true;
        }
        executable
            .iter()
            .all(|s| matches!(s, TaskStatus::Success | TaskStatus::Blocked))
    }

    pub async fn get_swarm_stats(&self) -> SwarmStats {
        match self.session_handle().await {
            Some(session_arc) => session_arc.lock().await.swarm_stats.clone(),
            None => SwarmStats::default(),
        }
    }

    /// Report whether any task was left `blocked`. Per spec §9's duplicate
    /// `SESSION_COMPLETE` suppression note, the runner never broadcasts its
    /// own `SESSION_COMPLETE` -- the session orchestrator driving a
    /// verify-fix loop on top of this runner emits the canonical one once
    /// that loop settles.
    async fn finalize(&self) -> RunOutcome {
        let Some(session_arc) = self.session_handle().await else { return RunOutcome::Partial; };
        let session = session_arc.lock().await;
        let any_blocked = session.task_states.values().any(|s| s.status == TaskStatus::Blocked);

        if any_blocked { RunOutcome::Partial } else { RunOutcome::Completed }
    }

    /// Kill any agents still running for this session (session shutdown
    /// or abandonment).
    pub async fn cleanup(&self) {
        self.agent_manager.kill_all().await;
    }

    async fn broadcast_task_status(&self, task_id: &str, status: TaskStatus) {
        self.broadcaster
            .broadcast(Protocol::TaskStatus(json!({
                "sessionId": self.session_id.to_string(),
                "taskId": task_id,
                "status": status,
            })))
            .await;
    }
}

fn task_by_id<'a>(session: &'a Session, id: &str) -> Option<&'a Task> {
    session.plan.iter().find(|t| t.id == id)
}

/// A dependency is satisfied if its state is `success`, or if the id no
/// longer names a task in the plan (pruned by a DAG rewrite or split).
fn deps_all_success(session: &Session, task: &Task) -> bool {
    task.dependencies.iter().all(|d| {
        session
            .task_states
            .get(d)
            .map(|s| s.status == TaskStatus::Success)
            .unwrap_or(true)
    })
}

fn has_true_data_dependency(description: &str) -> bool {
    let lower = description.to_lowercase();
    TRUE_DEP_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn classify_failure(summary: &haivemind_state::models::OutputSummary) -> String {
    if !summary.errors.is_empty() {
        "error".to_string()
    } else if summary.tests.failed > 0 {
        "test_failure".to_string()
    } else {
        "unknown".to_string()
    }
}

fn format_skills_summary(skills: &ProjectSkills) -> String {
    let mut parts = Vec::new();
    if !skills.build_commands.is_empty() {
        parts.push(format!("Build: {}", skills.build_commands.join(", ")));
    }
    if !skills.test_commands.is_empty() {
        parts.push(format!("Test: {}", skills.test_commands.join(", ")));
    }
    if !skills.lint_commands.is_empty() {
        parts.push(format!("Lint: {}", skills.lint_commands.join(", ")));
    }
    if !skills.patterns.is_empty() {
        parts.push(format!("Conventions: {}", skills.patterns.join("; ")));
    }
    parts.join("\n")
}

/// Wave N = 1 + max(wave of every dependency); wave 0 = no deps. A
/// dependency id outside the plan (pruned) contributes nothing.
fn compute_waves(tasks: &[Task]) -> (HashMap<String, usize>, usize) {
    let tasks_by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut waves: HashMap<String, usize> = HashMap::new();

    for task in tasks {
        let mut visiting = HashSet::new();
        wave_of(&task.id, &tasks_by_id, &mut waves, &mut visiting);
    }

    let total = waves.values().max().map(|m| m + 1).unwrap_or(0);
    (waves, total)
}

fn wave_of(
    id: &str,
    tasks_by_id: &HashMap<&str, &Task>,
    waves: &mut HashMap<String, usize>,
    visiting: &mut HashSet<String>,
) -> usize {
    if let Some(&w) = waves.get(id) {
        return w;
    }
    if !visiting.insert(id.to_string()) {
        // Cycle: contribute nothing so the rest of the graph still gets a
        // wave number. `detect_cyclic_residue` reports these separately.
        return 0;
    }
    let Some(task) = tasks_by_id.get(id) else {
        waves.insert(id.to_string(), 0);
        return 0;
    };
    let w = if task.dependencies.is_empty() {
        0
    } else {
        1 + task
            .dependencies
            .iter()
            .map(|d| wave_of(d, tasks_by_id, waves, visiting))
            .max()
            .unwrap_or(0)
    };
    visiting.remove(id);
    waves.insert(id.to_string(), w);
    w
}

/// Kahn's algorithm drain: any task never dequeued sits in a cycle.
fn detect_cyclic_residue(tasks: &[Task]) -> Vec<String> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut indegree: HashMap<&str, usize> = tasks.iter().map(|t| (t.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for t in tasks {
        for d in &t.dependencies {
            if ids.contains(d.as_str()) {
                *indegree.get_mut(t.id.as_str()).unwrap() += 1;
                dependents.entry(d.as_str()).or_default().push(t.id.as_str());
            }
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut drained: HashSet<&str> = HashSet::new();

    while let Some(id) = queue.pop_front() {
        drained.insert(id);
        if let Some(deps) = dependents.get(id) {
            for &dep in deps {
                if let Some(e) = indegree.get_mut(dep) {
                    *e -= 1;
                    if *e == 0 {
                        queue.push_back(dep);
                    }
                }
            }
        }
    }

    ids.into_iter()
        .filter(|id| !drained.contains(id))
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use haivemind_state::models::{ProjectSettings, ProjectSkills};
    use std::path::PathBuf;

    fn mk_task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, id, format!("do {id}"));
        t.dependencies = deps.iter().map(|s| s.to_string()).collect();
        t
    }

    #[test]
    fn wave_zero_has_no_deps() {
        let tasks = vec![mk_task("a", &[]), mk_task("b", &["a"]), mk_task("c", &["b"])];
        let (waves, total) = compute_waves(&tasks);
        assert_eq!(waves["a"], 0);
        assert_eq!(waves["b"], 1);
        assert_eq!(waves["c"], 2);
        assert_eq!(total, 3);
    }

    #[test]
    fn wave_is_longest_path_not_shortest() {
        // d depends on both a (wave 0) and c (wave 1 via b), so d is wave 2.
        let tasks = vec![
            mk_task("a", &[]),
            mk_task("b", &["a"]),
            mk_task("c", &["b"]),
            mk_task("d", &["a", "c"]),
        ];
        let (waves, _) = compute_waves(&tasks);
        assert_eq!(waves["d"], 3);
    }

    #[test]
    fn cyclic_residue_is_detected() {
        let tasks = vec![mk_task("a", &["b"]), mk_task("b", &["a"]), mk_task("c", &[])];
        let residue = detect_cyclic_residue(&tasks);
        assert_eq!(residue.len(), 2);
        assert!(residue.contains(&"a".to_string()));
        assert!(residue.contains(&"b".to_string()));
    }

    #[test]
    fn true_data_dependency_keyword_detected() {
        assert!(has_true_data_dependency("this task reads from the output file"));
        assert!(has_true_data_dependency("consumes the prior result"));
        assert!(!has_true_data_dependency("just refactor the module"));
    }

    fn test_project() -> Project {
        Project {
            slug: "demo".into(),
            dir: PathBuf::from("/tmp"),
            settings: ProjectSettings {
                max_retries_total: 3,
                max_concurrency: 4,
                ..ProjectSettings::default()
            },
            skills: ProjectSkills::default(),
        }
    }

    fn fake_script(tmp: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = tmp.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    async fn setup(
        tmp: &tempfile::TempDir,
        plan: Vec<Task>,
        script_body: &str,
    ) -> (Arc<Engine>, Uuid, Arc<TaskRunner>) {
        let script = fake_script(tmp, "agent.sh", script_body);
        let backend = Arc::new(crate::agent::backend::ClaudeCodeBackend::with_binary(
            script.to_str().unwrap(),
        ));
        let engine = Arc::new(Engine::new());
        let bus = Broadcaster::new(Arc::clone(&engine));
        let agent_manager = Arc::new(AgentManager::new(backend, bus.clone()));

        let mut session = Session::new(Uuid::new_v4(), "demo", "prompt", tmp.path().to_path_buf());
        session.plan = plan.clone();
        let session_id = session.id;
        engine.insert_session(session).await;
        for task in &plan {
            engine.index_task(task.id.clone(), session_id).await;
        }

        let runner = Arc::new(TaskRunner::new(
            Arc::clone(&engine),
            session_id,
            agent_manager,
            bus,
            test_project(),
            RunnerConfig::default(),
            None,
        ));
        (engine, session_id, runner)
    }

    #[tokio::test]
    async fn two_independent_tasks_both_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = vec![mk_task("a", &[]), mk_task("b", &[])];
        let (engine, session_id, runner) =
            setup(&tmp, plan, r#"echo '{"type":"result","result":"ok"}'"#).await;

        let outcome = runner.run().await;
        assert_eq!(outcome, RunOutcome::Completed);

        let session_arc = engine.get_session(session_id).await.unwrap();
        let session = session_arc.lock().await;
        assert_eq!(session.task_states["a"].status, TaskStatus::Success);
        assert_eq!(session.task_states["b"].status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn dependent_task_waits_for_its_dependency() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = vec![mk_task("a", &[]), mk_task("b", &["a"])];
        let (engine, session_id, runner) =
            setup(&tmp, plan, r#"echo '{"type":"result","result":"ok"}'"#).await;

        let outcome = runner.run().await;
        assert_eq!(outcome, RunOutcome::Completed);

        let session_arc = engine.get_session(session_id).await.unwrap();
        let session = session_arc.lock().await;
        assert_eq!(session.task_states["a"].status, TaskStatus::Success);
        assert_eq!(session.task_states["b"].status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn task_blocks_after_exhausting_retries() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = vec![mk_task("a", &[])];
        let (engine, session_id, runner) = setup(&tmp, plan, "exit 1").await;

        let outcome = runner.run().await;
        assert_eq!(outcome, RunOutcome::Partial);

        let session_arc = engine.get_session(session_id).await.unwrap();
        let session = session_arc.lock().await;
        let ts = &session.task_states["a"];
        assert_eq!(ts.status, TaskStatus::Blocked);
        assert_eq!(ts.retries, 3);
        assert_eq!(ts.failure_reports.len(), 2);
    }

    #[tokio::test]
    async fn prompt_task_auto_completes_without_spawning() {
        let tmp = tempfile::tempdir().unwrap();
        let mut prompt_task = mk_task("bridge", &[]);
        prompt_task.task_type = TaskType::Prompt;
        let plan = vec![prompt_task, mk_task("after", &["bridge"])];
        let (engine, session_id, runner) =
            setup(&tmp, plan, r#"echo '{"type":"result","result":"ok"}'"#).await;

        let outcome = runner.run().await;
        assert_eq!(outcome, RunOutcome::Completed);

        let session_arc = engine.get_session(session_id).await.unwrap();
        let session = session_arc.lock().await;
        assert_eq!(session.task_states["bridge"].status, TaskStatus::Success);
        assert!(session.agents.values().all(|a| a.task_id != "bridge"));
    }

    #[tokio::test]
    async fn gated_task_waits_for_resolve_gate() {
        let tmp = tempfile::tempdir().unwrap();
        let mut gated = mk_task("g", &[]);
        gated.gate = true;
        let plan = vec![gated];
        let (engine, session_id, runner) =
            setup(&tmp, plan, r#"echo '{"type":"result","result":"ok"}'"#).await;

        {
            let session_arc = engine.get_session(session_id).await.unwrap();
            let mut session = session_arc.lock().await;
            let mut ts = TaskState::new();
            ts.status = TaskStatus::Gated;
            session.task_states.insert("g".to_string(), ts);
        }

        let runner_clone = Arc::clone(&runner);
        let run_handle = tokio::spawn(async move { runner_clone.run().await });

        // Give the scheduler a moment to broadcast GATE_REQUEST and register
        // the waiter, then approve it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let resolved = runner.resolve_gate("g", true, Some("looks good".to_string())).await;
        assert!(resolved);

        let outcome = run_handle.await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let session_arc = engine.get_session(session_id).await.unwrap();
        let session = session_arc.lock().await;
        assert_eq!(session.task_states["g"].status, TaskStatus::Success);
        assert!(session.plan[0].description.contains("Human Feedback"));
    }

    #[tokio::test]
    async fn rejected_gate_blocks_the_task() {
        let tmp = tempfile::tempdir().unwrap();
        let mut gated = mk_task("g", &[]);
        gated.gate = true;
        let plan = vec![gated];
        let (engine, session_id, runner) =
            setup(&tmp, plan, r#"echo '{"type":"result","result":"ok"}'"#).await;

        {
            let session_arc = engine.get_session(session_id).await.unwrap();
            let mut session = session_arc.lock().await;
            let mut ts = TaskState::new();
            ts.status = TaskStatus::Gated;
            session.task_states.insert("g".to_string(), ts);
        }

        let runner_clone = Arc::clone(&runner);
        let run_handle = tokio::spawn(async move { runner_clone.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        runner.resolve_gate("g", false, None).await;

        let outcome = run_handle.await.unwrap();
        assert_eq!(outcome, RunOutcome::Partial);

        let session_arc = engine.get_session(session_id).await.unwrap();
        let session = session_arc.lock().await;
        assert_eq!(session.task_states["g"].status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn task_splits_after_configured_retry_count() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = vec![mk_task("parent", &[]), mk_task("downstream", &["parent"])];
        let script = fake_script(&tmp, "fail.sh", "exit 1");
        let backend = Arc::new(crate::agent::backend::ClaudeCodeBackend::with_binary(
            script.to_str().unwrap(),
        ));
        let engine = Arc::new(Engine::new());
        let bus = Broadcaster::new(Arc::clone(&engine));
        let agent_manager = Arc::new(AgentManager::new(backend, bus.clone()));

        let mut session = Session::new(Uuid::new_v4(), "demo", "prompt", tmp.path().to_path_buf());
        session.plan = plan.clone();
        let session_id = session.id;
        engine.insert_session(session).await;
        for task in &plan {
            engine.index_task(task.id.clone(), session_id).await;
        }

        let split_fn: SplitFn = Arc::new(|_prompt, _work_dir| {
            Box::pin(async move {
                Ok(vec![
                    Task::new("sub1", "sub1", "first half"),
                    Task::new("sub2", "sub2", "second half"),
                ])
            })
        });

        let config = RunnerConfig { task_split_after_retries: 1, ..RunnerConfig::default() };
        let runner = TaskRunner::new(
            Arc::clone(&engine),
            session_id,
            agent_manager,
            bus,
            test_project(),
            config,
            Some(split_fn),
        );
        runner.initialize().await;

        // Run just enough passes for the parent to fail once and split.
        // Spin until the split is observed or a generous deadline passes.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            runner.auto_complete_prompt_tasks().await;
            let (_tx, _rx) = mpsc::channel(8);
            let to_launch = runner.schedule_pass(0, &_tx).await;
            for t in to_launch {
                let (tx2, mut rx2) = mpsc::channel(8);
                runner.spawn_launch(t, tx2);
                if let Some(PassResult::Launch(lr)) = rx2.recv().await {
                    runner.handle_launch_result(lr, &_tx).await;
                }
            }
            let session_arc = engine.get_session(session_id).await.unwrap();
            let session = session_arc.lock().await;
            let parent_state = session.task_states.get("parent").cloned();
            drop(session);
            if let Some(ts) = parent_state {
                if ts.split_attempted {
                    assert_eq!(ts.status, TaskStatus::Success);
                    break;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("task split did not happen within deadline");
            }
        }

        let session_arc = engine.get_session(session_id).await.unwrap();
        let session = session_arc.lock().await;
        assert!(session.plan.iter().any(|t| t.id == "parent-split-sub1"));
        assert!(session.plan.iter().any(|t| t.id == "parent-split-sub2"));
        assert!(session
            .plan
            .iter()
            .find(|t| t.id == "downstream")
            .unwrap()
            .dependencies
            .iter()
            .any(|d| d.starts_with("parent-split-")));
    }
}
