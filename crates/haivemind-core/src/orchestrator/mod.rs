//! The Session Orchestrator: plan -> execute -> verify-fix -> finalize, plus
//! chat-driven incremental DAG extension (spec §4.4, the second-hardest
//! subsystem after the Task Runner).
//!
//! Mirrors the teacher's `orchestrator::run_orchestrator` shape: one
//! long-lived driver per session that owns the external collaborators
//! (planner, verifier, workspace analyzer) as injected trait objects and
//! drives a fresh `TaskRunner` through however many passes the plan grows
//! into, finalizing with a reflection and skill extraction once settled.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use haivemind_state::engine::{ActiveContext, EngineError, GateResolution};
use haivemind_state::models::{
    CostSummary, Edge, Project, ProjectSkills, Session, SessionStatus, Snapshot, Task, TaskState,
    TaskStatus, TaskType,
};
use haivemind_state::{Engine, Protocol};

use crate::agent::{AgentBackend, AgentManager};
use crate::broadcast::Broadcaster;
use crate::runner::{RunnerConfig, TaskRunner};
use crate::snapshot;
use crate::summarizer::summarize;

pub mod claude_planner;
pub use claude_planner::{ClaudeCodePlanner, MarkerFileWorkspaceAnalyzer};

/// Context handed to [`Decomposer::decompose`]: the project's accumulated
/// skills plus whatever workspace analysis resolved in time (spec §4.4
/// step 3).
#[derive(Debug, Clone, Default)]
pub struct DecomposeContext {
    pub skills: ProjectSkills,
    pub workspace_analysis: Option<serde_json::Value>,
}

/// Injected planner (the spec's `decompose`). Object-safe so it can be
/// stored as `Arc<dyn Decomposer>`, exactly as the teacher injects
/// `orchestratorFn`/`Harness`/`Isolation` as trait objects.
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, prompt: &str, work_dir: &Path, ctx: DecomposeContext) -> Result<Vec<Task>>;
}

/// Result of one verify-fix round (the spec's `verify` return shape).
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub passed: bool,
    pub issues: Vec<String>,
    pub follow_up_tasks: Vec<Task>,
}

/// Injected verifier (the spec's `verify`).
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, plan: &[Task], work_dir: &Path, skills: &ProjectSkills) -> Result<VerifyReport>;
}

/// Injected workspace analyzer, raced against a timeout at session start
/// (spec §4.4 step 3).
#[async_trait]
pub trait WorkspaceAnalyzer: Send + Sync {
    async fn analyze(&self, work_dir: &Path) -> Result<serde_json::Value>;
}

/// Per-session post-mortem metrics (spec §4.4 step 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub status: String,
    pub duration_ms: i64,
    pub task_count: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub retry_rate: f64,
    pub tier_usage: BTreeMap<String, usize>,
    pub escalated_tasks: usize,
    pub cost_summary: CostSummary,
}

/// Tunables not pinned down by the data model (spec §9 open questions).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Workspace analysis race timeout (spec §4.4 step 3: "3 s timeout").
    pub analysis_timeout_ms: u64,
    pub max_verify_rounds: u32,
    pub checkpoint_interval_ms: u64,
    pub runner_config: RunnerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            analysis_timeout_ms: 3_000,
            max_verify_rounds: 3,
            checkpoint_interval_ms: 30_000,
            runner_config: RunnerConfig::default(),
        }
    }
}

/// Drives one or more sessions through plan -> execute -> verify-fix ->
/// finalize. One instance is shared across every session for a project
/// (or a whole process); the `Engine` it wraps is the source of truth for
/// any particular session's live state.
pub struct SessionOrchestrator {
    engine: Arc<Engine>,
    broadcaster: Broadcaster,
    backend: Arc<dyn AgentBackend>,
    decomposer: Arc<dyn Decomposer>,
    verifier: Arc<dyn Verifier>,
    analyzer: Option<Arc<dyn WorkspaceAnalyzer>>,
    config: OrchestratorConfig,
    /// One `AgentManager` per running session, reused across every phase
    /// (initial run, each verify-fix round, each chat iteration) both for
    /// spec fidelity and so `shutdown::graceful_shutdown` has a registry
    /// of live process trees to kill.
    agent_managers: RwLock<HashMap<Uuid, Arc<AgentManager>>>,
}

impl SessionOrchestrator {
    pub fn new(
        engine: Arc<Engine>,
        broadcaster: Broadcaster,
        backend: Arc<dyn AgentBackend>,
        decomposer: Arc<dyn Decomposer>,
        verifier: Arc<dyn Verifier>,
        analyzer: Option<Arc<dyn WorkspaceAnalyzer>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            engine,
            broadcaster,
            backend,
            decomposer,
            verifier,
            analyzer,
            config,
            agent_managers: RwLock::new(HashMap::new()),
        }
    }

    /// Every `AgentManager` currently tracked for a running session (used
    /// by `shutdown::graceful_shutdown` to kill every live process tree).
    pub async fn agent_managers(&self) -> Vec<Arc<AgentManager>> {
        self.agent_managers.read().await.values().cloned().collect()
    }

    /// `startSession`: steps 1-9 of spec §4.4.
    pub async fn start_session(
        &self,
        project: Project,
        prompt: String,
        predefined_plan: Option<Vec<Task>>,
    ) -> Result<Uuid> {
        let session_id = Uuid::new_v4();
        let work_dir = project.dir.clone();

        if let Err(EngineError::WorkspaceLocked { holder, .. }) =
            self.engine.acquire_workspace_lock(&work_dir, session_id).await
        {
            self.broadcaster
                .broadcast(Protocol::SessionError(json!({
                    "sessionId": session_id.to_string(),
                    "projectSlug": project.slug,
                    "message": format!("workspace {} already locked by session {holder}", work_dir.display()),
                })))
                .await;
            bail!("workspace {} already locked by session {holder}", work_dir.display());
        }

        let mut session = Session::new(session_id, project.slug.clone(), prompt.clone(), work_dir.clone());
        session.snapshot = snapshot::take_snapshot(&work_dir, session_id).unwrap_or(Snapshot::None);
        session.status = SessionStatus::Running;
        self.engine.insert_session(session).await;
        self.broadcaster
            .broadcast(Protocol::SessionStart(json!({
                "sessionId": session_id.to_string(),
                "projectSlug": project.slug,
                "prompt": prompt,
            })))
            .await;

        if let Err(err) = self.run_session_body(session_id, &project, prompt, predefined_plan).await {
            warn!(%session_id, %err, "session failed");
            self.fail_session(session_id, &project, &err.to_string()).await;
        }

        self.engine.release_workspace_lock(&work_dir, session_id).await;
        Ok(session_id)
    }

    async fn run_session_body(
        &self,
        session_id: Uuid,
        project: &Project,
        prompt: String,
        predefined_plan: Option<Vec<Task>>,
    ) -> Result<()> {
        let work_dir = project.dir.clone();

        let workspace_analysis = self.run_workspace_analysis(session_id, work_dir.clone()).await;
        if let Some(analysis) = &workspace_analysis {
            if let Some(session_arc) = self.engine.get_session(session_id).await {
                session_arc.lock().await.workspace_analysis = Some(analysis.clone());
            }
        }

        let tasks = match predefined_plan {
            Some(tasks) => tasks,
            None => {
                let ctx = DecomposeContext { skills: project.skills.clone(), workspace_analysis };
                self.decomposer.decompose(&prompt, &work_dir, ctx).await.context("decompose failed")?
            }
        };
        self.install_plan(session_id, tasks, false).await;

        let agent_manager = Arc::new(AgentManager::new(Arc::clone(&self.backend), self.broadcaster.clone()));
        self.agent_managers.write().await.insert(session_id, Arc::clone(&agent_manager));

        self.run_plan_to_completion(session_id, project, Arc::clone(&agent_manager)).await;

        let report = self.verify_fix_loop(session_id, project, Arc::clone(&agent_manager)).await?;

        let any_blocked = {
            let session_arc = self.engine.get_session(session_id).await.context("session missing")?;
            let session = session_arc.lock().await;
            session.task_states.values().any(|s| s.status == TaskStatus::Blocked)
        };
        let status = if report.passed && !any_blocked { "completed" } else { "partial" };
        self.finalize_session(session_id, project, status).await;
        Ok(())
    }

    /// Fire workspace analysis concurrently with the caller's subsequent
    /// work, racing it against `analysis_timeout_ms` (spec §4.4 step 3).
    /// On timeout, a detached task keeps waiting and attaches the result
    /// to the session's metadata post-hoc once it resolves.
    async fn run_workspace_analysis(&self, session_id: Uuid, work_dir: PathBuf) -> Option<serde_json::Value> {
        let analyzer = self.analyzer.clone()?;
        let (tx, mut rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = analyzer.analyze(&work_dir).await.ok();
            let _ = tx.send(result);
        });

        let timeout = Duration::from_millis(self.config.analysis_timeout_ms);
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(analysis)) => analysis,
            _ => {
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move {
                    if let Ok(Some(analysis)) = rx.await {
                        if let Some(session_arc) = engine.get_session(session_id).await {
                            session_arc.lock().await.workspace_analysis = Some(analysis);
                        }
                    }
                });
                None
            }
        }
    }

    /// Build edges for `tasks`, index them into the task->session map,
    /// append them to the plan, and broadcast `PLAN_CREATED`.
    async fn install_plan(&self, session_id: Uuid, tasks: Vec<Task>, append: bool) {
        let Some(session_arc) = self.engine.get_session(session_id).await else { return; };
        {
            let mut session = session_arc.lock().await;
            for task in &tasks {
                for dep in &task.dependencies {
                    session.edges.push(Edge {
                        id: format!("{dep}->{}", task.id),
                        source: dep.clone(),
                        target: task.id.clone(),
                    });
                }
                session.task_states.entry(task.id.clone()).or_insert_with(TaskState::new);
            }
            session.plan.extend(tasks.clone());
            session.swarm_stats.total_tasks = session.plan.len();
        }
        for task in &tasks {
            self.engine.index_task(task.id.clone(), session_id).await;
        }
        self.broadcaster
            .broadcast(Protocol::PlanCreated(json!({
                "sessionId": session_id.to_string(),
                "append": append,
                "tasks": tasks,
            })))
            .await;
    }

    async fn run_plan_to_completion(&self, session_id: Uuid, project: &Project, agent_manager: Arc<AgentManager>) {
        let runner = TaskRunner::new(
            Arc::clone(&self.engine),
            session_id,
            agent_manager,
            self.broadcaster.clone(),
            project.clone(),
            self.config.runner_config.clone(),
            None,
        );
        runner.run().await;
    }

    /// Up to `max_verify_rounds` rounds of verify -> namespace follow-ups
    /// -> append -> run -> re-verify (spec §4.4 step 6).
    async fn verify_fix_loop(
        &self,
        session_id: Uuid,
        project: &Project,
        agent_manager: Arc<AgentManager>,
    ) -> Result<VerifyReport> {
        let mut round = 0u32;
        loop {
            let (plan, work_dir) = {
                let session_arc = self.engine.get_session(session_id).await.context("session missing")?;
                let session = session_arc.lock().await;
                (session.plan.clone(), session.work_dir.clone())
            };

            let report = self.verifier.verify(&plan, &work_dir, &project.skills).await.context("verify failed")?;
            self.broadcaster
                .broadcast(Protocol::VerificationStatus(json!({
                    "sessionId": session_id.to_string(),
                    "round": round,
                    "passed": report.passed,
                    "issues": report.issues,
                })))
                .await;

            if report.passed || report.follow_up_tasks.is_empty() || round >= self.config.max_verify_rounds {
                return Ok(report);
            }
            round += 1;

            let namespaced = namespace_follow_ups(round, report.follow_up_tasks.clone(), &plan);
            self.install_plan(session_id, namespaced, true).await;
            self.run_plan_to_completion(session_id, project, Arc::clone(&agent_manager)).await;
        }
    }

    /// `handleChatMessage`: reject if an iteration is already in flight,
    /// otherwise extend the plan with a namespaced sub-DAG bridged by a
    /// synthetic prompt node, run it, and re-verify (spec §4.4).
    pub async fn handle_chat_message(&self, session_id: Uuid, project: &Project, message: String) -> Result<()> {
        let ctx = self.engine.active_context(session_id).await.context("unknown session")?;
        if !ctx.try_begin_chat_iteration() {
            bail!("a chat iteration is already in flight for this session");
        }
        let result = self.run_chat_iteration(session_id, project, message, &ctx).await;
        ctx.end_chat_iteration();
        result
    }

    async fn run_chat_iteration(
        &self,
        session_id: Uuid,
        project: &Project,
        message: String,
        ctx: &ActiveContext,
    ) -> Result<()> {
        let n = ctx.next_iteration();
        self.broadcaster
            .broadcast(Protocol::IterationStart(json!({
                "sessionId": session_id.to_string(),
                "iteration": n,
                "message": message,
            })))
            .await;

        let (plan, work_dir, workspace_analysis) = {
            let session_arc = self.engine.get_session(session_id).await.context("session missing")?;
            let session = session_arc.lock().await;
            (session.plan.clone(), session.work_dir.clone(), session.workspace_analysis.clone())
        };
        let leaves = compute_leaves(&plan);

        let iteration_prompt = format!("{message}\n\n(continuing iteration {n} of an in-progress session)");
        let ctx_for_decompose = DecomposeContext { skills: project.skills.clone(), workspace_analysis };
        let new_tasks = self
            .decomposer
            .decompose(&iteration_prompt, &work_dir, ctx_for_decompose)
            .await
            .context("decompose failed")?;

        let prompt_node_id = format!("__prompt_{n}__");
        let namespaced = namespace_iteration_tasks(n, new_tasks, &prompt_node_id);

        let mut prompt_task = Task::new(prompt_node_id.clone(), "chat iteration bridge", message.clone());
        prompt_task.task_type = TaskType::Prompt;
        prompt_task.dependencies = leaves;

        let mut batch = Vec::with_capacity(namespaced.len() + 1);
        batch.push(prompt_task);
        batch.extend(namespaced);
        self.install_plan(session_id, batch, true).await;

        let agent_manager = self
            .agent_managers
            .read()
            .await
            .get(&session_id)
            .cloned()
            .context("no agent manager for session")?;
        self.run_plan_to_completion(session_id, project, Arc::clone(&agent_manager)).await;

        let report = self.verify_fix_loop(session_id, project, agent_manager).await?;
        self.broadcaster
            .broadcast(Protocol::IterationComplete(json!({
                "sessionId": session_id.to_string(),
                "iteration": n,
                "passed": report.passed,
            })))
            .await;

        Ok(())
    }

    /// `resolveGate`: delegated straight to the session's `ActiveContext`
    /// (the same registry the `TaskRunner`'s own `resolve_gate` uses), so
    /// it works regardless of which phase (initial run, verify-fix round,
    /// chat iteration) currently owns the live `TaskRunner`.
    pub async fn resolve_gate(&self, session_id: Uuid, task_id: &str, approved: bool, feedback: Option<String>) -> bool {
        let Some(ctx) = self.engine.active_context(session_id).await else { return false; };
        ctx.resolve_gate(task_id, GateResolution { approved, feedback }).await
    }

    async fn fail_session(&self, session_id: Uuid, project: &Project, message: &str) {
        self.broadcaster
            .broadcast(Protocol::SessionError(json!({
                "sessionId": session_id.to_string(),
                "projectSlug": project.slug,
                "message": message,
            })))
            .await;
        self.finalize_session(session_id, project, "failed").await;
    }

    /// `finalize`: persist, broadcast `SESSION_COMPLETE`, delete the
    /// checkpoint, synthesize and persist the reflection, extract and
    /// persist skills (spec §4.4 steps 7-8).
    async fn finalize_session(&self, session_id: Uuid, project: &Project, status: &str) {
        let Some(session_arc) = self.engine.get_session(session_id).await else { return; };
        let session_snapshot = {
            let mut session = session_arc.lock().await;
            session.status = if status == "failed" { SessionStatus::Failed } else { SessionStatus::Completed };
            session.completed_at = Some(Utc::now());
            session.clone()
        };

        self.broadcaster
            .broadcast(Protocol::SessionComplete(json!({
                "sessionId": session_id.to_string(),
                "status": status,
                "costSummary": session_snapshot.cost_summary,
                "rewrites": session_snapshot.rewrites,
                "swarmStats": session_snapshot.swarm_stats,
            })))
            .await;

        if let Err(err) = persist_session(project, &session_snapshot) {
            warn!(%session_id, %err, "failed to persist session");
        }

        let reflection = synthesize_reflection(&session_snapshot, status);
        if let Err(err) = persist_reflection(project, session_id, &reflection) {
            warn!(%session_id, %err, "failed to persist reflection");
        }

        let extracted = extract_skills(&session_snapshot);
        if let Err(err) = persist_skills(project, &extracted) {
            warn!(%session_id, %err, "failed to persist skills");
        }

        if let Err(err) = snapshot::delete_checkpoint(&project.dir, session_id) {
            warn!(%session_id, %err, "failed to delete checkpoint");
        }

        self.agent_managers.write().await.remove(&session_id);
        info!(%session_id, status, "session finalized");
    }
}

/// Ids not depended on by any task in `plan` -- the plan's current leaves.
fn compute_leaves(plan: &[Task]) -> Vec<String> {
    let depended_on: HashSet<&str> =
        plan.iter().flat_map(|t| t.dependencies.iter().map(|d| d.as_str())).collect();
    plan.iter().map(|t| t.id.clone()).filter(|id| !depended_on.contains(id.as_str())).collect()
}

/// Namespace a verify-fix round's follow-up tasks as `fix-<round>-<id>`,
/// remap intra-batch dependencies, mark them `Verify`, and make any task
/// whose remapped dependencies don't reference another follow-up in this
/// batch (i.e. a root of the fix sub-DAG) depend on the plan's current
/// leaves (spec §4.4 step 6).
fn namespace_follow_ups(round: u32, follow_ups: Vec<Task>, plan: &[Task]) -> Vec<Task> {
    let leaves = compute_leaves(plan);
    let prefix = format!("fix-{round}-");
    let id_map: HashMap<String, String> =
        follow_ups.iter().map(|t| (t.id.clone(), format!("{prefix}{}", t.id))).collect();
    let ns_ids: HashSet<&str> = id_map.values().map(|s| s.as_str()).collect();

    follow_ups
        .into_iter()
        .map(|mut t| {
            let new_id = id_map[&t.id].clone();
            let mut new_deps: Vec<String> =
                t.dependencies.iter().map(|d| id_map.get(d).cloned().unwrap_or_else(|| d.clone())).collect();
            let is_root = !new_deps.iter().any(|d| ns_ids.contains(d.as_str()));
            if is_root {
                for leaf in &leaves {
                    if !new_deps.contains(leaf) {
                        new_deps.push(leaf.clone());
                    }
                }
            }
            t.id = new_id;
            t.dependencies = new_deps;
            t.task_type = TaskType::Verify;
            t
        })
        .collect()
}

/// Namespace a chat iteration's new tasks as `iter-<n>-<id>`, remap
/// intra-batch dependencies, and make any root depend on the synthetic
/// prompt bridge node (spec §4.4 `handleChatMessage`).
fn namespace_iteration_tasks(n: u32, new_tasks: Vec<Task>, prompt_node_id: &str) -> Vec<Task> {
    let prefix = format!("iter-{n}-");
    let id_map: HashMap<String, String> =
        new_tasks.iter().map(|t| (t.id.clone(), format!("{prefix}{}", t.id))).collect();
    let ns_ids: HashSet<&str> = id_map.values().map(|s| s.as_str()).collect();

    new_tasks
        .into_iter()
        .map(|mut t| {
            let new_id = id_map[&t.id].clone();
            let mut new_deps: Vec<String> =
                t.dependencies.iter().map(|d| id_map.get(d).cloned().unwrap_or_else(|| d.clone())).collect();
            let is_root = !new_deps.iter().any(|d| ns_ids.contains(d.as_str()));
            if is_root {
                new_deps.push(prompt_node_id.to_string());
            }
            t.id = new_id;
            t.dependencies = new_deps;
            t
        })
        .collect()
}

/// Derive a [`Reflection`] from a finalized session (spec §4.4 step 8).
fn synthesize_reflection(session: &Session, status: &str) -> Reflection {
    let duration_ms = (Utc::now() - session.started_at).num_milliseconds().max(0);
    let task_count = session.task_states.len();
    let success_count = session.task_states.values().filter(|s| s.status == TaskStatus::Success).count();
    let fail_count = session.task_states.values().filter(|s| s.status == TaskStatus::Blocked).count();
    let total_retries: u32 = session.task_states.values().map(|s| s.retries).sum();
    let retry_rate = if task_count > 0 { total_retries as f64 / task_count as f64 } else { 0.0 };

    let mut tier_usage: BTreeMap<String, usize> = BTreeMap::new();
    for agent in session.agents.values() {
        *tier_usage.entry(format!("{:?}", agent.model_tier).to_lowercase()).or_insert(0) += 1;
    }
    let escalated_tasks = session.task_states.values().filter(|s| s.retries > 0).count();

    Reflection {
        status: status.to_string(),
        duration_ms,
        task_count,
        success_count,
        fail_count,
        retry_rate,
        tier_usage,
        escalated_tasks,
        cost_summary: session.cost_summary.clone(),
    }
}

/// Extract build/test/lint commands from every agent's raw output by
/// keyword substring match (spec §4.4 step 8 "extract skills").
fn extract_skills(session: &Session) -> ProjectSkills {
    let mut skills = ProjectSkills::default();
    for agent in session.agents.values() {
        let summary = summarize(&agent.output.joined());
        for cmd in &summary.commands {
            let lower = cmd.to_lowercase();
            let bucket = if lower.contains("test") {
                &mut skills.test_commands
            } else if lower.contains("lint") || lower.contains("clippy") || lower.contains("eslint") {
                &mut skills.lint_commands
            } else if lower.contains("build") || lower.contains("compile") {
                &mut skills.build_commands
            } else {
                continue;
            };
            if !bucket.contains(cmd) {
                bucket.push(cmd.clone());
            }
        }
    }
    skills
}

fn persist_session(project: &Project, session: &Session) -> Result<()> {
    let path = project.dir.join(".haivemind").join("sessions").join(format!("{}.json", session.id));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, session)?;
    Ok(())
}

fn persist_reflection(project: &Project, session_id: Uuid, reflection: &Reflection) -> Result<()> {
    let path = project.dir.join(".haivemind").join("reflections").join(format!("{session_id}.json"));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, reflection)?;
    Ok(())
}

/// Read-merge-write the project's skills file (set-union per
/// `ProjectSkills::merge`).
fn persist_skills(project: &Project, extracted: &ProjectSkills) -> Result<()> {
    let path = project.dir.join(".haivemind").join("skills.json");
    let mut merged = std::fs::read_to_string(&path)
        .ok()
        .and_then(|contents| serde_json::from_str::<ProjectSkills>(&contents).ok())
        .unwrap_or_default();
    merged.merge(extracted);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, &merged)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use haivemind_state::models::ProjectSettings;
    use std::sync::Mutex as StdMutex;

    fn mk_task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, id, format!("do {id}"));
        t.dependencies = deps.iter().map(|s| s.to_string()).collect();
        t
    }

    #[test]
    fn leaves_are_tasks_nobody_depends_on() {
        let plan = vec![mk_task("a", &[]), mk_task("b", &["a"]), mk_task("c", &["a"])];
        let mut leaves = compute_leaves(&plan);
        leaves.sort();
        assert_eq!(leaves, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn follow_up_roots_depend_on_current_leaves() {
        let plan = vec![mk_task("a", &[]), mk_task("b", &["a"])];
        let follow_ups = vec![mk_task("retest", &[]), mk_task("cleanup", &["retest"])];
        let namespaced = namespace_follow_ups(1, follow_ups, &plan);

        let retest = namespaced.iter().find(|t| t.id == "fix-1-retest").unwrap();
        assert!(retest.dependencies.contains(&"b".to_string()));
        assert_eq!(retest.task_type, TaskType::Verify);

        let cleanup = namespaced.iter().find(|t| t.id == "fix-1-cleanup").unwrap();
        assert_eq!(cleanup.dependencies, vec!["fix-1-retest".to_string()]);
    }

    #[test]
    fn iteration_roots_depend_on_prompt_node() {
        let new_tasks = vec![mk_task("build-ui", &[]), mk_task("wire-up", &["build-ui"])];
        let namespaced = namespace_iteration_tasks(2, new_tasks, "__prompt_2__");

        let root = namespaced.iter().find(|t| t.id == "iter-2-build-ui").unwrap();
        assert!(root.dependencies.contains(&"__prompt_2__".to_string()));

        let dependent = namespaced.iter().find(|t| t.id == "iter-2-wire-up").unwrap();
        assert_eq!(dependent.dependencies, vec!["iter-2-build-ui".to_string()]);
    }

    #[test]
    fn reflection_counts_success_and_blocked_tasks() {
        let mut session = Session::new(Uuid::new_v4(), "proj", "prompt", PathBuf::from("/tmp"));
        let mut success_state = TaskState::new();
        success_state.status = TaskStatus::Success;
        session.task_states.insert("a".to_string(), success_state);
        let mut blocked_state = TaskState::new();
        blocked_state.status = TaskStatus::Blocked;
        blocked_state.retries = 2;
        session.task_states.insert("b".to_string(), blocked_state);

        let reflection = synthesize_reflection(&session, "partial");
        assert_eq!(reflection.task_count, 2);
        assert_eq!(reflection.success_count, 1);
        assert_eq!(reflection.fail_count, 1);
        assert_eq!(reflection.escalated_tasks, 1);
        assert_eq!(reflection.status, "partial");
    }

    struct StaticDecomposer {
        tasks: Vec<Task>,
    }

    #[async_trait]
    impl Decomposer for StaticDecomposer {
        async fn decompose(&self, _prompt: &str, _work_dir: &Path, _ctx: DecomposeContext) -> Result<Vec<Task>> {
            Ok(self.tasks.clone())
        }
    }

    struct PassingVerifier;

    #[async_trait]
    impl Verifier for PassingVerifier {
        async fn verify(&self, _plan: &[Task], _work_dir: &Path, _skills: &ProjectSkills) -> Result<VerifyReport> {
            Ok(VerifyReport { passed: true, issues: vec![], follow_up_tasks: vec![] })
        }
    }

    struct FixOnceVerifier {
        already_added: StdMutex<bool>,
    }

    #[async_trait]
    impl Verifier for FixOnceVerifier {
        async fn verify(&self, _plan: &[Task], _work_dir: &Path, _skills: &ProjectSkills) -> Result<VerifyReport> {
            let mut guard = self.already_added.lock().unwrap();
            if *guard {
                Ok(VerifyReport { passed: true, issues: vec![], follow_up_tasks: vec![] })
            } else {
                *guard = true;
                Ok(VerifyReport {
                    passed: false,
                    issues: vec!["lint warning".to_string()],
                    follow_up_tasks: vec![mk_task("address-lint", &[])],
                })
            }
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

    fn test_project(dir: PathBuf) -> Project {
        Project {
            slug: "demo".into(),
            dir,
            settings: ProjectSettings { max_retries_total: 2, ..ProjectSettings::default() },
            skills: ProjectSkills::default(),
        }
    }

    #[tokio::test]
    async fn start_session_runs_plan_and_persists_reflection() {
        let tmp = tempfile::tempdir().unwrap();
        let script = fake_script(&tmp, "ok.sh", r#"echo '{"type":"result","result":"done"}'"#);
        let backend = Arc::new(crate::agent::backend::ClaudeCodeBackend::with_binary(script.to_str().unwrap()));
        let engine = Arc::new(Engine::new());
        let bus = Broadcaster::new(Arc::clone(&engine));

        let decomposer = Arc::new(StaticDecomposer { tasks: vec![mk_task("a", &[]), mk_task("b", &["a"])] });
        let verifier = Arc::new(PassingVerifier);
        let orchestrator = SessionOrchestrator::new(
            Arc::clone(&engine),
            bus,
            backend,
            decomposer,
            verifier,
            None,
            OrchestratorConfig::default(),
        );

        let project = test_project(tmp.path().to_path_buf());
        let session_id = orchestrator.start_session(project.clone(), "build it".to_string(), None).await.unwrap();

        let session_arc = engine.get_session(session_id).await.unwrap();
        let session = session_arc.lock().await;
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.task_states["a"].status, TaskStatus::Success);
        assert_eq!(session.task_states["b"].status, TaskStatus::Success);
        drop(session);

        let reflection_path = project
            .dir
            .join(".haivemind")
            .join("reflections")
            .join(format!("{session_id}.json"));
        assert!(reflection_path.exists());
    }

    #[tokio::test]
    async fn verify_fix_loop_appends_and_runs_follow_up_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let script = fake_script(&tmp, "ok.sh", r#"echo '{"type":"result","result":"done"}'"#);
        let backend = Arc::new(crate::agent::backend::ClaudeCodeBackend::with_binary(script.to_str().unwrap()));
        let engine = Arc::new(Engine::new());
        let bus = Broadcaster::new(Arc::clone(&engine));

        let decomposer = Arc::new(StaticDecomposer { tasks: vec![mk_task("a", &[])] });
        let verifier = Arc::new(FixOnceVerifier { already_added: StdMutex::new(false) });
        let orchestrator = SessionOrchestrator::new(
            Arc::clone(&engine),
            bus,
            backend,
            decomposer,
            verifier,
            None,
            OrchestratorConfig::default(),
        );

        let project = test_project(tmp.path().to_path_buf());
        let session_id = orchestrator.start_session(project, "build it".to_string(), None).await.unwrap();

        let session_arc = engine.get_session(session_id).await.unwrap();
        let session = session_arc.lock().await;
        assert!(session.plan.iter().any(|t| t.id == "fix-1-address-lint"));
        assert_eq!(session.task_states["fix-1-address-lint"].status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn second_session_on_same_workspace_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let script = fake_script(&tmp, "hang.sh", "sleep 5");
        let backend = Arc::new(crate::agent::backend::ClaudeCodeBackend::with_binary(script.to_str().unwrap()));
        let engine = Arc::new(Engine::new());

        let holder = Uuid::new_v4();
        let project = test_project(tmp.path().to_path_buf());
        engine.acquire_workspace_lock(&project.dir, holder).await.unwrap();

        let bus = Broadcaster::new(Arc::clone(&engine));
        let decomposer = Arc::new(StaticDecomposer { tasks: vec![mk_task("a", &[])] });
        let verifier = Arc::new(PassingVerifier);
        let orchestrator =
            SessionOrchestrator::new(engine, bus, backend, decomposer, verifier, None, OrchestratorConfig::default());

        let result = orchestrator.start_session(project, "build it".to_string(), None).await;
        assert!(result.is_err());
    }
}
