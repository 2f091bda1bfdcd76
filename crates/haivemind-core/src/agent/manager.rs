//! The Agent Manager: spawns one subprocess per agent attempt, wires its
//! output into a bounded ring buffer, and broadcasts output/status over
//! the observer plane. Spec §4.2.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use haivemind_state::models::{Agent, AgentStatus, ModelTier, OutputBuffer, Project};
use haivemind_state::Protocol;

use crate::agent::backend::{AgentBackend, SpawnRequest};
use crate::broadcast::Broadcaster;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("spawning the agent backend failed: {0}")]
    SpawnFailed(String),
    #[error("agent {agent_id} timed out after {elapsed_ms}ms")]
    TimedOut { agent_id: Uuid, elapsed_ms: u64 },
    #[error("spawning this agent would exceed the session cost ceiling ({projected} > {ceiling})")]
    CostCeilingExceeded { projected: f64, ceiling: f64 },
}

/// Maximum bytes retained per agent's output ring buffer (spec §3 Agent).
pub const MAX_AGENT_OUTPUT_BYTES: usize = 256 * 1024;
/// Timeout after which a running agent is killed (spec §4.2 `agentTimeoutMs`).
pub const AGENT_TIMEOUT_MS: u64 = 15 * 60 * 1000;
/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Forced-kill escalation window used by `killAll`.
const KILL_ALL_GRACE: Duration = Duration::from_secs(3);
/// Cost-ceiling warning threshold.
const COST_WARNING_FRACTION: f64 = 0.8;

/// Spawns and supervises agent subprocesses for one session.
pub struct AgentManager {
    backend: Arc<dyn AgentBackend>,
    broadcaster: Broadcaster,
    /// pid of every currently-running agent process, keyed by agent id, so
    /// `kill_all` can reach agents launched from other tasks.
    processes: Mutex<HashMap<Uuid, i32>>,
    shutting_down: AtomicBool,
}

impl AgentManager {
    pub fn new(backend: Arc<dyn AgentBackend>, broadcaster: Broadcaster) -> Self {
        Self {
            backend,
            broadcaster,
            processes: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Build the prompt body from task/project context (spec §4.2).
    fn build_prompt(
        task_label: &str,
        task_description: &str,
        affected_files: &[String],
        skills_summary: &str,
        extra_context: &str,
    ) -> String {
        let mut prompt = format!("Task: {task_label}\n\n{task_description}\n");
        if !affected_files.is_empty() {
            prompt.push_str(&format!("\nAffected files:\n{}\n", affected_files.join("\n")));
        }
        if !skills_summary.is_empty() {
            prompt.push_str(&format!("\nProject conventions:\n{skills_summary}\n"));
        }
        if !extra_context.is_empty() {
            prompt.push_str(&format!("\nContext from prior attempts:\n{extra_context}\n"));
        }
        prompt
    }

    /// Spawn an agent for `task_id` at `retry_index`, returning the
    /// resulting [`Agent`] record once it has settled (success, failed,
    /// blocked, or interrupted).
    ///
    /// `already_spent` is the sum of multipliers already spent by the
    /// owning session, read by the caller before this call so that `spawn`
    /// does not need to hold the session lock for its whole (potentially
    /// many-minute) duration -- callers run several of these concurrently.
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        &self,
        task_id: &str,
        retry_index: u32,
        work_dir: &Path,
        task_label: &str,
        task_description: &str,
        affected_files: &[String],
        skills_summary: &str,
        extra_context: &str,
        project: &Project,
        already_spent: f64,
        session_id: Uuid,
    ) -> Agent {
        let tier = project.resolve_model_tier(retry_index);
        let model = project
            .pinned_model_for_label(task_label)
            .map(|m| m.to_string())
            .unwrap_or_else(|| default_model_name(tier));
        let multiplier = tier.multiplier();

        let projected = already_spent + multiplier;
        let ceiling = project.settings.cost_ceiling;

        if projected > ceiling {
            return self.blocked_agent(
                task_id,
                tier,
                model,
                multiplier,
                format!("cost ceiling exceeded: projected {projected:.2} > ceiling {ceiling:.2}"),
            );
        }
        if ceiling.is_finite() && projected >= ceiling * COST_WARNING_FRACTION {
            self.broadcaster
                .broadcast(Protocol::SessionWarning(serde_json::json!({
                    "sessionId": session_id.to_string(),
                    "message": format!(
                        "cost at {:.0}% of ceiling ({:.2}/{:.2})",
                        projected / ceiling * 100.0,
                        projected,
                        ceiling
                    ),
                })))
                .await;
        }

        let prompt = Self::build_prompt(task_label, task_description, affected_files, skills_summary, extra_context);

        let agent_id = Uuid::new_v4();
        let request = SpawnRequest {
            prompt: prompt.clone(),
            working_dir: work_dir.to_path_buf(),
            env_vars: vec![],
            model: model.clone(),
        };

        let mut agent = Agent {
            id: agent_id,
            task_id: task_id.to_string(),
            model_tier: tier,
            model: model.clone(),
            multiplier,
            status: AgentStatus::Running,
            retries: retry_index,
            reason: None,
            prompt,
            cli_command: String::new(),
            output: OutputBuffer::new(MAX_AGENT_OUTPUT_BYTES),
            summary: None,
            started_at: Some(chrono::Utc::now()),
            finished_at: None,
        };

        match self.backend.spawn(&request).await {
            Ok(spawned) => {
                agent.cli_command = spawned.cli_command;
                self.attach_process(&mut agent, spawned.child, session_id).await;
            }
            Err(err) => {
                agent.status = AgentStatus::Failed;
                agent.reason = Some(err.to_string());
                agent.output.push(format!("spawn failed: {err}"));
                agent.finished_at = Some(chrono::Utc::now());
            }
        }

        agent
    }

    fn blocked_agent(&self, task_id: &str, tier: ModelTier, model: String, multiplier: f64, reason: String) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            model_tier: tier,
            model,
            multiplier,
            status: AgentStatus::Blocked,
            retries: 0,
            reason: Some(reason),
            prompt: String::new(),
            cli_command: String::new(),
            output: OutputBuffer::new(MAX_AGENT_OUTPUT_BYTES),
            summary: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Wire a spawned child's stdout into `agent`'s ring buffer, broadcast
    /// `AGENT_OUTPUT` per chunk, and enforce the timeout/kill escalation.
    /// Blocks until the process settles (exits or is killed by timeout).
    async fn attach_process(&self, agent: &mut Agent, mut child: tokio::process::Child, session_id: Uuid) {
        let stdout = child.stdout.take();
        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        self.processes.lock().await.insert(agent.id, pid);

        let read_task = tokio::spawn(async move {
            let mut lines = Vec::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if !line.trim().is_empty() {
                        lines.push(line);
                    }
                }
            }
            lines
        });

        let deadline = Instant::now() + Duration::from_millis(AGENT_TIMEOUT_MS);
        let wait_result = tokio::time::timeout_at(deadline, child.wait()).await;

        let lines = read_task.await.unwrap_or_default();
        for line in &lines {
            for event in self.backend.parse_line(line) {
                let text = match &event {
                    crate::agent::backend::AgentEvent::Message { content, .. } => content.clone(),
                    crate::agent::backend::AgentEvent::ToolCall { tool, .. } => format!("[tool:{tool}]"),
                    crate::agent::backend::AgentEvent::ToolResult { tool, .. } => format!("[result:{tool}]"),
                    crate::agent::backend::AgentEvent::Error { message } => format!("[error] {message}"),
                    crate::agent::backend::AgentEvent::Completed => continue,
                };
                agent.output.push(text.clone());
                self.broadcaster
                    .broadcast(Protocol::AgentOutput(serde_json::json!({
                        "sessionId": session_id.to_string(),
                        "agentId": agent.id.to_string(),
                        "taskId": agent.task_id,
                        "chunk": text,
                    })))
                    .await;
            }
        }
        self.broadcaster
            .broadcast(Protocol::AgentStream(serde_json::json!({
                "sessionId": session_id.to_string(),
                "agentId": agent.id.to_string(),
                "taskId": agent.task_id,
                "tail": agent.output.tail(4096),
            })))
            .await;

        match wait_result {
            Ok(Ok(status)) => {
                if self.shutting_down.load(Ordering::Acquire) && !status.success() {
                    agent.status = AgentStatus::Interrupted;
                } else {
                    agent.status = if status.success() { AgentStatus::Success } else { AgentStatus::Failed };
                    if !status.success() {
                        agent.reason = Some(format!("exited with {status}"));
                    }
                }
            }
            Ok(Err(err)) => {
                agent.status = AgentStatus::Failed;
                agent.reason = Some(format!("error waiting on process: {err}"));
            }
            Err(_) => {
                warn!(agent_id = %agent.id, "agent timed out, escalating SIGTERM -> SIGKILL");
                #[cfg(unix)]
                {
                    // SAFETY: pid was obtained from a child we spawned and own.
                    unsafe {
                        libc::kill(pid, libc::SIGTERM);
                    }
                    let graceful = tokio::time::timeout(KILL_GRACE, child.wait()).await;
                    if graceful.is_err() {
                        let _ = child.kill().await;
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = child.kill().await;
                }
                agent.status = AgentStatus::Failed;
                agent.reason = Some(format!("timed out after {AGENT_TIMEOUT_MS}ms"));
            }
        }
        agent.finished_at = Some(chrono::Utc::now());
        self.processes.lock().await.remove(&agent.id);
    }

    /// Terminate every still-tracked process (session shutdown / interrupt).
    /// Sends SIGTERM to each process group, waits `KILL_ALL_GRACE`, then
    /// SIGKILLs whatever is still tracked (spec §4.2 `killAll`).
    pub async fn kill_all(&self) {
        self.shutting_down.store(true, Ordering::Release);
        {
            let processes = self.processes.lock().await;
            for &pid in processes.values() {
                #[cfg(unix)]
                // SAFETY: pid recorded from a child this manager spawned.
                unsafe {
                    libc::kill(-pid, libc::SIGTERM);
                }
            }
        }
        tokio::time::sleep(KILL_ALL_GRACE).await;
        let processes = self.processes.lock().await;
        for (&agent_id, &pid) in processes.iter() {
            debug!(%agent_id, pid, "process outlived kill-all grace, sending SIGKILL");
            #[cfg(unix)]
            // SAFETY: pid recorded from a child this manager spawned.
            unsafe {
                libc::kill(-pid, libc::SIGKILL);
            }
        }
    }
}

fn default_model_name(tier: ModelTier) -> String {
    match tier {
        ModelTier::T0 => "haiku".to_string(),
        ModelTier::T1 => "sonnet".to_string(),
        ModelTier::T2 => "sonnet-thinking".to_string(),
        ModelTier::T3 => "opus".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::backend::ClaudeCodeBackend;
    use haivemind_state::Engine;
    use std::path::PathBuf;

    fn test_project() -> Project {
        Project {
            slug: "demo".into(),
            dir: PathBuf::from("/tmp"),
            settings: haivemind_state::models::ProjectSettings::default(),
            skills: haivemind_state::models::ProjectSkills::default(),
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

    #[tokio::test]
    async fn spawn_success_updates_agent_status() {
        let tmp = tempfile::tempdir().unwrap();
        let script = fake_script(
            &tmp,
            "ok.sh",
            r#"echo '{"type":"result","result":"done"}'"#,
        );
        let backend = Arc::new(ClaudeCodeBackend::with_binary(script.to_str().unwrap()));
        let engine = Arc::new(Engine::new());
        let bus = Broadcaster::new(engine);
        let manager = AgentManager::new(backend, bus);

        let project = test_project();
        let session_id = Uuid::new_v4();

        let agent = manager
            .spawn("t1", 0, tmp.path(), "label", "desc", &[], "", "", &project, 0.0, session_id)
            .await;

        assert_eq!(agent.status, AgentStatus::Success);
        assert!(agent.output.joined().contains("done"));
    }

    #[tokio::test]
    async fn spawn_nonzero_exit_marks_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let script = fake_script(&tmp, "fail.sh", "exit 1");
        let backend = Arc::new(ClaudeCodeBackend::with_binary(script.to_str().unwrap()));
        let engine = Arc::new(Engine::new());
        let bus = Broadcaster::new(engine);
        let manager = AgentManager::new(backend, bus);

        let project = test_project();
        let session_id = Uuid::new_v4();

        let agent = manager
            .spawn("t1", 0, tmp.path(), "label", "desc", &[], "", "", &project, 0.0, session_id)
            .await;

        assert_eq!(agent.status, AgentStatus::Failed);
    }

    #[tokio::test]
    async fn spawn_refuses_when_cost_ceiling_exceeded() {
        let tmp = tempfile::tempdir().unwrap();
        let script = fake_script(&tmp, "ok.sh", r#"echo '{"type":"result","result":"done"}'"#);
        let backend = Arc::new(ClaudeCodeBackend::with_binary(script.to_str().unwrap()));
        let engine = Arc::new(Engine::new());
        let bus = Broadcaster::new(engine);
        let manager = AgentManager::new(backend, bus);

        let mut project = test_project();
        project.settings.cost_ceiling = 0.5; // T0 has multiplier 0.0, T1 = 1.0
        project.settings.escalation = vec![ModelTier::T1];

        let session_id = Uuid::new_v4();

        let agent = manager
            .spawn("t1", 0, tmp.path(), "label", "desc", &[], "", "", &project, 0.0, session_id)
            .await;

        assert_eq!(agent.status, AgentStatus::Blocked);
        assert!(agent.reason.unwrap().contains("cost ceiling"));
    }

    #[test]
    fn prompt_includes_task_and_context() {
        let prompt = AgentManager::build_prompt("Fix bug", "Do the thing", &["a.rs".into()], "use cargo fmt", "prior failure");
        assert!(prompt.contains("Fix bug"));
        assert!(prompt.contains("a.rs"));
        assert!(prompt.contains("use cargo fmt"));
        assert!(prompt.contains("prior failure"));
    }
}
