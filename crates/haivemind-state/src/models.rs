//! Core data model: tasks, agents, sessions, and supporting value types.
//!
//! None of this is backed by a database — per §3/§9 of the spec, the
//! engine's registries are plain in-process maps. These types are the
//! values those maps hold, and what gets written out to JSON on snapshot,
//! checkpoint, and session-finalize.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The kind of a task node in the plan DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// A task that spawns an agent to do work.
    Work,
    /// A bridge node between chat iterations; never executes.
    Prompt,
    /// A verification task appended by the verify-fix loop.
    Verify,
}

/// Runner-owned status of a task. See spec §3 invariant 1 for the legal
/// transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Gated,
    Running,
    Success,
    Blocked,
}

impl TaskStatus {
    /// Whether `to` is a legal transition from `self`.
    ///
    /// `gated -> pending` only on human approval; `running -> pending` only
    /// on retry; all other edges follow `pending -> running -> {success,
    /// blocked}` monotonically.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Gated)
                | (Gated, Pending)
                | (Gated, Blocked)
                | (Running, Success)
                | (Running, Blocked)
                | (Running, Pending)
        )
    }
}

/// Immutable identity plus mutable dependency/description fields of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub label: String,
    pub description: String,
    pub dependencies: Vec<String>,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub gate: bool,
    pub affected_files: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, label: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: description.into(),
            dependencies: Vec::new(),
            task_type: TaskType::Work,
            gate: false,
            affected_files: Vec::new(),
        }
    }

    /// Append human-gate feedback under a "Human Feedback" heading.
    pub fn append_human_feedback(&mut self, feedback: &str) {
        self.description
            .push_str(&format!("\n\n## Human Feedback\n\n{feedback}"));
    }
}

/// A failure report accumulated on a [`TaskState`] after a failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub summary: OutputSummary,
    pub suggested_fix: String,
    pub category: String,
}

/// Runner-owned mutable state for a single [`Task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub retries: u32,
    pub agent_ids: Vec<Uuid>,
    pub failure_reports: Vec<FailureReport>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set once `_trySplitTask` has been invoked for this task (P9).
    pub split_attempted: bool,
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            retries: 0,
            agent_ids: Vec::new(),
            failure_reports: Vec::new(),
            started_at: None,
            completed_at: None,
            split_attempted: false,
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

/// An edge in the plan DAG, derived from task dependencies for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Cost tier for agent model selection; indexes an escalation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    T0,
    T1,
    T2,
    T3,
}

impl ModelTier {
    /// Cost weight multiplier for this tier.
    pub fn multiplier(self) -> f64 {
        match self {
            ModelTier::T0 => 0.0,
            ModelTier::T1 => 1.0,
            ModelTier::T2 => 2.0,
            ModelTier::T3 => 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Success,
    Failed,
    Blocked,
    Interrupted,
}

/// A bounded ring buffer of output chunks, tracking total byte length.
///
/// Oldest chunks are evicted on overflow so `total_bytes <= max_bytes`
/// always holds (spec P5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputBuffer {
    chunks: VecDeque<String>,
    total_bytes: usize,
    max_bytes: usize,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    pub fn push(&mut self, chunk: String) {
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);
        while self.total_bytes > self.max_bytes {
            match self.chunks.pop_front() {
                Some(evicted) => self.total_bytes -= evicted.len(),
                None => break,
            }
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn joined(&self) -> String {
        self.chunks.iter().cloned().collect::<Vec<_>>().join("")
    }

    pub fn tail(&self, max_bytes: usize) -> String {
        let joined = self.joined();
        if joined.len() <= max_bytes {
            return joined;
        }
        let start = joined.len() - max_bytes;
        let mut start = start;
        while start < joined.len() && !joined.is_char_boundary(start) {
            start += 1;
        }
        joined[start..].to_string()
    }
}

/// One spawn attempt of an agent for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub task_id: String,
    pub model_tier: ModelTier,
    pub model: String,
    pub multiplier: f64,
    pub status: AgentStatus,
    pub retries: u32,
    pub reason: Option<String>,
    pub prompt: String,
    pub cli_command: String,
    pub output: OutputBuffer,
    pub summary: Option<OutputSummary>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Output summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub details: Vec<String>,
}

/// Structured extraction from a raw agent output blob. See spec §4.5.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSummary {
    pub files_changed: Vec<String>,
    pub files_deleted: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub tests: TestCounts,
    pub commands: Vec<String>,
    pub digest: String,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Planning,
    Running,
    Completed,
    Failed,
    Interrupted,
}

/// The kind of pre-session workspace snapshot taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Snapshot {
    GitTag { tag: String },
    Tarball { path: PathBuf },
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    /// Sum of multipliers spent, bucketed by tier.
    pub by_tier: std::collections::BTreeMap<String, f64>,
    pub total: f64,
}

/// A single recorded timeline event. Bounded to 5,000 per session (P4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// A DAG rewrite record (stall-triggered edge removal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRecord {
    pub from: String,
    pub to: String,
    pub from_label: String,
    pub to_label: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmStats {
    pub total_tasks: usize,
    pub total_waves: usize,
    pub peak_concurrency: usize,
    pub speculative_launches: usize,
    pub task_splits: usize,
    pub dag_rewrites: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub project_slug: String,
    pub prompt: String,
    pub status: SessionStatus,
    pub work_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub plan: Vec<Task>,
    pub edges: Vec<Edge>,
    /// Runner-owned state, one per task in `plan` (spec §3 TaskState).
    pub task_states: std::collections::HashMap<String, TaskState>,
    #[serde(skip)]
    pub agents: std::collections::HashMap<Uuid, Agent>,
    pub timeline: VecDeque<TimelineEvent>,
    pub snapshot: Snapshot,
    pub cost_summary: CostSummary,
    pub completed_at: Option<DateTime<Utc>>,
    pub rewrites: Vec<RewriteRecord>,
    pub swarm_stats: SwarmStats,
    /// Workspace analysis result, attached either before planning (if it
    /// arrived within the analysis timeout) or post-hoc once it resolves
    /// (spec §4.4 step 3), for use in subsequent agent prompts.
    pub workspace_analysis: Option<serde_json::Value>,
}

/// Maximum timeline length before oldest events are dropped (spec P4).
pub const MAX_TIMELINE_LEN: usize = 5000;

impl Session {
    pub fn new(id: Uuid, project_slug: impl Into<String>, prompt: impl Into<String>, work_dir: PathBuf) -> Self {
        Self {
            id,
            project_slug: project_slug.into(),
            prompt: prompt.into(),
            status: SessionStatus::Planning,
            work_dir,
            started_at: Utc::now(),
            plan: Vec::new(),
            edges: Vec::new(),
            task_states: std::collections::HashMap::new(),
            agents: std::collections::HashMap::new(),
            timeline: VecDeque::new(),
            snapshot: Snapshot::None,
            cost_summary: CostSummary::default(),
            completed_at: None,
            rewrites: Vec::new(),
            swarm_stats: SwarmStats::default(),
            workspace_analysis: None,
        }
    }

    /// Push a timeline event, dropping the oldest on overflow (P4/invariant 7).
    pub fn record_event(&mut self, event_type: impl Into<String>, payload: serde_json::Value) {
        self.timeline.push_back(TimelineEvent {
            ts: Utc::now(),
            event_type: event_type.into(),
            payload,
        });
        while self.timeline.len() > MAX_TIMELINE_LEN {
            self.timeline.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Project (external collaborator data the core reads)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSettings {
    /// Escalation chain, e.g. `[T0, T0, T1, T2, T3]`, indexed by retry count.
    pub escalation: Vec<ModelTier>,
    pub max_retries_total: u32,
    pub max_concurrency: usize,
    /// Label-substring -> model name overrides.
    pub pinned_models: std::collections::BTreeMap<String, String>,
    pub cost_ceiling: f64,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            escalation: vec![ModelTier::T0, ModelTier::T0, ModelTier::T1, ModelTier::T2, ModelTier::T3],
            max_retries_total: 4,
            max_concurrency: 4,
            pinned_models: Default::default(),
            cost_ceiling: f64::MAX,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSkills {
    pub build_commands: Vec<String>,
    pub test_commands: Vec<String>,
    pub lint_commands: Vec<String>,
    pub patterns: Vec<String>,
}

impl ProjectSkills {
    /// Set-union merge, used after skill extraction.
    pub fn merge(&mut self, other: &ProjectSkills) {
        for (dst, src) in [
            (&mut self.build_commands, &other.build_commands),
            (&mut self.test_commands, &other.test_commands),
            (&mut self.lint_commands, &other.lint_commands),
            (&mut self.patterns, &other.patterns),
        ] {
            for item in src {
                if !dst.contains(item) {
                    dst.push(item.clone());
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub slug: String,
    pub dir: PathBuf,
    pub settings: ProjectSettings,
    pub skills: ProjectSkills,
}

impl Project {
    /// Resolve the model for a given retry index using the escalation
    /// chain with pinned-model overrides applied by label substring match.
    ///
    /// Per spec §9 open question: the clamp is `min(retry, chain.len()-1)`;
    /// `max_retries_total` is not consulted here.
    pub fn resolve_model_tier(&self, retry_index: u32) -> ModelTier {
        let chain = &self.settings.escalation;
        if chain.is_empty() {
            return ModelTier::T0;
        }
        let idx = (retry_index as usize).min(chain.len() - 1);
        chain[idx]
    }

    pub fn pinned_model_for_label(&self, label: &str) -> Option<&str> {
        self.pinned_models_iter()
            .find(|(substr, _)| label.contains(substr.as_str()))
            .map(|(_, model)| model.as_str())
    }

    fn pinned_models_iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.settings.pinned_models.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_transitions_monotonic() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Success));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Blocked));
        assert!(!TaskStatus::Success.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Blocked.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn gated_only_moves_to_pending_on_approval() {
        assert!(TaskStatus::Gated.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Gated.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn output_buffer_evicts_oldest_on_overflow() {
        let mut buf = OutputBuffer::new(10);
        buf.push("12345".to_string());
        buf.push("67890".to_string());
        assert_eq!(buf.total_bytes(), 10);
        buf.push("X".to_string());
        assert!(buf.total_bytes() <= 10);
        assert!(buf.joined().ends_with('X'));
    }

    #[test]
    fn timeline_bounded_at_5000() {
        let mut session = Session::new(Uuid::nil(), "proj", "prompt", PathBuf::from("/tmp"));
        for i in 0..5005 {
            session.record_event("TASK_STATUS", serde_json::json!({"i": i}));
        }
        assert_eq!(session.timeline.len(), MAX_TIMELINE_LEN);
    }

    #[test]
    fn resolve_model_tier_clamps_at_chain_end() {
        let project = Project {
            slug: "p".into(),
            dir: PathBuf::from("/tmp"),
            settings: ProjectSettings::default(),
            skills: ProjectSkills::default(),
        };
        assert_eq!(project.resolve_model_tier(0), ModelTier::T0);
        assert_eq!(project.resolve_model_tier(100), ModelTier::T3);
    }

    #[test]
    fn pinned_model_substring_match() {
        let mut settings = ProjectSettings::default();
        settings.pinned_models.insert("security".to_string(), "claude-opus".to_string());
        let project = Project {
            slug: "p".into(),
            dir: PathBuf::from("/tmp"),
            settings,
            skills: ProjectSkills::default(),
        };
        assert_eq!(project.pinned_model_for_label("fix security bug"), Some("claude-opus"));
        assert_eq!(project.pinned_model_for_label("unrelated"), None);
    }
}
