pub mod agent;
pub mod broadcast;
pub mod orchestrator;
pub mod recovery;
pub mod runner;
pub mod shutdown;
pub mod snapshot;
pub mod summarizer;

pub use agent::{AgentBackend, AgentManager};
pub use broadcast::Broadcaster;
pub use orchestrator::{
    ClaudeCodePlanner, Decomposer, MarkerFileWorkspaceAnalyzer, OrchestratorConfig, Reflection, SessionOrchestrator,
    Verifier, VerifyReport, WorkspaceAnalyzer,
};
pub use recovery::recover_orphaned_sessions;
pub use runner::{RunOutcome, RunnerConfig, SplitFn, TaskRunner};
pub use shutdown::graceful_shutdown;
