pub mod backend;
pub mod manager;

pub use backend::{AgentBackend, AgentEvent, BackendError, ClaudeCodeBackend, SpawnRequest};
pub use manager::{AgentError, AgentManager};
