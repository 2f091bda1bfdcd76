//! The `AgentBackend` trait -- the adapter interface for spawning external
//! AI coding agent processes. Each concrete backend wraps a specific CLI
//! (e.g. `claude`) and translates its stdout into the common
//! [`AgentEvent`] stream.

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn backend binary '{binary}': {source}")]
    SpawnFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a backend needs to build and launch a subprocess for one
/// agent attempt.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub env_vars: Vec<(String, String)>,
    pub model: String,
}

/// Output from parsing one line of a backend's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Message { role: String, content: String },
    ToolCall { tool: String, input: serde_json::Value },
    ToolResult { tool: String, output: serde_json::Value },
    Error { message: String },
    Completed,
}

/// A spawned process plus the shell command line used to launch it (for
/// display/audit in [`haivemind_state::models::Agent::cli_command`]).
pub struct SpawnedProcess {
    pub child: Child,
    pub cli_command: String,
}

/// Adapter interface for spawning and streaming output from external AI
/// coding agent CLIs. Object-safe so it can be stored as `Box<dyn
/// AgentBackend>` in a registry.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Human-readable name for this backend (e.g. `"claude-code"`).
    fn name(&self) -> &str;

    /// Spawn a subprocess for the given request. The child's stdout must
    /// be piped; stdin piped if the backend supports resumption.
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, BackendError>;

    /// Parse one line of the backend's stdout into zero or more events.
    fn parse_line(&self, line: &str) -> Vec<AgentEvent>;
}

/// Backend adapter for the Claude Code CLI.
///
/// Launches `claude -p --output-format stream-json` and parses its JSONL
/// output into [`AgentEvent`] variants.
#[derive(Debug, Clone)]
pub struct ClaudeCodeBackend {
    binary_path: String,
}

impl ClaudeCodeBackend {
    pub fn new() -> Self {
        Self { binary_path: "claude".to_string() }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self { binary_path: path.into() }
    }
}

impl Default for ClaudeCodeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for ClaudeCodeBackend {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess, BackendError> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--model")
            .arg(&request.model)
            .arg("--allowedTools")
            .arg("Bash,Read,Edit,Write,Glob,Grep")
            .arg("--append-system-prompt")
            .arg(&request.prompt);
        cmd.current_dir(&request.working_dir);
        for (key, value) in &request.env_vars {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0); // own process group, so killAll can signal the whole tree

        let cli_command = format!("{} -p --output-format stream-json --model {}", self.binary_path, request.model);
        let child = cmd.spawn().map_err(|source| BackendError::SpawnFailed {
            binary: self.binary_path.clone(),
            source,
        })?;

        Ok(SpawnedProcess { child, cli_command })
    }

    fn parse_line(&self, line: &str) -> Vec<AgentEvent> {
        let Ok(v) = serde_json::from_str::<serde_json::Value>(line) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match event_type {
            "assistant" => {
                if let Some(message) = v.get("message") {
                    if let Some(blocks) = message.get("content").and_then(|c| c.as_array()) {
                        for block in blocks {
                            match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                                "text" => {
                                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                        events.push(AgentEvent::Message {
                                            role: "assistant".to_string(),
                                            content: text.to_string(),
                                        });
                                    }
                                }
                                "tool_use" => {
                                    events.push(AgentEvent::ToolCall {
                                        tool: block
                                            .get("name")
                                            .and_then(|n| n.as_str())
                                            .unwrap_or("unknown")
                                            .to_string(),
                                        input: block.get("input").cloned().unwrap_or(serde_json::Value::Null),
                                    });
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            "tool_result" => {
                events.push(AgentEvent::ToolResult {
                    tool: v.get("name").and_then(|n| n.as_str()).unwrap_or("unknown").to_string(),
                    output: v.get("output").cloned().unwrap_or(serde_json::Value::Null),
                });
            }
            "result" => {
                if let Some(text) = v.get("result").and_then(|r| r.as_str()) {
                    events.push(AgentEvent::Message {
                        role: "assistant".to_string(),
                        content: text.to_string(),
                    });
                }
            }
            "error" => {
                let message = v
                    .get("error")
                    .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                    .or_else(|| v.get("message").and_then(|m| m.as_str()))
                    .unwrap_or("unknown error")
                    .to_string();
                events.push(AgentEvent::Error { message });
            }
            _ => {}
        }
        events
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_text() {
        let backend = ClaudeCodeBackend::new();
        let events = backend.parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#,
        );
        assert_eq!(events, vec![AgentEvent::Message { role: "assistant".into(), content: "hi".into() }]);
    }

    #[test]
    fn parses_tool_use() {
        let backend = ClaudeCodeBackend::new();
        let events = backend.parse_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}"#,
        );
        assert_eq!(
            events,
            vec![AgentEvent::ToolCall { tool: "Bash".into(), input: serde_json::json!({"command": "ls"}) }]
        );
    }

    #[test]
    fn malformed_line_yields_no_events() {
        let backend = ClaudeCodeBackend::new();
        assert!(backend.parse_line("not json").is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_on_missing_binary() {
        let backend = ClaudeCodeBackend::with_binary("/nonexistent/binary");
        let request = SpawnRequest {
            prompt: "do stuff".into(),
            working_dir: PathBuf::from("/tmp"),
            env_vars: vec![],
            model: "sonnet".into(),
        };
        let result = backend.spawn(&request).await;
        assert!(matches!(result, Err(BackendError::SpawnFailed { .. })));
    }
}
