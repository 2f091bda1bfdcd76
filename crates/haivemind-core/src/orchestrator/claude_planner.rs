//! Concrete `Decomposer`/`Verifier`/`WorkspaceAnalyzer` implementations
//! shipped with the binary. Planner/verifier calls are external
//! collaborators per spec — black-box functions that take JSON in and
//! return JSON out — so this wraps the same `claude` CLI the agent
//! backend spawns, using `--output-format json` for a single non-streamed
//! reply instead of the stream-json protocol `ClaudeCodeBackend` parses.

use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;

use haivemind_state::models::{ProjectSkills, Task};

use super::{DecomposeContext, Decomposer, Verifier, VerifyReport, WorkspaceAnalyzer};

/// Planner/verifier backed by one-shot `claude -p --output-format json`
/// invocations. Both traits share this type since both are thin
/// prompt-in/JSON-out calls against the same CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCodePlanner {
    binary_path: String,
}

impl ClaudeCodePlanner {
    pub fn new() -> Self {
        Self { binary_path: "claude".to_string() }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self { binary_path: path.into() }
    }

    async fn run(&self, prompt: &str, work_dir: &Path) -> Result<Value> {
        let output = Command::new(&self.binary_path)
            .arg("-p")
            .arg("--output-format")
            .arg("json")
            .arg("--append-system-prompt")
            .arg(prompt)
            .current_dir(work_dir)
            .output()
            .await
            .with_context(|| format!("failed to spawn planner binary '{}'", self.binary_path))?;

        if !output.status.success() {
            bail!("planner exited with {}: {}", output.status, String::from_utf8_lossy(&output.stderr));
        }

        let envelope: Value = serde_json::from_slice(&output.stdout).context("planner stdout was not valid JSON")?;
        let result_text = envelope
            .get("result")
            .and_then(|r| r.as_str())
            .context("planner JSON envelope missing string \"result\" field")?;
        extract_json_object(result_text).context("planner result text contained no JSON object")
    }
}

impl Default for ClaudeCodePlanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Claude often wraps JSON in prose or a fenced code block; pull out the
/// first balanced `{...}` span and parse that.
fn extract_json_object(text: &str) -> Result<Value> {
    let start = text.find('{').context("no '{' found in planner output")?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return serde_json::from_str(&text[start..end]).context("balanced JSON span failed to parse");
                }
            }
            _ => {}
        }
    }
    bail!("no balanced JSON object found in planner output")
}

#[async_trait]
impl Decomposer for ClaudeCodePlanner {
    async fn decompose(&self, prompt: &str, work_dir: &Path, ctx: DecomposeContext) -> Result<Vec<Task>> {
        let instructions = format!(
            "Decompose the following project request into a dependency graph of coding \
             sub-tasks. Respond with ONLY a JSON object of the shape \
             {{\"tasks\":[{{\"id\":string,\"label\":string,\"description\":string,\
             \"dependencies\":[string],\"affectedFiles\":[string]?}}]}}.\n\n\
             Request: {prompt}\n\n\
             Known build/test/lint commands: {skills:?}\n\
             Workspace analysis: {analysis}",
            skills = ctx.skills,
            analysis = ctx.workspace_analysis.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "none".to_string()),
        );
        let value = self.run(&instructions, work_dir).await?;
        let tasks_json = value.get("tasks").cloned().context("planner JSON missing \"tasks\" array")?;
        serde_json::from_value(tasks_json).context("planner \"tasks\" array did not match Task shape")
    }
}

#[async_trait]
impl Verifier for ClaudeCodePlanner {
    async fn verify(&self, plan: &[Task], work_dir: &Path, skills: &ProjectSkills) -> Result<VerifyReport> {
        let instructions = format!(
            "Verify that the following completed task plan satisfies its stated goals by \
             running the project's checks. Respond with ONLY a JSON object of the shape \
             {{\"passed\":bool,\"issues\":[string],\"followUpTasks\":[{{\"id\":string,\
             \"label\":string,\"description\":string,\"dependencies\":[string]}}]}}.\n\n\
             Plan: {}\n\nKnown commands: {skills:?}",
            serde_json::to_string(plan).unwrap_or_default(),
        );
        let value = match self.run(&instructions, work_dir).await {
            Ok(v) => v,
            Err(_) => {
                return Ok(VerifyReport { passed: false, issues: vec!["verifier call failed or returned unparseable output".to_string()], follow_up_tasks: Vec::new() });
            }
        };
        let passed = value.get("passed").and_then(|v| v.as_bool()).unwrap_or(false);
        let issues = value
            .get("issues")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let follow_up_tasks = value
            .get("followUpTasks")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .context("planner \"followUpTasks\" did not match Task shape")?
            .unwrap_or_default();
        Ok(VerifyReport { passed, issues, follow_up_tasks })
    }
}

/// Lightweight workspace analyzer: looks for the usual project markers
/// in `work_dir`'s top level rather than shelling out, since this is a
/// cheap local summary rather than a planner call.
#[derive(Debug, Clone, Default)]
pub struct MarkerFileWorkspaceAnalyzer;

const MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("package.json", "node"),
    ("go.mod", "go"),
    ("pyproject.toml", "python"),
    ("requirements.txt", "python"),
    ("Gemfile", "ruby"),
    ("pom.xml", "java"),
    ("build.gradle", "java"),
];

#[async_trait]
impl WorkspaceAnalyzer for MarkerFileWorkspaceAnalyzer {
    async fn analyze(&self, work_dir: &Path) -> Result<Value> {
        let mut stacks = Vec::new();
        for (marker, stack) in MARKERS {
            if work_dir.join(marker).exists() && !stacks.contains(stack) {
                stacks.push(*stack);
            }
        }
        Ok(json!({ "techStack": stacks }))
    }
}
