//! Shared fixtures for haivemind-core/haivemind-cli tests: a scripted
//! fake agent backend, a temp git workspace builder, and in-memory
//! decomposer/verifier/workspace-analyzer stand-ins, mirroring the
//! teacher's `gator-test-utils`.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use haivemind_core::orchestrator::{DecomposeContext, Decomposer, Verifier, VerifyReport, WorkspaceAnalyzer};
use haivemind_state::models::{Project, ProjectSettings, ProjectSkills, Task};

/// Write an executable shell script under `dir` and return its path, for
/// use with `ClaudeCodeBackend::with_binary` in place of a real `claude`
/// install.
pub fn fake_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// A minimal `Project` rooted at `dir`, default settings and no skills.
pub fn test_project(slug: impl Into<String>, dir: impl Into<PathBuf>) -> Project {
    Project { slug: slug.into(), dir: dir.into(), settings: ProjectSettings::default(), skills: ProjectSkills::default() }
}

/// `git init` a temp dir plus one commit, so snapshot/rollback code sees
/// a real working tree instead of falling back to the tarball path.
pub fn init_git_workspace(dir: &Path) {
    let run = |args: &[&str]| {
        Command::new("git").args(args).current_dir(dir).status().expect("git must be on PATH for test fixtures");
    };
    run(&["init", "-q"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "test"]);
    std::fs::write(dir.join("README.md"), "fixture\n").unwrap();
    run(&["add", "-A"]);
    run(&["commit", "-q", "-m", "init"]);
}

/// Decomposer that always returns the same fixed task list, ignoring the
/// prompt/context it is given.
#[derive(Debug, Clone, Default)]
pub struct StaticDecomposer {
    pub tasks: Vec<Task>,
}

impl StaticDecomposer {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl Decomposer for StaticDecomposer {
    async fn decompose(&self, _prompt: &str, _work_dir: &Path, _ctx: DecomposeContext) -> Result<Vec<Task>> {
        Ok(self.tasks.clone())
    }
}

/// Verifier that always reports success with no follow-up work.
#[derive(Debug, Clone, Default)]
pub struct AlwaysPassVerifier;

#[async_trait]
impl Verifier for AlwaysPassVerifier {
    async fn verify(&self, _plan: &[Task], _work_dir: &Path, _skills: &ProjectSkills) -> Result<VerifyReport> {
        Ok(VerifyReport { passed: true, issues: Vec::new(), follow_up_tasks: Vec::new() })
    }
}

/// Verifier that fails exactly once (appending `follow_ups`), then
/// passes on every subsequent call. Useful for exercising the
/// verify-fix loop's single extra round.
#[derive(Debug, Default)]
pub struct FailOnceVerifier {
    pub follow_ups: Vec<Task>,
    called: Mutex<bool>,
}

impl FailOnceVerifier {
    pub fn new(follow_ups: Vec<Task>) -> Self {
        Self { follow_ups, called: Mutex::new(false) }
    }
}

#[async_trait]
impl Verifier for FailOnceVerifier {
    async fn verify(&self, _plan: &[Task], _work_dir: &Path, _skills: &ProjectSkills) -> Result<VerifyReport> {
        let mut called = self.called.lock().unwrap();
        if *called {
            Ok(VerifyReport { passed: true, issues: Vec::new(), follow_up_tasks: Vec::new() })
        } else {
            *called = true;
            Ok(VerifyReport { passed: false, issues: vec!["fixture failure".to_string()], follow_up_tasks: self.follow_ups.clone() })
        }
    }
}

/// Workspace analyzer that returns a fixed JSON blob without touching
/// the filesystem.
#[derive(Debug, Clone)]
pub struct StaticWorkspaceAnalyzer(pub Value);

#[async_trait]
impl WorkspaceAnalyzer for StaticWorkspaceAnalyzer {
    async fn analyze(&self, _work_dir: &Path) -> Result<Value> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_decomposer_ignores_prompt() {
        let d = StaticDecomposer::new(vec![Task::new("a", "A", "do a")]);
        let ctx = DecomposeContext { skills: ProjectSkills::default(), workspace_analysis: None };
        let tasks = d.decompose("anything", Path::new("/tmp"), ctx).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "a");
    }

    #[tokio::test]
    async fn fail_once_verifier_then_passes() {
        let v = FailOnceVerifier::new(vec![Task::new("fix", "Fix", "fix it")]);
        let skills = ProjectSkills::default();
        let first = v.verify(&[], Path::new("/tmp"), &skills).await.unwrap();
        assert!(!first.passed);
        assert_eq!(first.follow_up_tasks.len(), 1);
        let second = v.verify(&[], Path::new("/tmp"), &skills).await.unwrap();
        assert!(second.passed);
    }
}
