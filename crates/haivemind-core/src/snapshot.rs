//! Snapshot & Checkpoint: pre-session workspace snapshots (git tag or
//! tarball), rollback, diffing, and periodic session checkpoints to disk.
//! Spec §4.6.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use haivemind_state::models::{Session, Snapshot, TimelineEvent};

const SNAPSHOT_TAG_PREFIX: &str = "haivemind/pre-session";
const EXCLUDED_FROM_TARBALL: [&str; 3] = [".haivemind", "node_modules", ".git"];
/// Timeline events retained in a checkpoint (spec §4.6: "timeline[last 200]").
const CHECKPOINT_TIMELINE_LEN: usize = 200;

fn is_git_working_tree(work_dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(work_dir)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Take a pre-session snapshot of `work_dir`: a lightweight git tag if
/// it's inside a git working tree, else a gzip tarball, else `None`.
pub fn take_snapshot(work_dir: &Path, session_id: Uuid) -> Result<Snapshot> {
    if is_git_working_tree(work_dir) {
        let tag = format!("{SNAPSHOT_TAG_PREFIX}/{session_id}");
        let output = Command::new("git")
            .args(["tag", &tag])
            .current_dir(work_dir)
            .output()
            .context("failed to run git tag")?;
        if !output.status.success() {
            bail!("git tag failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        return Ok(Snapshot::GitTag { tag });
    }

    let snapshots_dir = work_dir.join(".haivemind").join("snapshots");
    std::fs::create_dir_all(&snapshots_dir).context("failed to create snapshots directory")?;
    let archive_path = snapshots_dir.join(format!("{session_id}.tar.gz"));

    let mut args = vec!["-czf".to_string(), archive_path.to_string_lossy().to_string()];
    for excluded in EXCLUDED_FROM_TARBALL {
        args.push("--exclude".to_string());
        args.push(excluded.to_string());
    }
    args.push(".".to_string());

    let output = Command::new("tar").args(&args).current_dir(work_dir).output();
    match output {
        Ok(out) if out.status.success() => Ok(Snapshot::Tarball { path: archive_path }),
        _ => Ok(Snapshot::None),
    }
}

/// Roll a workspace back to its pre-session snapshot.
pub fn rollback_to_snapshot(work_dir: &Path, snapshot: &Snapshot) -> Result<()> {
    match snapshot {
        Snapshot::GitTag { tag } => {
            let reset = Command::new("git")
                .args(["reset", "--hard", tag])
                .current_dir(work_dir)
                .output()
                .context("failed to run git reset")?;
            if !reset.status.success() {
                bail!("git reset --hard {tag} failed: {}", String::from_utf8_lossy(&reset.stderr));
            }
            let clean = Command::new("git")
                .args(["clean", "-fd"])
                .current_dir(work_dir)
                .output()
                .context("failed to run git clean")?;
            if !clean.status.success() {
                bail!("git clean -fd failed: {}", String::from_utf8_lossy(&clean.stderr));
            }
            Ok(())
        }
        Snapshot::Tarball { path } => {
            let output = Command::new("tar")
                .args(["-xzf", &path.to_string_lossy(), "-C"])
                .arg(work_dir)
                .output()
                .context("failed to run tar extract")?;
            if !output.status.success() {
                bail!("tar extract failed: {}", String::from_utf8_lossy(&output.stderr));
            }
            Ok(())
        }
        Snapshot::None => bail!("no snapshot to roll back to"),
    }
}

/// A summary diff between the current workspace and its pre-session state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub changed_files: Vec<String>,
    pub stat: String,
    pub untracked_files: Vec<String>,
}

/// Compute the diff between the current working tree and the session's
/// snapshot (git-backed sessions only; non-git snapshots have no diff).
pub fn get_snapshot_diff(work_dir: &Path, snapshot: &Snapshot) -> Result<SnapshotDiff> {
    let Snapshot::GitTag { tag } = snapshot else {
        return Ok(SnapshotDiff::default());
    };

    let names = Command::new("git")
        .args(["diff", "--name-only", tag])
        .current_dir(work_dir)
        .output()
        .context("failed to run git diff --name-only")?;
    let changed_files = String::from_utf8_lossy(&names.stdout)
        .lines()
        .map(|l| l.to_string())
        .filter(|l| !l.is_empty())
        .collect();

    let stat_output = Command::new("git")
        .args(["diff", "--stat", tag])
        .current_dir(work_dir)
        .output()
        .context("failed to run git diff --stat")?;
    let stat = String::from_utf8_lossy(&stat_output.stdout).to_string();

    let untracked = Command::new("git")
        .args(["ls-files", "--others", "--exclude-standard"])
        .current_dir(work_dir)
        .output()
        .context("failed to run git ls-files")?;
    let untracked_files = String::from_utf8_lossy(&untracked.stdout)
        .lines()
        .map(|l| l.to_string())
        .filter(|l| !l.is_empty())
        .collect();

    Ok(SnapshotDiff { changed_files, stat, untracked_files })
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointTask {
    pub id: String,
    pub label: String,
    pub status: haivemind_state::models::TaskStatus,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: Uuid,
    pub project_slug: String,
    pub status: haivemind_state::models::SessionStatus,
    pub prompt: String,
    pub work_dir: PathBuf,
    pub snapshot: Snapshot,
    pub tasks: Vec<CheckpointTask>,
    pub timeline: Vec<TimelineEvent>,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build a checkpoint from a live session, keeping only the last
    /// [`CHECKPOINT_TIMELINE_LEN`] timeline events (spec §4.6).
    pub fn from_session(session: &Session) -> Self {
        let tasks = session
            .plan
            .iter()
            .map(|task| CheckpointTask {
                id: task.id.clone(),
                label: task.label.clone(),
                status: session
                    .task_states
                    .get(&task.id)
                    .map(|s| s.status)
                    .unwrap_or(haivemind_state::models::TaskStatus::Pending),
                dependencies: task.dependencies.clone(),
            })
            .collect();

        let timeline = session
            .timeline
            .iter()
            .rev()
            .take(CHECKPOINT_TIMELINE_LEN)
            .rev()
            .cloned()
            .collect();

        Self {
            session_id: session.id,
            project_slug: session.project_slug.clone(),
            status: session.status,
            prompt: session.prompt.clone(),
            work_dir: session.work_dir.clone(),
            snapshot: session.snapshot.clone(),
            tasks,
            timeline,
            written_at: Utc::now(),
        }
    }
}

fn checkpoint_path(project_dir: &Path, session_id: Uuid) -> PathBuf {
    project_dir.join(".haivemind").join("checkpoints").join(format!("{session_id}.json"))
}

fn interrupted_path(base_dir: &Path, session_id: Uuid) -> PathBuf {
    base_dir.join(".haivemind").join("interrupted").join(format!("{session_id}.json"))
}

/// Write a checkpoint file for a running session. Called by the periodic
/// 30s flush timer.
pub fn write_checkpoint(project_dir: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let path = checkpoint_path(project_dir, checkpoint.session_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(checkpoint)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Delete a session's checkpoint (called on finalize).
pub fn delete_checkpoint(project_dir: &Path, session_id: Uuid) -> Result<()> {
    let path = checkpoint_path(project_dir, session_id);
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Scan every project directory under `base_dir` for checkpoints left by
/// sessions that were still `running` when the process crashed/restarted,
/// and migrate them into the interrupted inbox.
pub fn migrate_orphaned_checkpoints(base_dir: &Path, project_dirs: &[PathBuf]) -> Result<Vec<Uuid>> {
    let mut migrated = Vec::new();
    for project_dir in project_dirs {
        let checkpoints_dir = project_dir.join(".haivemind").join("checkpoints");
        let Ok(entries) = std::fs::read_dir(&checkpoints_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(checkpoint) = serde_json::from_str::<Checkpoint>(&contents) else {
                continue;
            };
            if checkpoint.status != haivemind_state::models::SessionStatus::Running {
                continue;
            }

            let dest = interrupted_path(base_dir, checkpoint.session_id);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dest, &contents)?;
            std::fs::remove_file(&path)?;
            migrated.push(checkpoint.session_id);
        }
    }
    Ok(migrated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_git_repo(dir: &Path) {
        Command::new("git").args(["init", "-q"]).current_dir(dir).status().unwrap();
        Command::new("git").args(["config", "user.email", "test@example.com"]).current_dir(dir).status().unwrap();
        Command::new("git").args(["config", "user.name", "test"]).current_dir(dir).status().unwrap();
        std::fs::write(dir.join("file.txt"), "hello").unwrap();
        Command::new("git").args(["add", "-A"]).current_dir(dir).status().unwrap();
        Command::new("git").args(["commit", "-q", "-m", "init"]).current_dir(dir).status().unwrap();
    }

    #[test]
    fn git_repo_snapshot_creates_tag() {
        let tmp = tempfile::tempdir().unwrap();
        init_git_repo(tmp.path());

        let session_id = Uuid::new_v4();
        let snapshot = take_snapshot(tmp.path(), session_id).unwrap();
        assert!(matches!(snapshot, Snapshot::GitTag { .. }));
    }

    #[test]
    fn non_git_dir_falls_back_to_tarball() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "content").unwrap();

        let session_id = Uuid::new_v4();
        let snapshot = take_snapshot(tmp.path(), session_id).unwrap();
        match snapshot {
            Snapshot::Tarball { path } => assert!(path.exists()),
            other => panic!("expected tarball snapshot, got {other:?}"),
        }
    }

    #[test]
    fn rollback_restores_git_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        init_git_repo(tmp.path());
        let session_id = Uuid::new_v4();
        let snapshot = take_snapshot(tmp.path(), session_id).unwrap();

        std::fs::write(tmp.path().join("file.txt"), "modified").unwrap();
        rollback_to_snapshot(tmp.path(), &snapshot).unwrap();

        let contents = std::fs::read_to_string(tmp.path().join("file.txt")).unwrap();
        assert_eq!(contents, "hello");
    }

    #[test]
    fn diff_reports_changed_files() {
        let tmp = tempfile::tempdir().unwrap();
        init_git_repo(tmp.path());
        let session_id = Uuid::new_v4();
        let snapshot = take_snapshot(tmp.path(), session_id).unwrap();

        std::fs::write(tmp.path().join("file.txt"), "modified").unwrap();
        let diff = get_snapshot_diff(tmp.path(), &snapshot).unwrap();
        assert_eq!(diff.changed_files, vec!["file.txt".to_string()]);
    }

    #[test]
    fn checkpoint_round_trips_through_json() {
        let session = Session::new(Uuid::new_v4(), "proj", "do stuff", PathBuf::from("/tmp"));
        let checkpoint = Checkpoint::from_session(&session);
        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id, session.id);
    }

    #[test]
    fn checkpoint_caps_timeline_at_200() {
        let mut session = Session::new(Uuid::new_v4(), "proj", "do stuff", PathBuf::from("/tmp"));
        for i in 0..300 {
            session.record_event("TASK_STATUS", serde_json::json!({"i": i}));
        }
        let checkpoint = Checkpoint::from_session(&session);
        assert_eq!(checkpoint.timeline.len(), CHECKPOINT_TIMELINE_LEN);
        // Keeps the most recent events.
        assert_eq!(checkpoint.timeline.last().unwrap().payload["i"], 299);
    }

    #[test]
    fn write_and_delete_checkpoint_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let session = Session::new(Uuid::new_v4(), "proj", "do stuff", PathBuf::from("/tmp"));
        let checkpoint = Checkpoint::from_session(&session);

        write_checkpoint(tmp.path(), &checkpoint).unwrap();
        assert!(checkpoint_path(tmp.path(), session.id).exists());

        delete_checkpoint(tmp.path(), session.id).unwrap();
        assert!(!checkpoint_path(tmp.path(), session.id).exists());
    }

    #[test]
    fn orphaned_running_checkpoint_is_migrated_to_interrupted_inbox() {
        let base = tempfile::tempdir().unwrap();
        let project_dir = base.path().join("myproject");
        std::fs::create_dir_all(&project_dir).unwrap();

        let mut session = Session::new(Uuid::new_v4(), "myproject", "do stuff", PathBuf::from("/tmp"));
        session.status = haivemind_state::models::SessionStatus::Running;
        let checkpoint = Checkpoint::from_session(&session);
        write_checkpoint(&project_dir, &checkpoint).unwrap();

        let migrated = migrate_orphaned_checkpoints(base.path(), std::slice::from_ref(&project_dir)).unwrap();
        assert_eq!(migrated, vec![session.id]);
        assert!(interrupted_path(base.path(), session.id).exists());
        assert!(!checkpoint_path(&project_dir, session.id).exists());
    }

    #[test]
    fn completed_checkpoint_is_not_migrated() {
        let base = tempfile::tempdir().unwrap();
        let project_dir = base.path().join("myproject");
        std::fs::create_dir_all(&project_dir).unwrap();

        let mut session = Session::new(Uuid::new_v4(), "myproject", "do stuff", PathBuf::from("/tmp"));
        session.status = haivemind_state::models::SessionStatus::Completed;
        let checkpoint = Checkpoint::from_session(&session);
        write_checkpoint(&project_dir, &checkpoint).unwrap();

        let migrated = migrate_orphaned_checkpoints(base.path(), std::slice::from_ref(&project_dir)).unwrap();
        assert!(migrated.is_empty());
        assert!(checkpoint_path(&project_dir, session.id).exists());
    }
}
