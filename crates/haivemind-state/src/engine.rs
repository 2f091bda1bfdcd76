//! The `Engine`: the single value that owns every process-wide registry.
//!
//! Per spec §9's "Global mutable state" design note, `sessions`,
//! `taskToSession`, `activeContexts`, and `workDirLocks` are fields of one
//! `Engine` constructed at startup, not free-floating globals. Each field
//! is behind its own lock so unrelated operations (e.g. indexing a task for
//! session A, acquiring a workspace lock for session B) never contend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::Session;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workspace {path} is already locked by session {holder}")]
    WorkspaceLocked { path: PathBuf, holder: Uuid },
}

/// Resolution of a human gate request (spec §4.3 "Human gates").
#[derive(Debug, Clone)]
pub struct GateResolution {
    pub approved: bool,
    pub feedback: Option<String>,
}

/// Per-session routing state needed by chat and gate handlers, kept
/// separate from [`Session`] itself because it holds non-serializable
/// synchronization primitives.
pub struct ActiveContext {
    pub cancel: CancellationToken,
    /// Guards `handleChatMessage` re-entrancy: only one chat iteration may
    /// be in flight per session at a time.
    chat_inflight: AtomicBool,
    iteration_counter: AtomicU32,
    gate_waiters: Mutex<HashMap<String, oneshot::Sender<GateResolution>>>,
}

impl ActiveContext {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            chat_inflight: AtomicBool::new(false),
            iteration_counter: AtomicU32::new(0),
            gate_waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to mark a chat iteration in-flight. Returns `false` (and
    /// does not mark) if one is already running.
    pub fn try_begin_chat_iteration(&self) -> bool {
        self.chat_inflight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_chat_iteration(&self) {
        self.chat_inflight.store(false, Ordering::Release);
    }

    pub fn next_iteration(&self) -> u32 {
        self.iteration_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Register a one-shot waiter for a gate request, returning the
    /// receiver half for the caller to await.
    pub async fn register_gate_waiter(&self, task_id: String) -> oneshot::Receiver<GateResolution> {
        let (tx, rx) = oneshot::channel();
        self.gate_waiters.lock().await.insert(task_id, tx);
        rx
    }

    /// Resolve a pending gate waiter. Returns `false` if no waiter was
    /// registered for this task id (already resolved, or never requested).
    pub async fn resolve_gate(&self, task_id: &str, resolution: GateResolution) -> bool {
        if let Some(tx) = self.gate_waiters.lock().await.remove(task_id) {
            tx.send(resolution).is_ok()
        } else {
            false
        }
    }
}

impl Default for ActiveContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide engine: every registry the core touches.
pub struct Engine {
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<Session>>>>,
    task_to_session: RwLock<HashMap<String, Uuid>>,
    workspace_locks: RwLock<HashMap<PathBuf, Uuid>>,
    active_contexts: RwLock<HashMap<Uuid, Arc<ActiveContext>>>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            task_to_session: RwLock::new(HashMap::new()),
            workspace_locks: RwLock::new(HashMap::new()),
            active_contexts: RwLock::new(HashMap::new()),
        }
    }

    // -- Sessions --------------------------------------------------------

    pub async fn insert_session(&self, session: Session) -> Arc<Mutex<Session>> {
        let id = session.id;
        let handle = Arc::new(Mutex::new(session));
        self.sessions.write().await.insert(id, Arc::clone(&handle));
        self.active_contexts
            .write()
            .await
            .insert(id, Arc::new(ActiveContext::new()));
        handle
    }

    pub async fn get_session(&self, id: Uuid) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn list_session_ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Remove a session and everything it indexed (pruner, spec "Lifecycles").
    pub async fn remove_session(&self, id: Uuid) -> Option<Arc<Mutex<Session>>> {
        let removed = self.sessions.write().await.remove(&id);
        self.active_contexts.write().await.remove(&id);
        self.task_to_session
            .write()
            .await
            .retain(|_, owner| *owner != id);
        removed
    }

    // -- Task -> session index -------------------------------------------

    pub async fn index_task(&self, task_id: impl Into<String>, session_id: Uuid) {
        self.task_to_session.write().await.insert(task_id.into(), session_id);
    }

    pub async fn session_for_task(&self, task_id: &str) -> Option<Uuid> {
        self.task_to_session.read().await.get(task_id).copied()
    }

    // -- Workspace locks (invariant 5 / P6: one non-finalized session per dir) --

    /// Acquire the advisory lock on `work_dir` for `session_id`. Fails if
    /// another session already holds it.
    pub async fn acquire_workspace_lock(&self, work_dir: &Path, session_id: Uuid) -> Result<(), EngineError> {
        let mut locks = self.workspace_locks.write().await;
        if let Some(&holder) = locks.get(work_dir) {
            if holder != session_id {
                return Err(EngineError::WorkspaceLocked {
                    path: work_dir.to_path_buf(),
                    holder,
                });
            }
            return Ok(());
        }
        locks.insert(work_dir.to_path_buf(), session_id);
        Ok(())
    }

    /// Release the lock on `work_dir`. A no-op if `session_id` is not the
    /// current holder (spec §5 "Shared-resource policy").
    pub async fn release_workspace_lock(&self, work_dir: &Path, session_id: Uuid) {
        let mut locks = self.workspace_locks.write().await;
        if locks.get(work_dir) == Some(&session_id) {
            locks.remove(work_dir);
        }
    }

    pub async fn workspace_lock_holder(&self, work_dir: &Path) -> Option<Uuid> {
        self.workspace_locks.read().await.get(work_dir).copied()
    }

    // -- Active contexts (chat/gate routing) ------------------------------

    pub async fn active_context(&self, session_id: Uuid) -> Option<Arc<ActiveContext>> {
        self.active_contexts.read().await.get(&session_id).cloned()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn workspace_lock_is_exclusive() {
        let engine = Engine::new();
        let dir = PathBuf::from("/tmp/work");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        engine.acquire_workspace_lock(&dir, a).await.unwrap();
        let err = engine.acquire_workspace_lock(&dir, b).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkspaceLocked { holder, .. } if holder == a));

        // Re-acquiring with the same holder is fine (idempotent).
        engine.acquire_workspace_lock(&dir, a).await.unwrap();
    }

    #[tokio::test]
    async fn release_is_noop_for_non_holder() {
        let engine = Engine::new();
        let dir = PathBuf::from("/tmp/work");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        engine.acquire_workspace_lock(&dir, a).await.unwrap();
        engine.release_workspace_lock(&dir, b).await;
        assert_eq!(engine.workspace_lock_holder(&dir).await, Some(a));

        engine.release_workspace_lock(&dir, a).await;
        assert_eq!(engine.workspace_lock_holder(&dir).await, None);
    }

    #[tokio::test]
    async fn task_to_session_index_round_trips() {
        let engine = Engine::new();
        let sid = Uuid::new_v4();
        engine.index_task("task-1", sid).await;
        assert_eq!(engine.session_for_task("task-1").await, Some(sid));
        assert_eq!(engine.session_for_task("unknown").await, None);
    }

    #[tokio::test]
    async fn remove_session_deindexes_its_tasks() {
        let engine = Engine::new();
        let session = Session::new(Uuid::new_v4(), "proj", "prompt", PathBuf::from("/tmp"));
        let sid = session.id;
        engine.insert_session(session).await;
        engine.index_task("t1", sid).await;

        engine.remove_session(sid).await;
        assert_eq!(engine.session_for_task("t1").await, None);
        assert!(engine.get_session(sid).await.is_none());
        assert!(engine.active_context(sid).await.is_none());
    }

    #[tokio::test]
    async fn gate_waiter_resolves() {
        let ctx = ActiveContext::new();
        let rx = ctx.register_gate_waiter("t1".to_string()).await;
        assert!(ctx.resolve_gate("t1", GateResolution { approved: true, feedback: None }).await);
        let resolution = rx.await.unwrap();
        assert!(resolution.approved);
    }

    #[tokio::test]
    async fn resolve_gate_missing_waiter_returns_false() {
        let ctx = ActiveContext::new();
        assert!(!ctx.resolve_gate("nope", GateResolution { approved: true, feedback: None }).await);
    }

    #[test]
    fn chat_iteration_guard_is_exclusive() {
        let ctx = ActiveContext::new();
        assert!(ctx.try_begin_chat_iteration());
        assert!(!ctx.try_begin_chat_iteration());
        ctx.end_chat_iteration();
        assert!(ctx.try_begin_chat_iteration());
    }
}
