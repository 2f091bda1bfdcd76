//! Graceful shutdown: warn observers, checkpoint every running session,
//! cancel its active context, then kill every tracked agent process tree
//! within a bounded grace period (spec §4.7 "Shutdown sequence").

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use haivemind_state::models::SessionStatus;
use haivemind_state::{Engine, Protocol};

use crate::agent::AgentManager;
use crate::broadcast::Broadcaster;
use crate::snapshot::{self, Checkpoint};

/// Upper bound on how long shutdown waits for agent process trees to
/// exit on their own before the process itself exits anyway.
const SHUTDOWN_AGENT_GRACE: Duration = Duration::from_secs(9);

/// Drive the process through an orderly shutdown. Safe to call once, at
/// the point a SIGTERM/ctrl-c is observed, before the process exits.
pub async fn graceful_shutdown(engine: &Engine, broadcaster: &Broadcaster, agent_managers: Vec<Arc<AgentManager>>) {
    broadcaster
        .broadcast_global(Protocol::ShutdownWarning(json!({
            "message": "process is shutting down",
        })))
        .await;

    for session_id in engine.list_session_ids().await {
        let Some(session_arc) = engine.get_session(session_id).await else { continue; };
        let mut session = session_arc.lock().await;
        if session.status != SessionStatus::Running {
            continue;
        }

        session.status = SessionStatus::Interrupted;
        let checkpoint = Checkpoint::from_session(&session);
        if let Err(err) = snapshot::write_checkpoint(&session.work_dir, &checkpoint) {
            warn!(%session_id, %err, "failed to write shutdown checkpoint");
        }
        let project_slug = session.project_slug.clone();
        drop(session);

        if let Some(ctx) = engine.active_context(session_id).await {
            ctx.cancel.cancel();
        }
        broadcaster
            .broadcast(Protocol::SessionInterrupted(json!({
                "sessionId": session_id.to_string(),
                "projectSlug": project_slug,
                "reason": "shutdown",
                "ts": Utc::now(),
            })))
            .await;
    }

    let kills = agent_managers.iter().map(|m| m.kill_all());
    if tokio::time::timeout(SHUTDOWN_AGENT_GRACE, futures::future::join_all(kills)).await.is_err() {
        warn!("timed out waiting for agent processes to exit during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haivemind_state::models::Session;
    use uuid::Uuid;

    #[tokio::test]
    async fn running_session_is_checkpointed_and_interrupted() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Engine::new();
        let mut session = Session::new(Uuid::new_v4(), "proj", "prompt", tmp.path().to_path_buf());
        session.status = SessionStatus::Running;
        let session_id = session.id;
        engine.insert_session(session).await;

        let broadcaster = Broadcaster::new(Arc::new(Engine::new()));
        graceful_shutdown(&engine, &broadcaster, vec![]).await;

        let session_arc = engine.get_session(session_id).await.unwrap();
        let session = session_arc.lock().await;
        assert_eq!(session.status, SessionStatus::Interrupted);

        let checkpoint_path = tmp
            .path()
            .join(".haivemind")
            .join("checkpoints")
            .join(format!("{session_id}.json"));
        assert!(checkpoint_path.exists());
    }

    #[tokio::test]
    async fn non_running_session_is_left_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Engine::new();
        let mut session = Session::new(Uuid::new_v4(), "proj", "prompt", tmp.path().to_path_buf());
        session.status = SessionStatus::Completed;
        let session_id = session.id;
        engine.insert_session(session).await;

        let broadcaster = Broadcaster::new(Arc::new(Engine::new()));
        graceful_shutdown(&engine, &broadcaster, vec![]).await;

        let session_arc = engine.get_session(session_id).await.unwrap();
        assert_eq!(session_arc.lock().await.status, SessionStatus::Completed);

        let checkpoint_path = tmp
            .path()
            .join(".haivemind")
            .join("checkpoints")
            .join(format!("{session_id}.json"));
        assert!(!checkpoint_path.exists());
    }
}
