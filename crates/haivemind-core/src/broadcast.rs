//! The broadcast plane: single-writer fan-out to observers with
//! per-observer project-scope filtering, and timeline recording for the
//! owning session. Spec §4.7.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use haivemind_state::models::Session;
use haivemind_state::{Engine, Protocol};

/// Message types whose transitions get recorded into the owning session's
/// timeline (spec §4.7).
const TIMELINE_RECORDED_TYPES: [&str; 3] = ["TASK_STATUS", "AGENT_STATUS", "VERIFICATION_STATUS"];

/// A connected observer: an outgoing channel plus its project subscriptions.
///
/// An empty subscription set means "subscribed to everything" (spec §4.7:
/// "if it has any subscriptions and the resolved slug is not among them,
/// skip").
struct Observer {
    sender: mpsc::UnboundedSender<Protocol>,
    subscriptions: Mutex<HashSet<String>>,
}

/// Fan-out hub. Cheap to clone (wraps `Arc` internals); share one instance
/// across the engine.
#[derive(Clone)]
pub struct Broadcaster {
    engine: Arc<Engine>,
    observers: Arc<RwLock<HashMap<Uuid, Arc<Observer>>>>,
}

impl Broadcaster {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            observers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new observer and return its id plus the receiving half
    /// of its outgoing channel.
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<Protocol>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Arc::new(Observer {
            sender: tx,
            subscriptions: Mutex::new(HashSet::new()),
        });
        self.observers.write().await.insert(id, observer);
        (id, rx)
    }

    pub async fn unregister(&self, id: Uuid) {
        self.observers.write().await.remove(&id);
    }

    pub async fn subscribe(&self, id: Uuid, project_slug: impl Into<String>) {
        if let Some(observer) = self.observers.read().await.get(&id) {
            observer.subscriptions.lock().await.insert(project_slug.into());
        }
    }

    pub async fn unsubscribe(&self, id: Uuid, project_slug: &str) {
        if let Some(observer) = self.observers.read().await.get(&id) {
            observer.subscriptions.lock().await.remove(project_slug);
        }
    }

    /// Broadcast a message, recording it into the owning session's
    /// timeline (if applicable) and fanning it out to subscribed
    /// observers only.
    pub async fn broadcast(&self, msg: Protocol) {
        let session = self.resolve_session(&msg).await;

        if TIMELINE_RECORDED_TYPES.contains(&msg.type_tag()) {
            if let Some(session) = &session {
                let mut guard = session.lock().await;
                guard.record_event(msg.type_tag(), msg.payload().clone());
            }
        }

        let project_slug = match msg.project_slug() {
            Some(slug) => Some(slug.to_string()),
            None => {
                if let Some(session) = &session {
                    Some(session.lock().await.project_slug.clone())
                } else {
                    None
                }
            }
        };

        self.fan_out(msg, project_slug.as_deref(), false).await;
    }

    /// Broadcast to every observer regardless of subscriptions (used for
    /// shutdown warnings).
    pub async fn broadcast_global(&self, msg: Protocol) {
        self.fan_out(msg, None, true).await;
    }

    async fn resolve_session(&self, msg: &Protocol) -> Option<Arc<Mutex<Session>>> {
        if let Some(sid) = msg.session_id() {
            if let Ok(uuid) = Uuid::parse_str(sid) {
                if let Some(session) = self.engine.get_session(uuid).await {
                    return Some(session);
                }
            }
        }
        if let Some(tid) = msg.task_id() {
            if let Some(sid) = self.engine.session_for_task(tid).await {
                return self.engine.get_session(sid).await;
            }
        }
        None
    }

    async fn fan_out(&self, msg: Protocol, project_slug: Option<&str>, global: bool) {
        let observers = self.observers.read().await;
        for observer in observers.values() {
            if !global {
                let subs = observer.subscriptions.lock().await;
                if !subs.is_empty() {
                    match project_slug {
                        Some(slug) if subs.contains(slug) => {}
                        _ => continue,
                    }
                }
            }
            // Unbounded send never blocks the broadcast path; a dropped
            // receiver (closed socket) just means the send silently fails.
            let _ = observer.sender.send(msg.clone());
        }
    }
}
