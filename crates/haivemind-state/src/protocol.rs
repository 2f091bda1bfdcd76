//! The observer-stream protocol: a closed enum of message types plus a
//! typed envelope, serialized as UTF-8 JSON. See spec §4.1.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message sent or received over the observer duplex channel.
///
/// Serializes as `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Protocol {
    // -- Session lifecycle --------------------------------------------
    #[serde(rename = "SESSION_START")]
    SessionStart(Value),
    #[serde(rename = "SESSION_COMPLETE")]
    SessionComplete(Value),
    #[serde(rename = "SESSION_ERROR")]
    SessionError(Value),
    #[serde(rename = "SESSION_WARNING")]
    SessionWarning(Value),
    #[serde(rename = "SHUTDOWN_WARNING")]
    ShutdownWarning(Value),
    #[serde(rename = "SESSION_INTERRUPTED")]
    SessionInterrupted(Value),
    #[serde(rename = "SESSION_RESUMED")]
    SessionResumed(Value),

    // -- Planning --------------------------------------------------------
    #[serde(rename = "PLAN_CREATED")]
    PlanCreated(Value),
    #[serde(rename = "PLAN_RESEARCH")]
    PlanResearch(Value),

    // -- Execution ---------------------------------------------------------
    #[serde(rename = "TASK_STATUS")]
    TaskStatus(Value),
    #[serde(rename = "AGENT_STATUS")]
    AgentStatus(Value),
    #[serde(rename = "AGENT_OUTPUT")]
    AgentOutput(Value),
    #[serde(rename = "AGENT_STREAM")]
    AgentStream(Value),

    // -- Verification --------------------------------------------------
    #[serde(rename = "VERIFICATION_STATUS")]
    VerificationStatus(Value),

    // -- Chat --------------------------------------------------------------
    #[serde(rename = "CHAT_MESSAGE")]
    ChatMessage(Value),
    #[serde(rename = "CHAT_RESPONSE")]
    ChatResponse(Value),
    #[serde(rename = "ITERATION_START")]
    IterationStart(Value),
    #[serde(rename = "ITERATION_COMPLETE")]
    IterationComplete(Value),
    #[serde(rename = "RECONNECT_SYNC")]
    ReconnectSync(Value),

    // -- Human gate ----------------------------------------------------
    #[serde(rename = "GATE_REQUEST")]
    GateRequest(Value),
    #[serde(rename = "GATE_RESPONSE")]
    GateResponse(Value),

    // -- Swarm ---------------------------------------------------------
    #[serde(rename = "DAG_REWRITE")]
    DagRewrite(Value),
    #[serde(rename = "SWARM_WAVE")]
    SwarmWave(Value),
    #[serde(rename = "SWARM_SCALING")]
    SwarmScaling(Value),
    #[serde(rename = "TASK_SPLIT")]
    TaskSplit(Value),
    #[serde(rename = "SPECULATIVE_START")]
    SpeculativeStart(Value),

    // -- Subscriptions -----------------------------------------------------
    #[serde(rename = "WS_SUBSCRIBE")]
    WsSubscribe(Value),
    #[serde(rename = "WS_UNSUBSCRIBE")]
    WsUnsubscribe(Value),
}

impl Protocol {
    /// The message type tag, e.g. `"TASK_STATUS"`.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Protocol::SessionStart(_) => "SESSION_START",
            Protocol::SessionComplete(_) => "SESSION_COMPLETE",
            Protocol::SessionError(_) => "SESSION_ERROR",
            Protocol::SessionWarning(_) => "SESSION_WARNING",
            Protocol::ShutdownWarning(_) => "SHUTDOWN_WARNING",
            Protocol::SessionInterrupted(_) => "SESSION_INTERRUPTED",
            Protocol::SessionResumed(_) => "SESSION_RESUMED",
            Protocol::PlanCreated(_) => "PLAN_CREATED",
            Protocol::PlanResearch(_) => "PLAN_RESEARCH",
            Protocol::TaskStatus(_) => "TASK_STATUS",
            Protocol::AgentStatus(_) => "AGENT_STATUS",
            Protocol::AgentOutput(_) => "AGENT_OUTPUT",
            Protocol::AgentStream(_) => "AGENT_STREAM",
            Protocol::VerificationStatus(_) => "VERIFICATION_STATUS",
            Protocol::ChatMessage(_) => "CHAT_MESSAGE",
            Protocol::ChatResponse(_) => "CHAT_RESPONSE",
            Protocol::IterationStart(_) => "ITERATION_START",
            Protocol::IterationComplete(_) => "ITERATION_COMPLETE",
            Protocol::ReconnectSync(_) => "RECONNECT_SYNC",
            Protocol::GateRequest(_) => "GATE_REQUEST",
            Protocol::GateResponse(_) => "GATE_RESPONSE",
            Protocol::DagRewrite(_) => "DAG_REWRITE",
            Protocol::SwarmWave(_) => "SWARM_WAVE",
            Protocol::SwarmScaling(_) => "SWARM_SCALING",
            Protocol::TaskSplit(_) => "TASK_SPLIT",
            Protocol::SpeculativeStart(_) => "SPECULATIVE_START",
            Protocol::WsSubscribe(_) => "WS_SUBSCRIBE",
            Protocol::WsUnsubscribe(_) => "WS_UNSUBSCRIBE",
        }
    }

    /// The payload value, regardless of variant.
    pub fn payload(&self) -> &Value {
        match self {
            Protocol::SessionStart(v)
            | Protocol::SessionComplete(v)
            | Protocol::SessionError(v)
            | Protocol::SessionWarning(v)
            | Protocol::ShutdownWarning(v)
            | Protocol::SessionInterrupted(v)
            | Protocol::SessionResumed(v)
            | Protocol::PlanCreated(v)
            | Protocol::PlanResearch(v)
            | Protocol::TaskStatus(v)
            | Protocol::AgentStatus(v)
            | Protocol::AgentOutput(v)
            | Protocol::AgentStream(v)
            | Protocol::VerificationStatus(v)
            | Protocol::ChatMessage(v)
            | Protocol::ChatResponse(v)
            | Protocol::IterationStart(v)
            | Protocol::IterationComplete(v)
            | Protocol::ReconnectSync(v)
            | Protocol::GateRequest(v)
            | Protocol::GateResponse(v)
            | Protocol::DagRewrite(v)
            | Protocol::SwarmWave(v)
            | Protocol::SwarmScaling(v)
            | Protocol::TaskSplit(v)
            | Protocol::SpeculativeStart(v)
            | Protocol::WsSubscribe(v)
            | Protocol::WsUnsubscribe(v) => v,
        }
    }

    /// The project slug this message is scoped to, if it carries one
    /// directly in its payload (used by the broadcast plane before it
    /// falls back to task→session resolution).
    pub fn project_slug(&self) -> Option<&str> {
        self.payload().get("projectSlug").and_then(Value::as_str)
    }

    /// The session id this message is scoped to, if present in its payload.
    pub fn session_id(&self) -> Option<&str> {
        self.payload().get("sessionId").and_then(Value::as_str)
    }

    /// The task id this message is scoped to, if present in its payload.
    pub fn task_id(&self) -> Option<&str> {
        self.payload().get("taskId").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let msg = Protocol::TaskStatus(serde_json::json!({"taskId": "a", "status": "running"}));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"TASK_STATUS\""));
        let parsed: Protocol = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.type_tag(), "TASK_STATUS");
        assert_eq!(parsed.task_id(), Some("a"));
    }

    #[test]
    fn project_slug_extracted_from_payload() {
        let msg = Protocol::SessionStart(serde_json::json!({"projectSlug": "demo"}));
        assert_eq!(msg.project_slug(), Some("demo"));
    }
}
