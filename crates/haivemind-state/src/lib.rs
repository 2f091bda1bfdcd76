//! Data model and process-wide registries for the hAIvemind engine.
//!
//! This crate holds no business logic beyond invariant-preserving
//! accessors; the Task Runner, Session Orchestrator, and Broadcast plane
//! in `haivemind-core` are the ones that act on it.

pub mod engine;
pub mod models;
pub mod protocol;

pub use engine::{ActiveContext, Engine, EngineError, GateResolution};
pub use protocol::Protocol;
