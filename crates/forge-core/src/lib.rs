//! Orchestration core for the Forge agent runtime sidecar.
//!
//! Each module owns one concern from the component list: request auth,
//! rate limiting, the HITL pause/resume engine, the post-tool verifier
//! pipeline, the ReAct loop itself, the storage traits, preference
//! resolution, the runtime config overlay, and audit logging. `forge-service`
//! wires these into HTTP handlers; nothing in this crate depends on axum.

pub mod audit;
pub mod auth;
pub mod config;
pub mod domain;
pub mod error;
pub mod hitl;
pub mod preferences;
pub mod rate_limit;
pub mod react;
pub mod store;
pub mod verifier;

pub use error::{ForgeError, ForgeResult};

use std::sync::Arc;

use crate::audit::AuditSink;
use crate::auth::{AdminAuthenticator, Authenticator};
use crate::config::ConfigHandle;
use crate::hitl::HitlEngine;
use crate::rate_limit::RateLimiter;
use crate::react::{LlmTurn, ToolDispatcher};
use crate::store::{AgentStore, ConversationStore, PreferencesStore, PromptStore, ToolStore};
use crate::verifier::VerifierRunner;

/// Every collaborator a chat handler needs, held flat (no component holds
/// a reference back to this struct) so there is no cycle to reason about
/// when something is swapped out in tests.
pub struct AppState {
    pub authenticator: Arc<dyn Authenticator>,
    pub admin_authenticator: AdminAuthenticator,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub hitl_engine: Option<Arc<HitlEngine>>,
    pub verifier_runner: Arc<VerifierRunner>,
    pub llm_turn: Arc<dyn LlmTurn>,
    pub tool_dispatcher: Arc<dyn ToolDispatcher>,
    pub conversation_store: Arc<dyn ConversationStore>,
    pub prompt_store: Arc<dyn PromptStore>,
    pub agent_store: Arc<dyn AgentStore>,
    pub tool_store: Arc<dyn ToolStore>,
    pub preferences_store: Arc<dyn PreferencesStore>,
    pub audit_sink: Arc<dyn AuditSink>,
    pub config: Arc<ConfigHandle>,
    pub config_path: Option<std::path::PathBuf>,
}
