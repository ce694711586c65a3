//! Shared domain types. Semantic shapes, not wire formats -- handlers and
//! stores both build on these.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Level of human confirmation a user wants before a tool call executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlLevel {
    Autonomous,
    Cautious,
    Standard,
    Paranoid,
}

impl Default for HitlLevel {
    fn default() -> Self {
        HitlLevel::Cautious
    }
}

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

/// Inbound request body for the chat endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// Inbound request body for `/agent-api/chat/resume`: `{resumeToken,
/// confirmed}`. `confirmed: false` drops the gated call without ever
/// touching the HITL engine -- see `handlers::resume::resume`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub resume_token: String,
    pub confirmed: bool,
}

/// An opaque conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One immutable message appended to a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub session_id: String,
    pub stage: String,
    pub role: MessageRole,
    pub content: String,
    pub agent_id: Option<String>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    /// `role="system", content="[COMPLETE]"` marks a session as terminated.
    pub fn is_completion_marker(&self) -> bool {
        matches!(self.role, MessageRole::System) && self.content == "[COMPLETE]"
    }
}

/// A stored system prompt revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    pub id: i64,
    pub version: String,
    pub content: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Per-user saved preferences, gated by scoped-config permission flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: String,
    pub model: Option<String>,
    pub hitl_level: Option<HitlLevel>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Tool allowlist on an agent: either everything, or an explicit set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolAllowlist {
    All(AllMarker),
    Named(Vec<String>),
}

/// Marker type so `ToolAllowlist::All` can only ever deserialize from the
/// literal string `"*"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AllMarker;

impl TryFrom<String> for AllMarker {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == "*" {
            Ok(AllMarker)
        } else {
            Err("not a wildcard allowlist".to_string())
        }
    }
}

impl From<AllMarker> for String {
    fn from(_: AllMarker) -> Self {
        "*".to_string()
    }
}

impl ToolAllowlist {
    /// Parse the stored allowlist column: either the literal string `"*"`
    /// or a JSON-encoded array of tool names. A malformed allowlist yields
    /// an empty, explicit list -- "no tools visible" per spec, not an error.
    pub fn parse(raw: &str) -> ToolAllowlist {
        if raw == "*" {
            return ToolAllowlist::All(AllMarker);
        }
        match serde_json::from_str::<Vec<String>>(raw) {
            Ok(names) => ToolAllowlist::Named(names),
            Err(_) => ToolAllowlist::Named(Vec::new()),
        }
    }

    pub fn allows(&self, tool_name: &str) -> bool {
        match self {
            ToolAllowlist::All(_) => true,
            ToolAllowlist::Named(names) => names.iter().any(|n| n == tool_name),
        }
    }
}

/// A named agent profile: model, HITL policy, prompt, caps, tool allowlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub display_name: String,
    pub system_prompt: Option<String>,
    pub default_model: Option<String>,
    pub default_hitl_level: HitlLevel,
    pub allow_user_model_select: bool,
    pub allow_user_hitl_config: bool,
    pub tool_allowlist_raw: String,
    pub max_turns: u32,
    pub max_tokens: u32,
    pub is_default: bool,
    pub enabled: bool,
    pub seeded_from_config: bool,
}

impl Agent {
    pub fn tool_allowlist(&self) -> ToolAllowlist {
        ToolAllowlist::parse(&self.tool_allowlist_raw)
    }
}

/// Lifecycle of a tool within the promoted-tool registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolLifecycle {
    Candidate,
    Promoted,
    Flagged,
    Retired,
}

/// HTTP routing metadata for a tool backed by an MCP-style endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpRouting {
    pub endpoint: String,
    pub method: String,
}

/// One input field of a tool's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProperty {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

/// A tool's static description, as presented to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: HashMap<String, ToolProperty>,
    pub mcp_routing: Option<McpRouting>,
    pub requires_confirmation: bool,
    pub lifecycle: ToolLifecycle,
}

impl ToolSpec {
    /// GET unless `mcp_routing` names something else -- used by the
    /// `standard` HITL policy, which gates mutating methods.
    pub fn http_method(&self) -> &str {
        self.mcp_routing
            .as_ref()
            .map(|r| r.method.as_str())
            .unwrap_or("GET")
    }
}

/// State captured when a tool call is gated on human confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PausedHitlState {
    pub session_id: String,
    pub agent_id: Option<String>,
    pub user_id: String,
    pub pending_tool_calls: Vec<PendingToolCall>,
    pub conversation_messages: Vec<ConversationMessage>,
    pub turn_index: u32,
    pub tool_name: String,
    pub args: serde_json::Value,
}

/// One outstanding tool-use block a provider emitted, threaded with its
/// provider-specific id for conversation-history reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Outcome severity lattice for verifiers: `pass < warn < block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierOutcome {
    Pass,
    Warn,
    Block,
}

/// A single verifier's post-tool-call evaluation, persisted when non-pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierResult {
    pub session_id: String,
    pub tool_name: String,
    pub verifier_name: String,
    pub outcome: VerifierOutcome,
    pub message: String,
    pub input: Option<String>,
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One best-effort audit row per terminated chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatAuditRow {
    pub session_id: Option<String>,
    pub user_id: String,
    pub agent_id: Option<String>,
    pub route: String,
    pub status_code: u16,
    pub duration_ms: u64,
    pub model: Option<String>,
    pub message_preview: String,
    pub tool_count: u32,
    pub hitl_triggered: bool,
    pub warnings_count: u32,
    pub error_message: Option<String>,
}

impl ChatAuditRow {
    pub const PREVIEW_LIMIT: usize = 500;

    pub fn truncate_preview(message: &str) -> String {
        if message.chars().count() <= Self::PREVIEW_LIMIT {
            message.to_string()
        } else {
            message.chars().take(Self::PREVIEW_LIMIT).collect()
        }
    }
}
