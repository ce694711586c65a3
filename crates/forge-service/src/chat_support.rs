//! Shared machinery behind `/agent-api/chat`, `/agent-api/chat-sync` and
//! `/agent-api/chat/resume`. The three handlers drive the same
//! `forge_core::react::run` loop and differ only in where its events go
//! (the `EventSink` seam) and how the turn's starting messages were
//! assembled; everything else -- agent resolution, scoped config, effective
//! settings, system prompt precedence, session bookkeeping, and draining the
//! loop itself -- lives here.

use std::sync::Arc;

use chrono::Utc;
use forge_core::config::ScopedConfig;
use forge_core::domain::{
    Agent, ChatAuditRow, ConversationMessage, HitlLevel, MessageRole, PausedHitlState, Session, ToolSpec,
};
use forge_core::preferences::{EffectiveSettings, PreferenceResolver};
use forge_core::react::{HitlPause, LlmTurnRequest, ReactEvent, ReactLoopInputs, TurnMessage, Usage};
use forge_core::store::tools::filter_by_allowlist;
use forge_core::{AppState, ForgeError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error_response::ApiError;
use crate::sink::EventSink;

/// One request's worth of resolved settings: which agent (if any), its
/// scoped config, the model/HITL/provider/api-key a user's preferences
/// actually land on, the system prompt, and the tools visible to the loop.
pub struct ResolvedTurn {
    pub agent: Option<Agent>,
    pub scoped: ScopedConfig,
    pub effective: EffectiveSettings,
    pub system_prompt: String,
    pub tools: Vec<ToolSpec>,
}

/// spec.md §4.7.a steps 4-10: resolve the agent, build its scoped config,
/// resolve the model/HITL level a user's saved preferences actually apply
/// (gated by the agent's `allow_user_*` flags), fail if the resolved
/// provider has no API key configured, resolve the system prompt under its
/// precedence chain, and load the tools this turn may call.
pub async fn resolve_turn(state: &AppState, user_id: &str, agent_id: Option<&str>) -> Result<ResolvedTurn, ApiError> {
    let agent = match agent_id {
        Some(id) => Some(
            state
                .agent_store
                .get(id)
                .await
                .filter(|a| a.enabled)
                .ok_or_else(|| ForgeError::NotFound { reason: format!("agent not found: {id}") })?,
        ),
        None => state.agent_store.get_default().await,
    };

    let overlay = state.config.current();
    let scoped = ScopedConfig::build(&overlay, agent.as_ref());

    let preferences = state
        .preferences_store
        .get(user_id)
        .await
        .map_err(ForgeError::internal)?;

    let effective = PreferenceResolver::resolve_effective(agent.as_ref(), preferences.as_ref(), &scoped.default_model, |name| {
        std::env::var(name).ok()
    });

    if effective.api_key.is_none() {
        return Err(ForgeError::ProviderMisconfigured { provider: effective.provider.as_str().to_string() }.into());
    }

    // Precedence: the agent's own prompt, then the active stored prompt
    // version, then the config-level fallback, then a hardcoded default.
    // Distinct from (and narrower than) `ScopedConfig::system_prompt`, which
    // only merges the agent with the config fallback -- the stored active
    // prompt sits between those two in this chain.
    let system_prompt = if let Some(prompt) = agent.as_ref().and_then(|a| a.system_prompt.clone()) {
        prompt
    } else if let Some(active) = state.prompt_store.get_active().await.map_err(ForgeError::internal)? {
        active.content
    } else if let Some(configured) = overlay.system_prompt.clone() {
        configured
    } else {
        "You are a helpful assistant.".to_string()
    };

    let promoted = state.tool_store.list_promoted().await;
    let tools = match &agent {
        Some(a) => filter_by_allowlist(promoted, &a.tool_allowlist()),
        None => promoted,
    };

    Ok(ResolvedTurn { agent, scoped, effective, system_prompt, tools })
}

/// Loads or creates the session this message belongs to, enforcing sticky
/// ownership: a session id supplied by someone other than its owner is
/// forbidden, not silently reassigned.
pub async fn ensure_session(
    state: &AppState,
    session_id: Option<String>,
    user_id: &str,
    agent_id: Option<&str>,
) -> Result<String, ApiError> {
    let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let owner = state
        .conversation_store
        .get_session_user_id(&id)
        .await
        .map_err(|e| ApiError::from(ForgeError::internal(e)))?;
    match owner {
        Some(existing) if existing == user_id => Ok(id),
        Some(_) => Err(ForgeError::Forbidden.into()),
        None => {
            let session = Session {
                id: id.clone(),
                user_id: user_id.to_string(),
                agent_id: agent_id.map(str::to_string),
                created_at: Utc::now(),
            };
            state
                .conversation_store
                .create_session(session)
                .await
                .map_err(|e| ApiError::from(ForgeError::internal(e)))?;
            Ok(id)
        }
    }
}

/// Appends one message to the session, logging (not failing the request)
/// on a storage error -- persistence here is best-effort follow-through on
/// an already-committed turn, not a precondition for serving it.
pub async fn persist_turn_message(
    state: &AppState,
    session_id: &str,
    user_id: &str,
    agent_id: Option<&str>,
    role: MessageRole,
    content: &str,
) {
    let message = ConversationMessage {
        session_id: session_id.to_string(),
        stage: "turn".to_string(),
        role,
        content: content.to_string(),
        agent_id: agent_id.map(str::to_string),
        user_id: user_id.to_string(),
        created_at: Utc::now(),
    };
    if let Err(e) = state.conversation_store.persist_message(message).await {
        tracing::warn!(error = %e, session_id, "failed to persist conversation message");
    }
}

/// Prior `user`/`assistant` history translated to provider-agnostic
/// messages. Tool turns are not replayed -- they are ephemeral to the turn
/// that produced them.
pub fn build_history_messages(history: &[ConversationMessage]) -> Vec<TurnMessage> {
    history
        .iter()
        .filter_map(|m| match m.role {
            MessageRole::User => Some(TurnMessage::User { content: m.content.clone() }),
            MessageRole::Assistant => Some(TurnMessage::Assistant { content: m.content.clone() }),
            MessageRole::Tool | MessageRole::System => None,
        })
        .collect()
}

/// Builds the provider-agnostic message list for a fresh turn: `history`
/// followed by the new user message.
pub fn build_turn_messages(history: &[ConversationMessage], user_message: &str) -> Vec<TurnMessage> {
    let mut messages = build_history_messages(history);
    messages.push(TurnMessage::User { content: user_message.to_string() });
    messages
}

pub fn build_request_template(resolved: &ResolvedTurn, messages: Vec<TurnMessage>) -> LlmTurnRequest {
    LlmTurnRequest {
        provider: resolved.effective.provider.as_str().to_string(),
        api_key: resolved.effective.api_key.clone().expect("resolve_turn checked this is Some"),
        model: resolved.effective.model.clone(),
        system: resolved.system_prompt.clone(),
        messages,
        tools: resolved.tools.clone(),
        max_tokens: resolved.scoped.max_tokens,
    }
}

/// The running loop's event stream plus the cancellation token that stops
/// it early -- held by the handler so a client disconnect can be turned
/// into prompt cooperative cancellation instead of an orphaned task.
pub struct SpawnedTurn {
    pub events: mpsc::Receiver<ReactEvent>,
    pub cancel: CancellationToken,
}

/// Spawns `react::run` as its own task, reusing an event sender a caller
/// may already be draining (the resume handler's manual re-dispatch of a
/// confirmed tool call shares its channel with the continuation run this
/// starts). Returns the `CancellationToken` the caller holds to stop it.
pub fn spawn_turn_with_sender(
    state: &AppState,
    request_template: LlmTurnRequest,
    max_turns: u32,
    hitl_level: HitlLevel,
    session_id: String,
    agent_id: Option<String>,
    user_id: String,
    tx: mpsc::Sender<ReactEvent>,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    let inputs = ReactLoopInputs {
        request_template,
        max_turns,
        hitl_level,
        session_id,
        agent_id,
        user_id,
    };
    let llm = Arc::clone(&state.llm_turn);
    let dispatcher = Arc::clone(&state.tool_dispatcher);
    let verifier = Arc::clone(&state.verifier_runner);
    let cancel_task = cancel.clone();
    tokio::spawn(async move {
        forge_core::react::run(inputs, llm, dispatcher, verifier, tx, cancel_task).await;
    });
    cancel
}

/// Spawns `react::run` as its own task, started from `request_template`'s
/// own message list (a fresh turn's history+message) with a fresh channel.
pub fn spawn_turn(
    state: &AppState,
    request_template: LlmTurnRequest,
    resolved: &ResolvedTurn,
    session_id: String,
    user_id: String,
) -> SpawnedTurn {
    let (tx, rx) = mpsc::channel(64);
    let cancel = spawn_turn_with_sender(
        state,
        request_template,
        resolved.scoped.max_turns,
        resolved.effective.hitl_level,
        session_id,
        resolved.agent.as_ref().map(|a| a.id.clone()),
        user_id,
        tx,
    );
    SpawnedTurn { events: rx, cancel }
}

/// How a run of `drive_loop` ended.
pub enum DriveOutcome {
    Done { usage: Usage, exhausted: bool },
    /// Always carries a `resume_token`: the engine paused successfully.
    Paused(HitlPause),
    /// A pause was requested but no `HitlEngine` is configured, and the
    /// caller asked for this to surface as an HTTP-level failure rather
    /// than an in-stream error event.
    EngineMissing,
    Disconnected,
}

/// Asks the configured `HitlEngine` to store `pause`'s resumable state and
/// returns it decorated with the resulting token. Shared by `drive_loop`
/// and by `resume`'s manual re-dispatch of a confirmed tool call's
/// remaining siblings, which can itself hit a second pause.
pub async fn store_hitl_pause(
    state: &AppState,
    session_id: &str,
    user_id: &str,
    agent_id: Option<&str>,
    pause: &HitlPause,
) -> Result<HitlPause, String> {
    let engine = state.hitl_engine.as_ref().expect("caller checked hitl_engine is configured");
    let paused_state = PausedHitlState {
        session_id: session_id.to_string(),
        agent_id: agent_id.map(str::to_string),
        user_id: user_id.to_string(),
        pending_tool_calls: pause.pending_tool_calls.clone(),
        conversation_messages: pause.conversation_messages.clone(),
        turn_index: pause.turn_index,
        tool_name: pause.tool.clone(),
        args: pause.args.clone(),
    };
    match engine.pause(&paused_state).await {
        Ok(token) => Ok(HitlPause { resume_token: Some(token), ..pause.clone() }),
        Err(e) => {
            tracing::error!(error = %e, session_id, "failed to persist hitl pause state");
            Err("failed to persist pause state".to_string())
        }
    }
}

/// Drains `events` into `sink`, persisting the turn's assistant text at the
/// two points it becomes final (a pause, or the loop ending) and handling
/// the HITL pause handoff: asking the engine to store resumable state,
/// decorating the event with the resulting token, and forwarding that
/// decorated event on to the sink so SSE and buffered callers see the same
/// shape.
pub async fn drive_loop(
    mut events: mpsc::Receiver<ReactEvent>,
    sink: &mut dyn EventSink,
    state: &AppState,
    session_id: &str,
    user_id: &str,
    agent_id: Option<&str>,
    surface_missing_engine_as_stream_error: bool,
) -> DriveOutcome {
    let mut accumulator = String::new();

    while let Some(event) = events.recv().await {
        match &event {
            ReactEvent::TextDelta { content } => {
                accumulator.push_str(content);
                if !sink.forward(&event) {
                    return DriveOutcome::Disconnected;
                }
            }
            ReactEvent::Text { content } => {
                accumulator = content.clone();
                if !sink.forward(&event) {
                    return DriveOutcome::Disconnected;
                }
            }
            ReactEvent::Hitl(pause) => {
                if !accumulator.is_empty() {
                    persist_turn_message(state, session_id, user_id, agent_id, MessageRole::Assistant, &accumulator).await;
                }
                if state.hitl_engine.is_none() {
                    if surface_missing_engine_as_stream_error {
                        sink.forward(&ReactEvent::Error {
                            message: "hitl pause requested but no hitl engine is configured".to_string(),
                        });
                        let done = ReactEvent::Done { usage: Usage::default(), exhausted: false };
                        sink.forward(&done);
                        return DriveOutcome::Done { usage: Usage::default(), exhausted: false };
                    }
                    return DriveOutcome::EngineMissing;
                }
                match store_hitl_pause(state, session_id, user_id, agent_id, pause).await {
                    Ok(decorated) => {
                        sink.forward(&ReactEvent::Hitl(decorated.clone()));
                        return DriveOutcome::Paused(decorated);
                    }
                    Err(message) => {
                        sink.forward(&ReactEvent::Error { message });
                        return DriveOutcome::Disconnected;
                    }
                }
            }
            ReactEvent::Done { usage, exhausted } => {
                if !accumulator.is_empty() {
                    persist_turn_message(state, session_id, user_id, agent_id, MessageRole::Assistant, &accumulator).await;
                }
                sink.forward(&event);
                return DriveOutcome::Done { usage: usage.clone(), exhausted: *exhausted };
            }
            _ => {
                if !sink.forward(&event) {
                    return DriveOutcome::Disconnected;
                }
            }
        }
    }

    DriveOutcome::Disconnected
}

/// Records an audit row for a request that never got past auth or rate
/// limiting -- neither a session nor an agent nor a model was resolved yet,
/// so those columns are left empty. Keeps the "exactly once per terminated
/// request" invariant honest for the 401/429 paths, not just the ones that
/// make it into the spawned turn.
pub async fn record_rejected_request(state: &AppState, user_id: &str, route: &str, start: std::time::Instant, err: &ForgeError) {
    let row = new_audit_row(
        None,
        user_id,
        None,
        route,
        err.status_code(),
        start.elapsed().as_millis() as u64,
        None,
        "",
        0,
        false,
        0,
        Some(err.to_string()),
    );
    state.audit_sink.record(row).await;
}

pub fn new_audit_row(
    session_id: Option<String>,
    user_id: &str,
    agent_id: Option<&str>,
    route: &str,
    status_code: u16,
    duration_ms: u64,
    model: Option<String>,
    message: &str,
    tool_count: u32,
    hitl_triggered: bool,
    warnings_count: u32,
    error_message: Option<String>,
) -> ChatAuditRow {
    ChatAuditRow {
        session_id,
        user_id: user_id.to_string(),
        agent_id: agent_id.map(str::to_string),
        route: route.to_string(),
        status_code,
        duration_ms,
        model,
        message_preview: ChatAuditRow::truncate_preview(message),
        tool_count,
        hitl_triggered,
        warnings_count,
        error_message,
    }
}
