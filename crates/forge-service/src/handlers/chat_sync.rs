//! `POST /agent-api/chat-sync`: the buffered counterpart to `/agent-api/chat`.
//! Same resolution pipeline, but drains the loop into a `BufferSink` and
//! returns one JSON object instead of a stream.

use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use forge_core::domain::{ChatRequest, MessageRole};
use forge_core::ForgeError;
use serde_json::json;

use crate::chat_support::{
    build_request_template, build_turn_messages, drive_loop, ensure_session, new_audit_row,
    persist_turn_message, record_rejected_request, resolve_turn, spawn_turn, DriveOutcome,
};
use crate::common::{authenticate, enforce_rate_limit, user_id_of, SharedState, TokenQuery};
use crate::error_response::ApiError;
use crate::sink::BufferSink;

const ROUTE: &str = "/agent-api/chat-sync";

pub async fn chat_sync(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let start = Instant::now();
    let outcome = match authenticate(&state, &headers, &query).await {
        Ok(outcome) => outcome,
        Err(err) => {
            record_rejected_request(&state, "", ROUTE, start, &err.0).await;
            return Err(err);
        }
    };
    let user_id = user_id_of(&outcome);
    if let Err(err) = enforce_rate_limit(&state, &user_id, "chat-sync").await {
        record_rejected_request(&state, &user_id, ROUTE, start, &err.0).await;
        return Err(err);
    }

    let resolved = resolve_turn(&state, &user_id, req.agent_id.as_deref()).await?;
    let agent_id = resolved.agent.as_ref().map(|a| a.id.clone());

    let session_id = ensure_session(&state, req.session_id.clone(), &user_id, agent_id.as_deref()).await?;
    persist_turn_message(&state, &session_id, &user_id, agent_id.as_deref(), MessageRole::User, &req.message).await;

    let history = state
        .conversation_store
        .get_history(&session_id, resolved.scoped.conversation_window)
        .await
        .map_err(ForgeError::internal)?;
    let messages = build_turn_messages(&history, &req.message);
    let request_template = build_request_template(&resolved, messages);
    let model = resolved.effective.model.clone();

    let spawned = spawn_turn(&state, request_template, &resolved, session_id.clone(), user_id.clone());
    let mut sink = BufferSink::new();
    let drive_outcome = drive_loop(spawned.events, &mut sink, &state, &session_id, &user_id, agent_id.as_deref(), false).await;
    // Every branch above already drained the loop to completion; cancelling
    // after the fact is a no-op safety net, not live cooperative cancellation.
    spawned.cancel.cancel();

    let status = match &drive_outcome {
        DriveOutcome::Done { .. } => StatusCode::OK,
        DriveOutcome::Paused(_) => StatusCode::CONFLICT,
        DriveOutcome::EngineMissing => StatusCode::INTERNAL_SERVER_ERROR,
        DriveOutcome::Disconnected => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let body = match &drive_outcome {
        DriveOutcome::Paused(pause) => json!({
            "resume_token": pause.resume_token,
            "tool": pause.tool,
            "message": pause.message,
        }),
        DriveOutcome::EngineMissing => json!({ "error": "hitl pause requested but no hitl engine is configured" }),
        DriveOutcome::Disconnected => json!({ "error": "turn ended unexpectedly" }),
        DriveOutcome::Done { usage, exhausted } => json!({
            "session_id": session_id,
            "agent_id": agent_id,
            "message": sink.outcome.message,
            "tool_calls": sink.outcome.tool_calls,
            "warnings": sink.outcome.warnings,
            "flags": sink.outcome.flags,
            "usage": usage,
            "exhausted": exhausted,
        }),
    };

    let hitl_triggered = matches!(drive_outcome, DriveOutcome::Paused(_));
    let error_message = match &drive_outcome {
        DriveOutcome::EngineMissing => Some("hitl pause requested but no hitl engine is configured".to_string()),
        DriveOutcome::Disconnected => Some("turn ended unexpectedly".to_string()),
        _ => None,
    };

    let row = new_audit_row(
        Some(session_id),
        &user_id,
        agent_id.as_deref(),
        ROUTE,
        status.as_u16(),
        start.elapsed().as_millis() as u64,
        Some(model),
        &req.message,
        sink.outcome.tool_calls.len() as u32,
        hitl_triggered,
        sink.outcome.warnings.len() as u32,
        error_message,
    );
    state.audit_sink.record(row).await;

    Ok((status, Json(body)).into_response())
}
