//! `POST /agent-api/chat`: the streaming entrypoint. Opens an SSE response
//! immediately (an initial `session` event carries the session id back to
//! the client) and drives the loop in a spawned task so a client disconnect
//! -- detected by `SseSink::forward` failing to push onto the channel --
//! cancels the in-flight turn instead of leaving it orphaned.

use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use forge_core::domain::{ChatRequest, MessageRole};
use forge_core::ForgeError;
use serde_json::json;
use tokio::sync::mpsc;

use crate::chat_support::{
    build_request_template, build_turn_messages, drive_loop, ensure_session, new_audit_row,
    persist_turn_message, record_rejected_request, resolve_turn, spawn_turn, DriveOutcome,
};
use crate::common::{authenticate, enforce_rate_limit, user_id_of, SharedState, TokenQuery};
use crate::error_response::ApiError;
use crate::sink::{CountingSink, SseSink};

const ROUTE: &str = "/agent-api/chat";

pub async fn chat(
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
    if let Err(err) = enforce_rate_limit(&state, &user_id, "chat").await {
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

    let (tx, rx) = mpsc::channel::<Result<Event, std::convert::Infallible>>(64);
    let session_event = Event::default()
        .event("session")
        .data(json!({ "session_id": session_id, "agent_id": agent_id }).to_string());
    let _ = tx.try_send(Ok(session_event));

    let state_for_task = state.clone();
    let session_for_task = session_id.clone();
    let agent_for_task = agent_id.clone();
    let message_for_task = req.message.clone();
    tokio::spawn(async move {
        let mut sse_sink = SseSink::new(tx);
        let mut counting = CountingSink::new(&mut sse_sink);
        let drive_outcome = drive_loop(
            spawned.events,
            &mut counting,
            &state_for_task,
            &session_for_task,
            &user_id,
            agent_for_task.as_deref(),
            true,
        )
        .await;

        if matches!(drive_outcome, DriveOutcome::Disconnected) {
            spawned.cancel.cancel();
        }

        let status_code = match &drive_outcome {
            DriveOutcome::Disconnected => 499,
            _ => 200,
        };
        let error_message = match &drive_outcome {
            DriveOutcome::Disconnected => Some("client disconnected before the turn completed".to_string()),
            _ => None,
        };

        let row = new_audit_row(
            Some(session_for_task),
            &user_id,
            agent_for_task.as_deref(),
            ROUTE,
            status_code,
            start.elapsed().as_millis() as u64,
            Some(model),
            &message_for_task,
            counting.tool_calls,
            counting.hitl_triggered,
            counting.warnings,
            error_message,
        );
        state_for_task.audit_sink.record(row).await;
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    let response = Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"));
    Ok(response.into_response())
}
