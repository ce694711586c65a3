//! `POST /agent-api/chat/resume`: redeems a HITL resume token. `confirmed:
//! false` drops the gated tool call and responds with a plain JSON body --
//! crucially *without ever calling* `HitlEngine::resume`, since that call
//! consumes the token. `confirmed: true` redeems it, dispatches the call,
//! and continues the turn over SSE.

use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use forge_core::react::{self, ReactEvent, ToolBatchOutcome};
use forge_core::ForgeError;
use serde_json::json;
use tokio::sync::mpsc;

use crate::chat_support::{
    build_history_messages, build_request_template, drive_loop, new_audit_row, resolve_turn,
    spawn_turn_with_sender, store_hitl_pause, DriveOutcome,
};
use crate::common::{authenticate, enforce_rate_limit, user_id_of, SharedState, TokenQuery};
use crate::error_response::ApiError;
use crate::sink::{CountingSink, EventSink, SseSink};

const ROUTE: &str = "/agent-api/chat/resume";

pub async fn resume(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(req): Json<forge_core::domain::ResumeRequest>,
) -> Result<Response, ApiError> {
    let start = Instant::now();
    let outcome = authenticate(&state, &headers, &query).await?;
    let caller_id = user_id_of(&outcome);
    enforce_rate_limit(&state, &caller_id, "chat/resume").await?;

    if !req.confirmed {
        // Never touch the HITL engine: resuming (even to discover whose
        // token it is) would consume it, and a cancellation must leave the
        // token redeemable by a later `confirmed: true` until it expires.
        return Ok((StatusCode::OK, Json(json!({ "message": "Cancelled" }))).into_response());
    }

    let Some(engine) = state.hitl_engine.as_ref() else {
        return Err(ForgeError::NotImplemented {
            reason: "hitl is not configured on this instance".to_string(),
        }
        .into());
    };

    let paused = engine
        .resume(&req.resume_token)
        .await
        .map_err(ForgeError::internal)?
        .ok_or_else(|| ForgeError::NotFound {
            reason: "resume token not found or already used".to_string(),
        })?;

    if paused.user_id != caller_id {
        return Err(ForgeError::Forbidden.into());
    }

    confirm_paused_call(&state, paused, start).await
}

/// Dispatches the confirmed call (and any remaining siblings in its
/// original batch), then -- if that batch didn't hit a second pause or a
/// block verdict -- spawns a continuation `react::run` from where the turn
/// left off, all onto one SSE response.
async fn confirm_paused_call(
    state: &SharedState,
    paused: forge_core::domain::PausedHitlState,
    start: Instant,
) -> Result<Response, ApiError> {
    let resolved = resolve_turn(state, &paused.user_id, paused.agent_id.as_deref()).await?;
    let model = resolved.effective.model.clone();

    let start_idx = paused
        .pending_tool_calls
        .iter()
        .position(|c| c.name == paused.tool_name && c.args == paused.args)
        .unwrap_or(0);

    let history = state
        .conversation_store
        .get_history(&paused.session_id, resolved.scoped.conversation_window)
        .await
        .map_err(ForgeError::internal)?;
    let mut messages = build_history_messages(&history);

    let (react_tx, mut react_rx) = mpsc::channel::<ReactEvent>(64);
    let cancel = tokio_util::sync::CancellationToken::new();

    let batch_outcome = react::dispatch_tool_calls(
        &paused.pending_tool_calls,
        start_idx,
        true,
        &resolved.tools,
        resolved.effective.hitl_level,
        paused.turn_index,
        &state.tool_dispatcher,
        &state.verifier_runner,
        &react_tx,
        &cancel,
        &mut messages,
    )
    .await;

    let (tx, rx) = mpsc::channel::<Result<Event, std::convert::Infallible>>(64);
    let session_event = Event::default().event("session").data(
        json!({ "session_id": paused.session_id, "agent_id": paused.agent_id }).to_string(),
    );
    let _ = tx.try_send(Ok(session_event));

    let state_for_task = state.clone();
    let paused_for_task = paused.clone();
    tokio::spawn(async move {
        let mut sse_sink = SseSink::new(tx);
        let mut counting = CountingSink::new(&mut sse_sink);

        // Drain the replay batch's events first: they were sent
        // synchronously above, so every send already completed and
        // `try_recv` alone empties the channel without blocking.
        while let Ok(event) = react_rx.try_recv() {
            if let ReactEvent::Hitl(pause) = &event {
                match store_hitl_pause(
                    &state_for_task,
                    &paused_for_task.session_id,
                    &paused_for_task.user_id,
                    paused_for_task.agent_id.as_deref(),
                    pause,
                )
                .await
                {
                    Ok(decorated) => {
                        counting.forward(&ReactEvent::Hitl(decorated));
                    }
                    Err(message) => {
                        counting.forward(&ReactEvent::Error { message });
                    }
                }
            } else {
                counting.forward(&event);
            }
        }

        let drive_outcome = match batch_outcome {
            // The pause event itself was already drained and reported
            // above; nothing further runs in this turn.
            ToolBatchOutcome::Paused(pause) => DriveOutcome::Paused(pause),
            ToolBatchOutcome::Disconnected => DriveOutcome::Disconnected,
            ToolBatchOutcome::Continue => {
                let request_template = build_request_template(&resolved, messages);
                let remaining_turns = resolved
                    .scoped
                    .max_turns
                    .saturating_sub(paused_for_task.turn_index + 1)
                    .max(1);
                let continuation_cancel = spawn_turn_with_sender(
                    &state_for_task,
                    request_template,
                    remaining_turns,
                    resolved.effective.hitl_level,
                    paused_for_task.session_id.clone(),
                    paused_for_task.agent_id.clone(),
                    paused_for_task.user_id.clone(),
                    react_tx.clone(),
                );
                drop(react_tx);
                let outcome = drive_loop(
                    react_rx,
                    &mut counting,
                    &state_for_task,
                    &paused_for_task.session_id,
                    &paused_for_task.user_id,
                    paused_for_task.agent_id.as_deref(),
                    true,
                )
                .await;
                if matches!(outcome, DriveOutcome::Disconnected) {
                    continuation_cancel.cancel();
                }
                outcome
            }
        };

        let status_code = match &drive_outcome {
            DriveOutcome::Disconnected => 499,
            _ => 200,
        };
        let error_message = match &drive_outcome {
            DriveOutcome::Disconnected => Some("client disconnected before the turn completed".to_string()),
            _ => None,
        };

        let row = new_audit_row(
            Some(paused_for_task.session_id.clone()),
            &paused_for_task.user_id,
            paused_for_task.agent_id.as_deref(),
            ROUTE,
            status_code,
            start.elapsed().as_millis() as u64,
            Some(model),
            &paused_for_task.tool_name,
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
