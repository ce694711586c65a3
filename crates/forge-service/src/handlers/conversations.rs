//! `GET/DELETE /agent-api/conversations[/:sid]`: list the caller's
//! sessions, read one session's history, or delete one. Ownership is
//! sticky (`ConversationStore::get_session_user_id`) -- a session belongs
//! to whoever sent its first message, and every other caller gets 403, not
//! a filtered view.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use forge_core::store::ConversationStoreError;
use forge_core::ForgeError;
use serde_json::json;

use crate::common::{authenticate, enforce_rate_limit, user_id_of, SharedState, TokenQuery};
use crate::error_response::ApiError;

const ROUTE: &str = "/agent-api/conversations";

async fn check_ownership(state: &SharedState, session_id: &str, user_id: &str) -> Result<(), ApiError> {
    let owner = state
        .conversation_store
        .get_session_user_id(session_id)
        .await
        .map_err(ForgeError::internal)?;
    match owner {
        None => Err(ForgeError::NotFound { reason: format!("session not found: {session_id}") }.into()),
        Some(owner) if owner != user_id => Err(ForgeError::Forbidden.into()),
        Some(_) => Ok(()),
    }
}

pub async fn list_conversations(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let outcome = authenticate(&state, &headers, &query).await?;
    let user_id = user_id_of(&outcome);
    enforce_rate_limit(&state, &user_id, ROUTE).await?;

    let sessions = state
        .conversation_store
        .list_sessions(&user_id)
        .await
        .map_err(ForgeError::internal)?;
    Ok(Json(json!({ "sessions": sessions })).into_response())
}

pub async fn get_conversation(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let outcome = authenticate(&state, &headers, &query).await?;
    let user_id = user_id_of(&outcome);
    enforce_rate_limit(&state, &user_id, ROUTE).await?;

    check_ownership(&state, &session_id, &user_id).await?;

    let window = state.config.current().conversation.window;
    let history = state
        .conversation_store
        .get_history(&session_id, window)
        .await
        .map_err(ForgeError::internal)?;
    Ok(Json(json!({ "session_id": session_id, "messages": history })).into_response())
}

pub async fn delete_conversation(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let outcome = authenticate(&state, &headers, &query).await?;
    let user_id = user_id_of(&outcome);
    enforce_rate_limit(&state, &user_id, ROUTE).await?;

    check_ownership(&state, &session_id, &user_id).await?;

    state
        .conversation_store
        .delete_session(&session_id, &user_id)
        .await
        .map_err(|e| match e {
            ConversationStoreError::OwnershipViolation(_) => ApiError(ForgeError::Forbidden),
            ConversationStoreError::NotFound(reason) => ApiError(ForgeError::NotFound { reason }),
            other => ApiError(ForgeError::internal(other)),
        })?;

    Ok(StatusCode::NO_CONTENT.into_response())
}
