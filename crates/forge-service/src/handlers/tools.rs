//! `GET /agent-api/tools`: lists promoted tools, filtered by the caller's
//! resolved agent's allowlist -- the same `filter_by_allowlist` step
//! `chat_support::resolve_turn` runs before a turn, but without the
//! provider/API-key resolution a turn also needs, since just listing tools
//! shouldn't fail a request over a missing key.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use forge_core::store::tools::filter_by_allowlist;
use forge_core::ForgeError;
use serde::Deserialize;
use serde_json::json;

use crate::common::{authenticate, enforce_rate_limit, user_id_of, SharedState, TokenQuery};
use crate::error_response::ApiError;

const ROUTE: &str = "/agent-api/tools";

#[derive(Debug, Deserialize, Default)]
pub struct ToolsQuery {
    pub agent_id: Option<String>,
}

pub async fn list_tools(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(token_query): Query<TokenQuery>,
    Query(params): Query<ToolsQuery>,
) -> Result<Response, ApiError> {
    let outcome = authenticate(&state, &headers, &token_query).await?;
    let user_id = user_id_of(&outcome);
    enforce_rate_limit(&state, &user_id, ROUTE).await?;

    let agent = match params.agent_id.as_deref() {
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

    let promoted = state.tool_store.list_promoted().await;
    let tools = match &agent {
        Some(a) => filter_by_allowlist(promoted, &a.tool_allowlist()),
        None => promoted,
    };

    Ok(Json(json!({ "tools": tools })).into_response())
}
