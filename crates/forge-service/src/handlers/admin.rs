//! `/forge-admin/*`: agent CRUD + set-default, and the runtime config
//! overlay's GET/PUT, whole or by section. Every handler here gates on
//! `authenticate_admin` rather than the user-facing bearer/query flow --
//! there is no per-user rate limiting on this surface, only the admin key.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use forge_core::config::RuntimeOverlay;
use forge_core::domain::Agent;
use forge_core::store::AgentStoreError;
use forge_core::ForgeError;
use serde_json::Value;

use crate::common::{authenticate_admin, SharedState};
use crate::error_response::ApiError;

fn map_agent_store_error(e: AgentStoreError) -> ApiError {
    match e {
        AgentStoreError::NotFound(id) => ApiError(ForgeError::NotFound { reason: format!("agent not found: {id}") }),
        AgentStoreError::DuplicateSlug(id) => {
            ApiError(ForgeError::BadRequest { reason: format!("agent slug already exists: {id}") })
        }
        AgentStoreError::InvalidSlug(id) => {
            ApiError(ForgeError::BadRequest { reason: format!("invalid agent slug: {id}") })
        }
        AgentStoreError::SeededFromConfig(_) => ApiError(ForgeError::Forbidden),
    }
}

pub async fn list_agents(State(state): State<SharedState>, headers: HeaderMap) -> Result<Response, ApiError> {
    authenticate_admin(&state, &headers)?;
    let agents = state.agent_store.list().await;
    Ok(Json(serde_json::json!({ "agents": agents })).into_response())
}

pub async fn get_agent(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    authenticate_admin(&state, &headers)?;
    let agent = state
        .agent_store
        .get(&id)
        .await
        .ok_or_else(|| ForgeError::NotFound { reason: format!("agent not found: {id}") })?;
    Ok(Json(agent).into_response())
}

pub async fn create_agent(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(agent): Json<Agent>,
) -> Result<Response, ApiError> {
    authenticate_admin(&state, &headers)?;
    let created = state.agent_store.create(agent).await.map_err(map_agent_store_error)?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

pub async fn update_agent(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(agent): Json<Agent>,
) -> Result<Response, ApiError> {
    authenticate_admin(&state, &headers)?;
    if agent.id != id {
        return Err(ForgeError::BadRequest { reason: "path id and body id must match".to_string() }.into());
    }
    let updated = state.agent_store.update(agent).await.map_err(map_agent_store_error)?;
    Ok(Json(updated).into_response())
}

pub async fn delete_agent(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    authenticate_admin(&state, &headers)?;
    state.agent_store.delete(&id).await.map_err(map_agent_store_error)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn set_default_agent(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    authenticate_admin(&state, &headers)?;
    state.agent_store.set_default(&id).await.map_err(map_agent_store_error)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn section_value(overlay: &RuntimeOverlay, section: &str) -> Result<Value, ApiError> {
    let value = match section {
        "model" => serde_json::to_value(&overlay.model),
        "hitl" => serde_json::to_value(&overlay.hitl),
        "permissions" => serde_json::to_value(&overlay.permissions),
        "conversation" => serde_json::to_value(&overlay.conversation),
        other => return Err(ForgeError::BadRequest { reason: format!("unknown config section: {other}") }.into()),
    };
    value.map_err(|e| ApiError(ForgeError::internal(e)))
}

/// Logs, rather than fails, a persistence error -- the in-process overlay
/// has already been swapped by the time this runs, so the update itself
/// always succeeds; only surviving a restart is at risk.
fn persist_config(state: &SharedState, overlay: &RuntimeOverlay) {
    if let Some(path) = &state.config_path {
        if let Err(e) = overlay.persist_to_file(path) {
            tracing::warn!(error = %e, path = %path.display(), "failed to persist runtime config overlay");
        }
    }
}

pub async fn get_config(State(state): State<SharedState>, headers: HeaderMap) -> Result<Response, ApiError> {
    authenticate_admin(&state, &headers)?;
    let overlay = state.config.current();
    Ok(Json(overlay.as_ref()).into_response())
}

pub async fn get_config_section(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(section): Path<String>,
) -> Result<Response, ApiError> {
    authenticate_admin(&state, &headers)?;
    let overlay = state.config.current();
    Ok(Json(section_value(&overlay, &section)?).into_response())
}

pub async fn put_config(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(overlay): Json<RuntimeOverlay>,
) -> Result<Response, ApiError> {
    authenticate_admin(&state, &headers)?;
    state.config.swap(overlay.clone());
    persist_config(&state, &overlay);
    Ok(Json(overlay).into_response())
}

pub async fn put_config_section(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(section): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    authenticate_admin(&state, &headers)?;
    let mut overlay = (*state.config.current()).clone();
    match section.as_str() {
        "model" => {
            overlay.model = serde_json::from_value(body).map_err(|e| ForgeError::BadRequest { reason: e.to_string() })?
        }
        "hitl" => {
            overlay.hitl = serde_json::from_value(body).map_err(|e| ForgeError::BadRequest { reason: e.to_string() })?
        }
        "permissions" => {
            overlay.permissions =
                serde_json::from_value(body).map_err(|e| ForgeError::BadRequest { reason: e.to_string() })?
        }
        "conversation" => {
            overlay.conversation =
                serde_json::from_value(body).map_err(|e| ForgeError::BadRequest { reason: e.to_string() })?
        }
        other => return Err(ForgeError::BadRequest { reason: format!("unknown config section: {other}") }.into()),
    }
    state.config.swap(overlay.clone());
    persist_config(&state, &overlay);
    Ok(Json(section_value(&overlay, &section)?).into_response())
}
