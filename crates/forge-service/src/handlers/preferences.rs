//! `GET/PUT /agent-api/user/preferences`: a user's saved model/HITL-level
//! overrides. Writes are gated by the default agent's
//! `allow_user_model_select` / `allow_user_hitl_config` flags -- the same
//! gate `crate::preferences::PreferenceResolver` applies when reading
//! preferences back at turn time.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use forge_core::config::ScopedConfig;
use forge_core::domain::{HitlLevel, UserPreferences};
use forge_core::ForgeError;
use serde::Deserialize;

use crate::common::{authenticate, enforce_rate_limit, user_id_of, SharedState, TokenQuery};
use crate::error_response::ApiError;

const ROUTE: &str = "/agent-api/user/preferences";

#[derive(Debug, Deserialize)]
pub struct PreferencesBody {
    pub model: Option<String>,
    pub hitl_level: Option<HitlLevel>,
}

pub async fn get_preferences(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let outcome = authenticate(&state, &headers, &query).await?;
    let user_id = user_id_of(&outcome);
    enforce_rate_limit(&state, &user_id, ROUTE).await?;

    let prefs = state.preferences_store.get(&user_id).await.map_err(ForgeError::internal)?;
    let prefs = prefs.unwrap_or(UserPreferences {
        user_id,
        model: None,
        hitl_level: None,
        updated_at: None,
    });
    Ok(Json(prefs).into_response())
}

pub async fn put_preferences(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(body): Json<PreferencesBody>,
) -> Result<Response, ApiError> {
    let outcome = authenticate(&state, &headers, &query).await?;
    let user_id = user_id_of(&outcome);
    enforce_rate_limit(&state, &user_id, ROUTE).await?;

    let agent = state.agent_store.get_default().await;
    let overlay = state.config.current();
    let scoped = ScopedConfig::build(&overlay, agent.as_ref());

    if body.model.is_some() && !scoped.allow_user_model_select {
        return Err(ForgeError::Forbidden.into());
    }
    if body.hitl_level.is_some() && !scoped.allow_user_hitl_config {
        return Err(ForgeError::Forbidden.into());
    }

    let existing = state.preferences_store.get(&user_id).await.map_err(ForgeError::internal)?;
    let merged = UserPreferences {
        user_id: user_id.clone(),
        model: body.model.or_else(|| existing.as_ref().and_then(|p| p.model.clone())),
        hitl_level: body.hitl_level.or_else(|| existing.as_ref().and_then(|p| p.hitl_level)),
        updated_at: None,
    };

    let saved = state.preferences_store.upsert(merged).await.map_err(ForgeError::internal)?;
    Ok(Json(saved).into_response())
}
