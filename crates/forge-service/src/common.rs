//! Shared pieces every handler needs: auth + rate-limit enforcement, the
//! admin bearer check, and the request body size cap. Kept out of
//! `forge-core` because these combine several core collaborators with
//! HTTP-specific concerns (headers, query params, status codes).

use axum::extract::Query;
use axum::http::HeaderMap;
use forge_core::auth::{AuthOutcome, RawToken};
use forge_core::{AppState, ForgeError};
use serde::Deserialize;
use std::sync::Arc;

use crate::error_response::ApiError;

/// 1 MiB, per spec.md §5/§6.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize, Default)]
pub struct TokenQuery {
    pub token: Option<String>,
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Authenticates one request: `Authorization: Bearer` header preferred,
/// `?token=` query fallback for SSE clients that cannot set headers.
pub async fn authenticate(state: &AppState, headers: &HeaderMap, query: &TokenQuery) -> Result<AuthOutcome, ApiError> {
    let bearer = bearer_from_headers(headers);
    let outcome = state
        .authenticator
        .authenticate(RawToken { bearer, query_token: query.token.as_deref() })
        .await;
    if !outcome.authenticated {
        return Err(ForgeError::AuthFailure { reason: outcome.error.unwrap_or_else(|| "unauthenticated".to_string()) }.into());
    }
    Ok(outcome)
}

/// A missing identity claim is a valid, authenticated outcome per spec.md
/// §4.1; the empty string is this service's sentinel for "no claim",
/// scoping rate limits and session ownership to an anonymous bucket rather
/// than failing the request.
pub fn user_id_of(outcome: &AuthOutcome) -> String {
    outcome.user_id.clone().unwrap_or_default()
}

pub async fn enforce_rate_limit(state: &AppState, user_id: &str, route: &str) -> Result<(), ApiError> {
    let decision = state.rate_limiter.check(user_id, route).await;
    if decision.allowed {
        Ok(())
    } else {
        Err(ForgeError::RateLimited { retry_after_secs: decision.retry_after_secs }.into())
    }
}

/// Admin bearer check: unset/empty key fails closed with 503; wrong key is
/// 403.
pub fn authenticate_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let bearer = bearer_from_headers(headers);
    state.admin_authenticator.check(bearer).map_err(|unset| {
        if unset {
            ApiError(ForgeError::AdminUnavailable)
        } else {
            ApiError(ForgeError::Forbidden)
        }
    })
}

pub type SharedState = Arc<AppState>;

pub type TokenQueryExtractor = Query<TokenQuery>;
