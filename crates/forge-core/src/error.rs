//! Structured, serializable error type for the core. Mirrors the teacher's
//! `AgentError` idiom (`crates/agent/src/error.rs`): one flat enum, every
//! variant self-describing, mapped to a transport status at the edge rather
//! than scattered string matches.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ForgeError {
    #[error("authentication failed: {reason}")]
    AuthFailure { reason: String },

    #[error("forbidden")]
    Forbidden,

    #[error("admin authentication unavailable")]
    AdminUnavailable,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    #[error("not found: {reason}")]
    NotFound { reason: String },

    #[error("no api key configured for provider {provider}")]
    ProviderMisconfigured { provider: String },

    #[error("not implemented: {reason}")]
    NotImplemented { reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        ForgeError::Internal(err.to_string())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ForgeError::AuthFailure { .. } => 401,
            ForgeError::Forbidden => 403,
            ForgeError::AdminUnavailable => 503,
            ForgeError::RateLimited { .. } => 429,
            ForgeError::PayloadTooLarge => 413,
            ForgeError::BadRequest { .. } => 400,
            ForgeError::NotFound { .. } => 404,
            ForgeError::ProviderMisconfigured { .. } => 500,
            ForgeError::NotImplemented { .. } => 501,
            ForgeError::Internal(_) => 500,
        }
    }
}

pub type ForgeResult<T> = Result<T, ForgeError>;
