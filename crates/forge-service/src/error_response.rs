use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use forge_core::ForgeError;
use serde_json::json;

pub struct ApiError(pub ForgeError);

impl From<ForgeError> for ApiError {
    fn from(e: ForgeError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(json!({ "error": self.0.to_string() }))).into_response();
        if let ForgeError::RateLimited { retry_after_secs } = &self.0 {
            response
                .headers_mut()
                .insert("Retry-After", retry_after_secs.to_string().parse().expect("digits are valid header value"));
        }
        response
    }
}
