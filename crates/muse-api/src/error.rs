use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use muse_providers::ProviderError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Failure taxonomy for the HTTP surface. Every variant renders as a JSON
/// body carrying `success: false` and a user-facing message; the status
/// code tells clients which failures are worth retrying.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    /// The caller's balance does not cover the requested operation.
    #[error("not enough credits")]
    InsufficientCredits,
    /// Login attempt against an address that has not been verified yet.
    /// The body carries `needs_verification` so the client can offer a
    /// re-send instead of a generic failure.
    #[error("email not verified")]
    EmailUnverified,
    #[error("rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    /// Classified failure from a completion, image or mail backend.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Anything unexpected. The detail is logged at the call site, never
    /// sent to the client.
    #[error("internal error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::InsufficientCredits => (
                StatusCode::FORBIDDEN,
                "You don't have enough credits to use this feature.".to_string(),
            ),
            ApiError::EmailUnverified => (
                StatusCode::FORBIDDEN,
                "Please verify your email before logging in.".to_string(),
            ),
            ApiError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                format!("Too many requests. Please try again in {retry_after_secs} seconds."),
            ),
            ApiError::Provider(err) => provider_response(err),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong. Please try again.".to_string(),
            ),
        };

        let mut body = json!({ "success": false, "message": message });
        match &self {
            ApiError::RateLimited { retry_after_secs } => {
                body["retry_after"] = (*retry_after_secs).into();
            }
            ApiError::EmailUnverified => {
                body["needs_verification"] = true.into();
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

/// Logs a storage failure and folds it into the generic internal error.
/// The detail never reaches the client.
pub(crate) fn db_error(err: anyhow::Error) -> ApiError {
    error!("DB error: {err:#}");
    ApiError::Internal
}

/// Clients branch on these: 503 means the backend extension is off, 429
/// means back off and retry, 408 means the one request timed out.
fn provider_response(err: &ProviderError) -> (StatusCode, String) {
    match err {
        ProviderError::Timeout => (
            StatusCode::REQUEST_TIMEOUT,
            "The generation request timed out. Please try again in a moment.".to_string(),
        ),
        ProviderError::Throttled(_) => (
            StatusCode::TOO_MANY_REQUESTS,
            "The generation service is busy or over its usage limit. Please try again in a few minutes."
                .to_string(),
        ),
        ProviderError::NotReady(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "AI image generation is not enabled on the storage account yet. Please try again later."
                .to_string(),
        ),
        ProviderError::Misconfigured(detail) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Image generation is unavailable: {detail}"),
        ),
        ProviderError::StorageQuota(_) => (
            StatusCode::TOO_MANY_REQUESTS,
            "The image storage quota has been reached. Please try again later.".to_string(),
        ),
        ProviderError::Transport(detail) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Generation failed: {detail}"),
        ),
    }
}
