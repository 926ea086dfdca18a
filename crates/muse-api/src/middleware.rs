use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{DecodingKey, Validation, decode};
use muse_types::api::Claims;

use crate::error::ApiError;
use crate::limit::RateDecision;
use crate::state::AppState;

/// Extracts and validates the bearer token, then stores the claims in the
/// request extensions for handlers to pick up.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Not authorized, no token".to_string()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("Not authorized, no token".to_string()))?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthorized("Not authorized, token failed".to_string()))?;

    req.extensions_mut().insert(token_data.claims);
    Ok(next.run(req).await)
}

/// Applies the image limiter to the wrapped route. Sits inside the auth
/// layer, so the key is almost always per-user.
pub async fn image_rate_limit(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = limiter_key(&req);
    match state.image_limiter.check_and_record(&key, Instant::now()) {
        RateDecision::Allowed => Ok(next.run(req).await),
        RateDecision::Throttled { retry_after_secs } => {
            Err(ApiError::RateLimited { retry_after_secs })
        }
    }
}

/// Route template plus caller identity. Keying on the matched route rather
/// than the concrete URI gives each caller one window across all path
/// parameters; switching chats does not reset it. The auth layer has
/// already populated Claims on this route; the forwarded-address fallback
/// covers any future placement in front of unauthenticated routes.
fn limiter_key(req: &Request) -> String {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(MatchedPath::as_str)
        .unwrap_or_else(|| req.uri().path());

    if let Some(claims) = req.extensions().get::<Claims>() {
        return format!("{}:{}", route, claims.sub);
    }

    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|addr| !addr.is_empty());

    match forwarded {
        Some(addr) => format!("{}:{}", route, addr),
        None => format!("{}:anonymous", route),
    }
}
