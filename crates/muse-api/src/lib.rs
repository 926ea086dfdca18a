pub mod auth;
pub mod chats;
pub mod community;
pub mod error;
pub mod limit;
pub mod messages;
pub mod middleware;
pub mod state;
pub mod users;

#[cfg(test)]
mod tests;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, patch, post};
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{error, warn};

use crate::error::ApiError;
use crate::state::AppState;

/// Builds the full API router. Auth and community routes are public;
/// everything else sits behind the bearer-token layer, with the image
/// pipeline additionally rate limited per user.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/verify-email", post(auth::verify_email))
        .route("/auth/resend-verification", post(auth::resend_verification))
        .route("/auth/login", post(auth::login))
        .route("/auth/forgot-password", post(auth::forgot_password))
        .route("/auth/reset-password", post(auth::reset_password))
        .route("/community/images", get(community::get_images))
        .route("/community/creators", get(community::get_creators))
        .route(
            "/community/profile/{user_name}",
            get(community::get_creator_profile),
        )
        .with_state(state.clone());

    // The limiter layer sits inside the auth layer so its key can use the
    // caller identity from the verified claims.
    let image_route = Router::new()
        .route(
            "/chats/{chat_id}/messages/image",
            post(messages::send_image_message),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::image_rate_limit,
        ));

    let protected = Router::new()
        .route("/user/me", get(users::get_me))
        .route(
            "/chats",
            post(chats::create_chat)
                .get(chats::get_chats)
                .delete(chats::delete_all_chats),
        )
        .route(
            "/chats/{chat_id}",
            patch(chats::rename_chat).delete(chats::delete_chat),
        )
        .route(
            "/chats/{chat_id}/messages/text",
            post(messages::send_text_message),
        )
        .route(
            "/chats/{chat_id}/images/publish",
            post(messages::publish_image),
        )
        .route(
            "/chats/{chat_id}/images/delete",
            post(messages::delete_image),
        )
        .merge(image_route)
        .layer(from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state);

    Router::new()
        .route("/", get(health))
        .nest("/api", Router::new().merge(public).merge(protected))
}

async fn health() -> &'static str {
    "Server is running"
}

/// Runs database work on the blocking pool, folding a join failure into
/// the error taxonomy.
pub(crate) async fn blocking<T, F>(task: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|e| {
        error!("spawn_blocking join error: {e:#}");
        ApiError::Internal
    })?
}

/// SQLite TEXT timestamps arrive either as RFC 3339 or in the bare
/// `datetime('now')` format. Corrupt values degrade to the epoch with a
/// warning instead of failing the whole response.
pub(crate) fn parse_timestamp(value: &str, context: &str) -> DateTime<Utc> {
    value
        .parse::<DateTime<Utc>>()
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{value}' on {context}: {e}");
            DateTime::<Utc>::default()
        })
}
