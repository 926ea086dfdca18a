use axum::extract::State;
use axum::{Extension, Json};
use muse_types::api::{Claims, UserResponse, UserView};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ApiError, db_error};
use crate::state::AppState;
use crate::{blocking, parse_timestamp};

/// GET /api/user/me
pub async fn get_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<UserResponse>, ApiError> {
    let db = state.clone();
    let user_id = claims.sub.to_string();
    let user = blocking(move || db.db.get_user_by_id(&user_id).map_err(db_error)).await?;

    // A valid token for a deleted account reads as an auth failure.
    let Some(user) = user else {
        return Err(ApiError::Unauthorized(
            "Not authorized, token failed".to_string(),
        ));
    };

    let id = user.id.parse().unwrap_or_else(|e| {
        warn!("Corrupt user id '{}': {e}", user.id);
        Uuid::default()
    });

    Ok(Json(UserResponse {
        success: true,
        user: UserView {
            id,
            name: user.name,
            email: user.email,
            credits: user.credits,
            is_verified: user.is_verified,
            created_at: parse_timestamp(&user.created_at, "user"),
        },
    }))
}
