use axum::Json;
use axum::extract::{Path, State};
use muse_db::models::CommunityImageRow;
use muse_types::api::{
    CommunityImagesResponse, CreatorProfileResponse, CreatorView, CreatorsResponse,
    GalleryImageView,
};

use crate::error::{ApiError, db_error};
use crate::state::AppState;
use crate::{blocking, parse_timestamp};

/// Newest images shown on the public wall.
const GALLERY_PAGE: u32 = 100;
/// Rows on the creator leaderboard.
const CREATOR_PAGE: u32 = 50;
/// Images shown on a single creator's profile.
const PROFILE_PAGE: u32 = 50;

/// GET /api/community/images
pub async fn get_images(
    State(state): State<AppState>,
) -> Result<Json<CommunityImagesResponse>, ApiError> {
    let db = state.clone();
    let rows = blocking(move || db.db.get_published_images(GALLERY_PAGE).map_err(db_error)).await?;

    Ok(Json(CommunityImagesResponse {
        success: true,
        images: rows.into_iter().map(gallery_view).collect(),
    }))
}

/// GET /api/community/creators
pub async fn get_creators(
    State(state): State<AppState>,
) -> Result<Json<CreatorsResponse>, ApiError> {
    let db = state.clone();
    let rows = blocking(move || db.db.get_creators(CREATOR_PAGE).map_err(db_error)).await?;

    let creators = rows
        .into_iter()
        .map(|row| {
            let latest_published_at = parse_timestamp(&row.latest_published_at, "creator");
            CreatorView {
                user_name: row.user_name,
                image_count: row.image_count,
                latest_published_at,
            }
        })
        .collect();

    Ok(Json(CreatorsResponse {
        success: true,
        creators,
    }))
}

/// GET /api/community/profile/{user_name}
///
/// An unknown creator is just an empty profile.
pub async fn get_creator_profile(
    State(state): State<AppState>,
    Path(user_name): Path<String>,
) -> Result<Json<CreatorProfileResponse>, ApiError> {
    let db = state.clone();
    let lookup_name = user_name.clone();
    let rows = blocking(move || {
        db.db
            .get_images_by_creator(&lookup_name, PROFILE_PAGE)
            .map_err(db_error)
    })
    .await?;

    let images: Vec<GalleryImageView> = rows.into_iter().map(gallery_view).collect();
    let total_images = images.len() as i64;

    Ok(Json(CreatorProfileResponse {
        success: true,
        user_name,
        images,
        total_images,
    }))
}

fn gallery_view(row: CommunityImageRow) -> GalleryImageView {
    let published_at = parse_timestamp(&row.published_at, "community image");
    GalleryImageView {
        image_url: row.image_url,
        user_name: row.user_name,
        prompt: row.prompt,
        published_at,
    }
}
