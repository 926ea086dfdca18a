use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MessageRole;

// -- JWT Claims --

/// JWT claims issued by the login handler and verified by the muse-api
/// middleware. Canonical definition lives here in muse-types so handlers,
/// middleware and tests share one shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub name: String,
    pub exp: usize,
}

// -- Generic acknowledgment --

/// Body shared by every endpoint that has nothing to return beyond an
/// outcome. Failures use the same shape with `success: false`.
#[derive(Debug, Serialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

impl Ack {
    pub fn ok(message: impl Into<String>) -> Self {
        Ack {
            success: true,
            message: message.into(),
        }
    }
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyEmailRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResendVerificationRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

// -- Users --

/// Account view returned to the owner. Never carries the password hash.
#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub credits: i64,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub success: bool,
    pub user: UserView,
}

// -- Chats --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenameChatRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub is_image: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_published: Option<bool>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ChatView {
    pub id: Uuid,
    pub name: String,
    pub messages: Vec<MessageView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ChatsResponse {
    pub success: bool,
    pub chats: Vec<ChatView>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextMessageRequest {
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageMessageRequest {
    pub prompt: String,
    #[serde(default)]
    pub publish: bool,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub success: bool,
    pub reply: MessageView,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishImageRequest {
    pub image_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteImageRequest {
    pub image_url: String,
}

// -- Community gallery --

#[derive(Debug, Serialize)]
pub struct GalleryImageView {
    pub image_url: String,
    pub user_name: String,
    pub prompt: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CommunityImagesResponse {
    pub success: bool,
    pub images: Vec<GalleryImageView>,
}

#[derive(Debug, Serialize)]
pub struct CreatorView {
    pub user_name: String,
    pub image_count: i64,
    pub latest_published_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CreatorsResponse {
    pub success: bool,
    pub creators: Vec<CreatorView>,
}

#[derive(Debug, Serialize)]
pub struct CreatorProfileResponse {
    pub success: bool,
    pub user_name: String,
    pub images: Vec<GalleryImageView>,
    pub total_images: i64,
}
