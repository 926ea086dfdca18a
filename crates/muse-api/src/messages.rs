use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::Utc;
use muse_db::models::NewMessage;
use muse_types::api::{
    Ack, Claims, DeleteImageRequest, ImageMessageRequest, MessageView, PublishImageRequest,
    SendMessageResponse, TextMessageRequest,
};
use muse_types::models::{DEFAULT_CHAT_NAME, IMAGE_MESSAGE_COST, MessageRole, TEXT_MESSAGE_COST};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blocking;
use crate::error::{ApiError, db_error};
use crate::state::AppState;

/// Longest prompt accepted by either pipeline.
const MAX_PROMPT_CHARS: usize = 5_000;

/// First-prompt chat names are cut at this many characters.
const CHAT_NAME_CHARS: usize = 50;

/// POST /api/chats/{chat_id}/messages/text
///
/// Runs the text pipeline: preconditions, completion call, then the
/// exchange lands in one transaction before the account is charged.
pub async fn send_text_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<TextMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    validate_prompt(&req.prompt)?;
    let setup = prepare_exchange(&state, &claims, chat_id, &req.prompt, TEXT_MESSAGE_COST).await?;

    let reply_text = state.completions.complete(&req.prompt).await.map_err(|e| {
        warn!("Completion failed for chat {chat_id}: {e}");
        ApiError::Provider(e)
    })?;

    let reply_id = Uuid::new_v4();
    let user_msg = NewMessage {
        id: Uuid::new_v4().to_string(),
        role: MessageRole::User.as_str().to_string(),
        content: req.prompt.clone(),
        is_image: false,
        is_published: None,
    };
    let reply_msg = NewMessage {
        id: reply_id.to_string(),
        role: MessageRole::Assistant.as_str().to_string(),
        content: reply_text.clone(),
        is_image: false,
        is_published: None,
    };

    let db = state.clone();
    let chat_key = chat_id.to_string();
    let user_id = claims.sub.to_string();
    let new_name = setup.new_name.clone();
    blocking(move || {
        // The exchange lands before the charge.
        db.db
            .append_exchange(&chat_key, &user_msg, &reply_msg, new_name.as_deref())
            .map_err(db_error)?;
        db.db
            .decrement_credits(&user_id, TEXT_MESSAGE_COST)
            .map_err(db_error)
    })
    .await?;

    Ok(Json(SendMessageResponse {
        success: true,
        reply: MessageView {
            id: reply_id,
            role: MessageRole::Assistant,
            content: reply_text,
            is_image: false,
            is_published: None,
            created_at: Utc::now(),
        },
    }))
}

/// POST /api/chats/{chat_id}/messages/image
///
/// Image pipeline: generate, upload to storage, persist the exchange,
/// optionally publish to the community gallery, then charge. A provider
/// failure at any stage leaves the chat and the balance untouched.
pub async fn send_image_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<ImageMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    validate_prompt(&req.prompt)?;
    let setup = prepare_exchange(&state, &claims, chat_id, &req.prompt, IMAGE_MESSAGE_COST).await?;

    debug!("Generating image for chat {chat_id}");
    let payload = state.images.generate(&req.prompt).await.map_err(|e| {
        warn!("Image generation failed for chat {chat_id}: {e}");
        ApiError::Provider(e)
    })?;
    debug!("Generated {} bytes for chat {chat_id}, uploading", payload.len());

    let stored = state.images.upload(&payload).await.map_err(|e| {
        warn!("Image upload failed for chat {chat_id}: {e}");
        ApiError::Provider(e)
    })?;
    info!("Image stored for chat {chat_id} at {}", stored.url);

    let publish = req.publish;
    let reply_id = Uuid::new_v4();
    let user_msg = NewMessage {
        id: Uuid::new_v4().to_string(),
        role: MessageRole::User.as_str().to_string(),
        content: req.prompt.clone(),
        is_image: false,
        is_published: None,
    };
    let reply_msg = NewMessage {
        id: reply_id.to_string(),
        role: MessageRole::Assistant.as_str().to_string(),
        content: stored.url.clone(),
        is_image: true,
        is_published: Some(publish),
    };

    let db = state.clone();
    let chat_key = chat_id.to_string();
    let user_id = claims.sub.to_string();
    let user_name = setup.user_name.clone();
    let prompt = req.prompt.clone();
    let image_url = stored.url.clone();
    let new_name = setup.new_name.clone();
    blocking(move || {
        db.db
            .append_exchange(&chat_key, &user_msg, &reply_msg, new_name.as_deref())
            .map_err(db_error)?;

        // Gallery publication is best-effort; a failure here never fails
        // the exchange that was already persisted.
        if publish {
            if let Err(e) = db.db.upsert_community_image(
                &Uuid::new_v4().to_string(),
                &image_url,
                &user_id,
                &user_name,
                &prompt,
            ) {
                warn!("Failed to publish image to the community gallery: {e:#}");
            }
        }

        db.db
            .decrement_credits(&user_id, IMAGE_MESSAGE_COST)
            .map_err(db_error)
    })
    .await?;

    Ok(Json(SendMessageResponse {
        success: true,
        reply: MessageView {
            id: reply_id,
            role: MessageRole::Assistant,
            content: stored.url,
            is_image: true,
            is_published: Some(publish),
            created_at: Utc::now(),
        },
    }))
}

/// POST /api/chats/{chat_id}/images/publish
pub async fn publish_image(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<PublishImageRequest>,
) -> Result<Json<Ack>, ApiError> {
    let image_url = req.image_url.trim().to_string();
    if image_url.is_empty() {
        return Err(ApiError::BadRequest("Image URL is required".to_string()));
    }

    let db = state.clone();
    let chat_key = chat_id.to_string();
    let user_id = claims.sub.to_string();
    let user_name = claims.name.clone();
    blocking(move || {
        db.db
            .get_chat(&chat_key, &user_id)
            .map_err(db_error)?
            .ok_or_else(|| ApiError::NotFound("Chat not found".to_string()))?;

        let message = db
            .db
            .find_image_message(&chat_key, &image_url)
            .map_err(db_error)?
            .ok_or_else(|| ApiError::NotFound("Image not found in this chat".to_string()))?;

        db.db.publish_image_message(&message.id).map_err(db_error)?;

        // Late publications never captured the original prompt; the stored
        // URL stands in for it.
        db.db
            .upsert_community_image(
                &Uuid::new_v4().to_string(),
                &image_url,
                &user_id,
                &user_name,
                &message.content,
            )
            .map_err(db_error)
    })
    .await?;

    Ok(Json(Ack::ok("Image published to the community gallery")))
}

/// POST /api/chats/{chat_id}/images/delete
pub async fn delete_image(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<DeleteImageRequest>,
) -> Result<Json<Ack>, ApiError> {
    let image_url = req.image_url.trim().to_string();
    if image_url.is_empty() {
        return Err(ApiError::BadRequest("Image URL is required".to_string()));
    }

    let db = state.clone();
    let chat_key = chat_id.to_string();
    let user_id = claims.sub.to_string();
    let was_published = blocking(move || {
        db.db
            .get_chat(&chat_key, &user_id)
            .map_err(db_error)?
            .ok_or_else(|| ApiError::NotFound("Chat not found".to_string()))?;

        db.db
            .delete_image_message(&chat_key, &image_url)
            .map_err(db_error)?
            .ok_or_else(|| ApiError::NotFound("Image not found in this chat".to_string()))
    })
    .await?;

    // Published copies stay in the gallery; deletion only touches the chat.
    let message = if was_published {
        "Image deleted from chat (remains in community)"
    } else {
        "Image deleted successfully"
    };
    Ok(Json(Ack::ok(message)))
}

// -- Pipeline preconditions --

struct ExchangeSetup {
    user_name: String,
    /// Set when this is the first prompt of a chat still carrying the
    /// default name.
    new_name: Option<String>,
}

/// Checks everything both pipelines need before any provider is called.
/// The chat lookup runs first, so a bad chat id reads as 404 rather than
/// a credit failure.
async fn prepare_exchange(
    state: &AppState,
    claims: &Claims,
    chat_id: Uuid,
    prompt: &str,
    cost: i64,
) -> Result<ExchangeSetup, ApiError> {
    let db = state.clone();
    let user_id = claims.sub.to_string();
    let chat_key = chat_id.to_string();
    let prompt = prompt.to_string();

    blocking(move || {
        let chat = db
            .db
            .get_chat(&chat_key, &user_id)
            .map_err(db_error)?
            .ok_or_else(|| ApiError::NotFound("Chat not found".to_string()))?;

        let user = db
            .db
            .get_user_by_id(&user_id)
            .map_err(db_error)?
            .ok_or_else(|| ApiError::Unauthorized("Not authorized, token failed".to_string()))?;

        if user.credits < cost {
            return Err(ApiError::InsufficientCredits);
        }

        let new_name = if chat.name == DEFAULT_CHAT_NAME {
            let count = db.db.count_messages(&chat_key).map_err(db_error)?;
            (count == 0).then(|| derive_chat_name(&prompt))
        } else {
            None
        };

        Ok(ExchangeSetup {
            user_name: user.name,
            new_name,
        })
    })
    .await
}

fn validate_prompt(prompt: &str) -> Result<(), ApiError> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest("Prompt is required".to_string()));
    }
    if trimmed.chars().count() > MAX_PROMPT_CHARS {
        return Err(ApiError::BadRequest("Prompt is too long".to_string()));
    }
    Ok(())
}

/// Up to 50 characters of the prompt, trimmed, with an ellipsis only when
/// the prompt was actually cut.
fn derive_chat_name(prompt: &str) -> String {
    let head: String = prompt.chars().take(CHAT_NAME_CHARS).collect();
    let mut name = head.trim().to_string();
    if prompt.chars().count() > CHAT_NAME_CHARS {
        name.push_str("...");
    }
    name
}
