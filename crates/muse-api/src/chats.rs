use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::{Extension, Json};
use muse_db::models::MessageRow;
use muse_types::api::{Ack, ChatView, ChatsResponse, Claims, MessageView, RenameChatRequest};
use muse_types::models::{DEFAULT_CHAT_NAME, MessageRole};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ApiError, db_error};
use crate::state::AppState;
use crate::{blocking, parse_timestamp};

const MAX_CHAT_NAME_CHARS: usize = 100;

/// POST /api/chats
pub async fn create_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Ack>, ApiError> {
    let db = state.clone();
    let user_id = claims.sub.to_string();
    blocking(move || {
        db.db
            .create_chat(&Uuid::new_v4().to_string(), &user_id, DEFAULT_CHAT_NAME)
            .map_err(db_error)
    })
    .await?;

    Ok(Json(Ack::ok("New chat created")))
}

/// GET /api/chats
///
/// Returns every chat of the caller, most recently active first, each
/// with its full message history.
pub async fn get_chats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ChatsResponse>, ApiError> {
    let db = state.clone();
    let user_id = claims.sub.to_string();
    let (chat_rows, message_rows) = blocking(move || {
        let chats = db.db.get_chats_for_user(&user_id).map_err(db_error)?;
        let ids: Vec<String> = chats.iter().map(|chat| chat.id.clone()).collect();
        let messages = db.db.get_messages_for_chats(&ids).map_err(db_error)?;
        Ok((chats, messages))
    })
    .await?;

    let mut by_chat: HashMap<String, Vec<MessageView>> = HashMap::new();
    for row in message_rows {
        let (chat_id, view) = message_view(row);
        by_chat.entry(chat_id).or_default().push(view);
    }

    let chats = chat_rows
        .into_iter()
        .map(|row| {
            let id = row.id.parse().unwrap_or_else(|e| {
                warn!("Corrupt chat id '{}': {e}", row.id);
                Uuid::default()
            });
            let messages = by_chat.remove(&row.id).unwrap_or_default();
            ChatView {
                id,
                name: row.name,
                messages,
                created_at: parse_timestamp(&row.created_at, "chat"),
                updated_at: parse_timestamp(&row.updated_at, "chat"),
            }
        })
        .collect();

    Ok(Json(ChatsResponse {
        success: true,
        chats,
    }))
}

/// PATCH /api/chats/{chat_id}
pub async fn rename_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<RenameChatRequest>,
) -> Result<Json<Ack>, ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Chat name is required".to_string()));
    }
    if name.chars().count() > MAX_CHAT_NAME_CHARS {
        return Err(ApiError::BadRequest("Chat name is too long".to_string()));
    }

    let db = state.clone();
    let user_id = claims.sub.to_string();
    let renamed = blocking(move || {
        db.db
            .rename_chat(&chat_id.to_string(), &user_id, &name)
            .map_err(db_error)
    })
    .await?;

    if !renamed {
        return Err(ApiError::NotFound("Chat not found".to_string()));
    }
    Ok(Json(Ack::ok("Chat renamed successfully")))
}

/// DELETE /api/chats/{chat_id}
pub async fn delete_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(chat_id): Path<Uuid>,
) -> Result<Json<Ack>, ApiError> {
    let db = state.clone();
    let user_id = claims.sub.to_string();
    let deleted = blocking(move || {
        db.db
            .delete_chat(&chat_id.to_string(), &user_id)
            .map_err(db_error)
    })
    .await?;

    if !deleted {
        return Err(ApiError::NotFound("Chat not found".to_string()));
    }
    Ok(Json(Ack::ok("Chat deleted successfully")))
}

/// DELETE /api/chats
pub async fn delete_all_chats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Ack>, ApiError> {
    let db = state.clone();
    let user_id = claims.sub.to_string();
    blocking(move || db.db.delete_all_chats(&user_id).map_err(db_error)).await?;

    Ok(Json(Ack::ok("All chats deleted successfully")))
}

fn message_view(row: MessageRow) -> (String, MessageView) {
    let id = row.id.parse().unwrap_or_else(|e| {
        warn!("Corrupt message id '{}': {e}", row.id);
        Uuid::default()
    });
    let role = row.role.parse().unwrap_or_else(|e| {
        warn!("{e}");
        MessageRole::Assistant
    });
    let created_at = parse_timestamp(&row.created_at, "message");

    (
        row.chat_id,
        MessageView {
            id,
            role,
            content: row.content,
            is_image: row.is_image,
            is_published: row.is_published,
            created_at,
        },
    )
}
