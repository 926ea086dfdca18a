use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                  TEXT PRIMARY KEY,
            name                TEXT NOT NULL,
            email               TEXT NOT NULL UNIQUE,
            password            TEXT NOT NULL,
            credits             INTEGER NOT NULL DEFAULT 20,
            is_verified         INTEGER NOT NULL DEFAULT 1,
            reset_token         TEXT,
            reset_token_expires TEXT,
            created_at          TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Signups awaiting email verification. Promoted into users on a valid
        -- token; swept by the server's cleanup task once expired.
        CREATE TABLE IF NOT EXISTS pending_registrations (
            id                  TEXT PRIMARY KEY,
            name                TEXT NOT NULL,
            email               TEXT NOT NULL UNIQUE,
            password            TEXT NOT NULL,
            verification_token  TEXT NOT NULL,
            expires_at          TEXT NOT NULL,
            created_at          TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_pending_token
            ON pending_registrations(verification_token);

        CREATE TABLE IF NOT EXISTS chats (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            name        TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_chats_user
            ON chats(user_id, updated_at);

        -- Insertion order (rowid) is the chronological order within a chat;
        -- created_at is second-resolution display metadata only.
        CREATE TABLE IF NOT EXISTS messages (
            id           TEXT PRIMARY KEY,
            chat_id      TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            role         TEXT NOT NULL,
            content      TEXT NOT NULL,
            is_image     INTEGER NOT NULL DEFAULT 0,
            is_published INTEGER,
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id);

        -- Gallery rows outlive the chats they came from. image_url is the
        -- upsert key so re-publishing the same asset never duplicates.
        CREATE TABLE IF NOT EXISTS community_images (
            id           TEXT PRIMARY KEY,
            image_url    TEXT NOT NULL UNIQUE,
            user_id      TEXT NOT NULL,
            user_name    TEXT NOT NULL,
            prompt       TEXT NOT NULL,
            published_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_community_published
            ON community_images(published_at);

        CREATE INDEX IF NOT EXISTS idx_community_creator
            ON community_images(user_name);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
