/// Database row types — these map directly to SQLite rows.
/// Distinct from muse-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password: String,
    pub credits: i64,
    pub is_verified: bool,
    pub reset_token: Option<String>,
    pub reset_token_expires: Option<String>,
    pub created_at: String,
}

pub struct PendingRegistrationRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password: String,
    pub verification_token: String,
    pub expires_at: String,
    pub created_at: String,
}

pub struct ChatRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub role: String,
    pub content: String,
    pub is_image: bool,
    pub is_published: Option<bool>,
    pub created_at: String,
}

/// Message about to be inserted; created_at is assigned by SQLite.
pub struct NewMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub is_image: bool,
    pub is_published: Option<bool>,
}

pub struct CommunityImageRow {
    pub id: String,
    pub image_url: String,
    pub user_id: String,
    pub user_name: String,
    pub prompt: String,
    pub published_at: String,
}

pub struct CreatorRow {
    pub user_name: String,
    pub image_count: i64,
    pub latest_published_at: String,
}

/// Outcome of redeeming a verification token.
pub enum Promotion {
    /// No pending registration matches, or the token expired.
    Invalid,
    /// A verified account already exists for the email; the pending row is
    /// dropped and verification answers success.
    AlreadyVerified,
    /// Account created.
    Promoted,
}
