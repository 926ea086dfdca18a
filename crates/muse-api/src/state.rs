use std::sync::Arc;

use muse_db::Database;
use muse_providers::{CompletionProvider, ImageProvider, Mailer};

use crate::limit::RateLimiter;

pub type AppState = Arc<AppStateInner>;

/// Everything the handlers need, injected once at startup. Providers sit
/// behind trait objects so tests can swap in stubs without touching the
/// router.
pub struct AppStateInner {
    pub db: Database,
    pub jwt_secret: String,
    /// Base URL of the web client, used to build links in outgoing mail.
    pub client_url: String,
    pub completions: Arc<dyn CompletionProvider>,
    pub images: Arc<dyn ImageProvider>,
    pub mailer: Arc<dyn Mailer>,
    /// Guards the image generation route.
    pub image_limiter: RateLimiter,
    /// Guards verification mail re-sends, keyed per email.
    pub resend_limiter: RateLimiter,
}
