use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use muse_api::limit::RateLimiter;
use muse_api::state::{AppState, AppStateInner};
use muse_providers::completion::OpenAiCompletions;
use muse_providers::image::{ImageKitClient, UnconfiguredImages};
use muse_providers::mail::{HttpMailer, NoopMailer};
use muse_providers::{CompletionProvider, ImageProvider, Mailer};

mod cleanup;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "muse=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("MUSE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    if jwt_secret == "dev-secret-change-me" {
        warn!("MUSE_JWT_SECRET is not set; using the development default");
    }
    let db_path = std::env::var("MUSE_DB_PATH").unwrap_or_else(|_| "muse.db".into());
    let host = std::env::var("MUSE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("MUSE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let client_url =
        std::env::var("MUSE_CLIENT_URL").unwrap_or_else(|_| "http://localhost:5173".into());

    // Init database
    let db = muse_db::Database::open(&PathBuf::from(&db_path))?;

    // Shared state
    let state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret,
        client_url,
        completions: completions_from_env(),
        images: images_from_env(),
        mailer: mailer_from_env(),
        // One generation per user per 10 seconds.
        image_limiter: RateLimiter::new(Duration::from_secs(10), 1),
        // One verification re-send per email per 2 minutes.
        resend_limiter: RateLimiter::new(Duration::from_secs(120), 1),
    });

    // Expired signups are swept in the background.
    tokio::spawn(cleanup::purge_pending_loop(state.clone()));

    let app = muse_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Muse server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn completions_from_env() -> Arc<dyn CompletionProvider> {
    let base_url = std::env::var("MUSE_COMPLETIONS_URL")
        .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta/openai".into());
    let model =
        std::env::var("MUSE_COMPLETIONS_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".into());
    let api_key = std::env::var("MUSE_COMPLETIONS_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        warn!("MUSE_COMPLETIONS_API_KEY is not set; completion requests will fail");
    }

    Arc::new(OpenAiCompletions::new(base_url, api_key, model))
}

fn images_from_env() -> Arc<dyn ImageProvider> {
    let endpoint = std::env::var("MUSE_IMAGEKIT_URL_ENDPOINT").unwrap_or_default();
    let private_key = std::env::var("MUSE_IMAGEKIT_PRIVATE_KEY").unwrap_or_default();
    let folder = std::env::var("MUSE_IMAGEKIT_FOLDER").unwrap_or_else(|_| "muse-images".into());

    if endpoint.is_empty() || private_key.is_empty() {
        warn!(
            "ImageKit credentials are not set (MUSE_IMAGEKIT_URL_ENDPOINT, \
             MUSE_IMAGEKIT_PRIVATE_KEY); image generation is disabled"
        );
        return Arc::new(UnconfiguredImages);
    }

    Arc::new(ImageKitClient::new(endpoint, private_key, folder))
}

fn mailer_from_env() -> Arc<dyn Mailer> {
    let api_url = std::env::var("MUSE_MAIL_API_URL").unwrap_or_default();
    let api_key = std::env::var("MUSE_MAIL_API_KEY").unwrap_or_default();
    let from =
        std::env::var("MUSE_MAIL_FROM").unwrap_or_else(|_| "Muse <no-reply@muse.local>".into());

    if api_url.is_empty() || api_key.is_empty() {
        warn!("Mail API credentials are not set; outgoing mail will only be logged");
        return Arc::new(NoopMailer);
    }

    Arc::new(HttpMailer::new(api_url, api_key, from))
}
