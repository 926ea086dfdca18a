use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use muse_db::Database;
use muse_providers::{CompletionProvider, ImageProvider, Mailer, ProviderError, StoredImage};
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::limit::RateLimiter;
use crate::state::{AppState, AppStateInner};

// -- Provider stubs --

struct StubCompletions;

#[async_trait]
impl CompletionProvider for StubCompletions {
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        Ok(format!("echo: {prompt}"))
    }
}

struct FailingCompletions;

#[async_trait]
impl CompletionProvider for FailingCompletions {
    async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Transport("connection reset by peer".into()))
    }
}

struct StubImages {
    uploads: AtomicUsize,
}

impl StubImages {
    fn new() -> Self {
        StubImages {
            uploads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ImageProvider for StubImages {
    async fn generate(&self, _prompt: &str) -> Result<Vec<u8>, ProviderError> {
        Ok(vec![0xAB; 4096])
    }

    async fn upload(&self, _payload: &[u8]) -> Result<StoredImage, ProviderError> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(StoredImage {
            url: format!("https://cdn.test/generated-{n}.png"),
        })
    }
}

struct BrokenImages;

#[async_trait]
impl ImageProvider for BrokenImages {
    async fn generate(&self, _prompt: &str) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::NotReady("generation is being prepared".into()))
    }

    async fn upload(&self, _payload: &[u8]) -> Result<StoredImage, ProviderError> {
        Err(ProviderError::NotReady("generation is being prepared".into()))
    }
}

/// Captures outgoing mail so tests can fish tokens out of the links.
#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<(String, String, String)>>,
}

impl RecordingMailer {
    fn mail_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn token_at(&self, index: usize) -> String {
        let sent = self.sent.lock().unwrap();
        extract_token(&sent[index].2)
    }

    fn last_token(&self) -> String {
        let sent = self.sent.lock().unwrap();
        let (_, _, body) = sent.last().expect("no mail recorded");
        extract_token(body)
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), ProviderError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

fn extract_token(body: &str) -> String {
    let start = body.find("token=").expect("no token in mail body") + "token=".len();
    body[start..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect()
}

// -- Harness --

struct TestApp {
    app: Router,
    state: AppState,
    mailer: Arc<RecordingMailer>,
}

fn test_app() -> TestApp {
    test_app_with(Arc::new(StubCompletions), Arc::new(StubImages::new()))
}

fn test_app_with(
    completions: Arc<dyn CompletionProvider>,
    images: Arc<dyn ImageProvider>,
) -> TestApp {
    let mailer = Arc::new(RecordingMailer::default());
    let state: AppState = Arc::new(AppStateInner {
        db: Database::open_in_memory().expect("in-memory db"),
        jwt_secret: "test-secret".to_string(),
        client_url: "http://localhost:5173".to_string(),
        completions,
        images,
        mailer: mailer.clone(),
        image_limiter: RateLimiter::new(Duration::from_secs(10), 1),
        resend_limiter: RateLimiter::new(Duration::from_secs(120), 1),
    });

    TestApp {
        app: crate::router(state.clone()),
        state,
        mailer,
    }
}

async fn request(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

/// Mail goes out on a detached task; yield until it lands.
async fn wait_for_mail(mailer: &RecordingMailer, at_least: usize) {
    for _ in 0..100 {
        if mailer.mail_count() >= at_least {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!(
        "expected {at_least} mails, got {}",
        mailer.mail_count()
    );
}

/// Register, verify via the mailed token, log in. Returns the JWT.
async fn sign_up(t: &TestApp, name: &str, email: &str) -> String {
    let mails_before = t.mailer.mail_count();
    let (status, body) = request(
        &t.app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({ "name": name, "email": email, "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "register failed: {body}");

    wait_for_mail(&t.mailer, mails_before + 1).await;
    let token = t.mailer.last_token();
    let (status, body) = request(
        &t.app,
        "POST",
        "/api/auth/verify-email",
        None,
        Some(json!({ "token": token })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "verify failed: {body}");

    log_in(t, email).await
}

async fn log_in(t: &TestApp, email: &str) -> String {
    let (status, body) = request(
        &t.app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": email, "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body["token"].as_str().expect("login token").to_string()
}

async fn create_chat(t: &TestApp, token: &str) -> String {
    let (status, _) = request(&t.app, "POST", "/api/chats", Some(token), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = request(&t.app, "GET", "/api/chats", Some(token), None).await;
    assert_eq!(status, StatusCode::OK);
    body["chats"][0]["id"].as_str().expect("chat id").to_string()
}

async fn credits(t: &TestApp, token: &str) -> i64 {
    let (status, body) = request(&t.app, "GET", "/api/user/me", Some(token), None).await;
    assert_eq!(status, StatusCode::OK);
    body["user"]["credits"].as_i64().expect("credits")
}

/// Debits the account down to `leave` credits, directly through the store.
async fn drain_credits(t: &TestApp, token: &str, leave: i64) {
    let (_, body) = request(&t.app, "GET", "/api/user/me", Some(token), None).await;
    let id = body["user"]["id"].as_str().unwrap().to_string();
    let current = body["user"]["credits"].as_i64().unwrap();
    t.state.db.decrement_credits(&id, current - leave).unwrap();
}

// -- Auth --

#[tokio::test]
async fn registration_flow_verifies_then_logs_in() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;

    let (status, body) = request(&t.app, "GET", "/api/user/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["user"]["name"], "Ada");
    assert_eq!(body["user"]["email"], "ada@example.com");
    assert_eq!(body["user"]["credits"], 20);
    assert_eq!(body["user"]["is_verified"], true);
}

#[tokio::test]
async fn login_before_verification_asks_for_verification() {
    let t = test_app();
    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({ "name": "Bo", "email": "bo@example.com", "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request(
        &t.app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "bo@example.com", "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);
    assert_eq!(body["needs_verification"], true);
}

#[tokio::test]
async fn wrong_password_and_unknown_email_fail_alike() {
    let t = test_app();
    sign_up(&t, "Ada", "ada@example.com").await;

    let (status, body) = request(
        &t.app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "ada@example.com", "password": "wrong-password" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let wrong_password_message = body["message"].clone();

    let (status, body) = request(
        &t.app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "nobody@example.com", "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], wrong_password_message);
}

#[tokio::test]
async fn register_rejects_an_existing_account_email() {
    let t = test_app();
    sign_up(&t, "Ada", "ada@example.com").await;

    let (status, body) = request(
        &t.app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({ "name": "Imp", "email": "ada@example.com", "password": "password456" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "User already exists");
}

#[tokio::test]
async fn verification_rejects_unknown_tokens() {
    let t = test_app();
    let (status, body) = request(
        &t.app,
        "POST",
        "/api/auth/verify-email",
        None,
        Some(json!({ "token": "deadbeef" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn resend_rotates_the_token_and_is_throttled_per_email() {
    let t = test_app();
    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({ "name": "Bo", "email": "bo@example.com", "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_mail(&t.mailer, 1).await;

    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/resend-verification",
        None,
        Some(json!({ "email": "bo@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_mail(&t.mailer, 2).await;

    // The first link is dead once a new one goes out.
    let old_token = t.mailer.token_at(0);
    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/verify-email",
        None,
        Some(json!({ "token": old_token })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let new_token = t.mailer.token_at(1);
    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/verify-email",
        None,
        Some(json!({ "token": new_token })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Another registration, immediately re-sent: throttled.
    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({ "name": "Cy", "email": "cy@example.com", "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_mail(&t.mailer, 3).await;

    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/resend-verification",
        None,
        Some(json!({ "email": "cy@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_mail(&t.mailer, 4).await;

    let (status, body) = request(
        &t.app,
        "POST",
        "/api/auth/resend-verification",
        None,
        Some(json!({ "email": "cy@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["retry_after"].as_u64().unwrap() >= 1);

    // Unknown addresses get the generic answer and no mail.
    let mails = t.mailer.mail_count();
    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/resend-verification",
        None,
        Some(json!({ "email": "ghost@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.mailer.mail_count(), mails);
}

#[tokio::test]
async fn password_reset_flow_mints_a_new_password() {
    let t = test_app();
    sign_up(&t, "Ada", "ada@example.com").await;
    let mails = t.mailer.mail_count();

    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/forgot-password",
        None,
        Some(json!({ "email": "ada@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_mail(&t.mailer, mails + 1).await;

    let reset_token = t.mailer.last_token();
    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/reset-password",
        None,
        Some(json!({ "token": reset_token, "password": "new-password-9" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Old password dead, new one works.
    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "ada@example.com", "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": "ada@example.com", "password": "new-password-9" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The token was consumed by the reset.
    let (status, _) = request(
        &t.app,
        "POST",
        "/api/auth/reset-password",
        None,
        Some(json!({ "token": reset_token, "password": "another-pass-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn forgot_password_answers_uniformly_for_unknown_emails() {
    let t = test_app();
    sign_up(&t, "Ada", "ada@example.com").await;
    let mails = t.mailer.mail_count();

    let (status, known) = request(
        &t.app,
        "POST",
        "/api/auth/forgot-password",
        None,
        Some(json!({ "email": "ada@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, unknown) = request(
        &t.app,
        "POST",
        "/api/auth/forgot-password",
        None,
        Some(json!({ "email": "ghost@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(known["message"], unknown["message"]);

    // Only the real account got mail.
    wait_for_mail(&t.mailer, mails + 1).await;
    assert_eq!(t.mailer.mail_count(), mails + 1);
}

#[tokio::test]
async fn protected_routes_reject_missing_and_garbage_tokens() {
    let t = test_app();

    let (status, _) = request(&t.app, "GET", "/api/chats", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = request(&t.app, "GET", "/api/chats", Some("not-a-jwt"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// -- Text pipeline --

#[tokio::test]
async fn text_message_charges_one_and_stores_the_exchange() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let (status, body) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/text"),
        Some(&token),
        Some(json!({ "prompt": "Hello there" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["reply"]["role"], "assistant");
    assert_eq!(body["reply"]["content"], "echo: Hello there");
    assert_eq!(body["reply"]["is_image"], false);

    assert_eq!(credits(&t, &token).await, 19);

    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    let messages = body["chats"][0]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "Hello there");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "echo: Hello there");
}

#[tokio::test]
async fn text_message_works_with_exactly_one_credit() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;
    drain_credits(&t, &token, 1).await;

    let (status, _) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/text"),
        Some(&token),
        Some(json!({ "prompt": "last one" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(credits(&t, &token).await, 0);
}

#[tokio::test]
async fn text_message_with_no_credits_is_rejected_without_side_effects() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;
    drain_credits(&t, &token, 0).await;

    let (status, body) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/text"),
        Some(&token),
        Some(json!({ "prompt": "please?" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);

    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    assert_eq!(body["chats"][0]["messages"].as_array().unwrap().len(), 0);
    assert_eq!(credits(&t, &token).await, 0);
}

#[tokio::test]
async fn completion_failure_leaves_no_trace() {
    let t = test_app_with(Arc::new(FailingCompletions), Arc::new(StubImages::new()));
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let (status, body) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/text"),
        Some(&token),
        Some(json!({ "prompt": "Hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .contains("connection reset"),
        "{body}"
    );

    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    assert_eq!(body["chats"][0]["messages"].as_array().unwrap().len(), 0);
    assert_eq!(credits(&t, &token).await, 20);
}

#[tokio::test]
async fn missing_chat_wins_over_missing_credits() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    drain_credits(&t, &token, 0).await;

    let (status, _) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{}/messages/text", Uuid::new_v4()),
        Some(&token),
        Some(json!({ "prompt": "anyone home?" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn empty_prompts_are_rejected() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let (status, _) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/text"),
        Some(&token),
        Some(json!({ "prompt": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(credits(&t, &token).await, 20);
}

#[tokio::test]
async fn chats_are_isolated_between_users() {
    let t = test_app();
    let token_a = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_a = create_chat(&t, &token_a).await;
    let token_b = sign_up(&t, "Bo", "bo@example.com").await;

    let (status, _) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_a}/messages/text"),
        Some(&token_b),
        Some(json!({ "prompt": "peeking" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token_b), None).await;
    assert_eq!(body["chats"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn first_prompt_names_a_short_chat_verbatim() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let prompt = "Explain quicksort in one sentence";
    let (status, _) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/text"),
        Some(&token),
        Some(json!({ "prompt": prompt })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    assert_eq!(body["chats"][0]["name"], "Explain quicksort in one sentence");

    // Later prompts leave the name alone.
    let (status, _) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/text"),
        Some(&token),
        Some(json!({ "prompt": "And in two sentences?" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    assert_eq!(body["chats"][0]["name"], "Explain quicksort in one sentence");
}

#[tokio::test]
async fn first_prompt_longer_than_fifty_chars_is_truncated() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let prompt = "The quick brown fox jumps over the lazy dog again and again";
    let (status, _) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/text"),
        Some(&token),
        Some(json!({ "prompt": prompt })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    assert_eq!(
        body["chats"][0]["name"],
        "The quick brown fox jumps over the lazy dog again..."
    );
}

// -- Image pipeline --

#[tokio::test]
async fn image_message_charges_two_and_can_publish_at_generation() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let (status, body) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/image"),
        Some(&token),
        Some(json!({ "prompt": "a lighthouse at dawn", "publish": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["reply"]["is_image"], true);
    assert_eq!(body["reply"]["is_published"], true);
    let url = body["reply"]["content"].as_str().unwrap().to_string();
    assert!(url.starts_with("https://cdn.test/"));

    assert_eq!(credits(&t, &token).await, 18);

    // Publication is visible on the public wall, prompt included.
    let (status, body) = request(&t.app, "GET", "/api/community/images", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let images = body["images"].as_array().unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0]["image_url"], url.as_str());
    assert_eq!(images[0]["user_name"], "Ada");
    assert_eq!(images[0]["prompt"], "a lighthouse at dawn");
}

#[tokio::test]
async fn unpublished_image_stays_out_of_the_gallery() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let (status, body) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/image"),
        Some(&token),
        Some(json!({ "prompt": "a private sketch" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reply"]["is_published"], false);

    let (_, body) = request(&t.app, "GET", "/api/community/images", None, None).await;
    assert_eq!(body["images"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn failed_generation_leaves_no_message_and_no_charge() {
    let t = test_app_with(Arc::new(StubCompletions), Arc::new(BrokenImages));
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let (status, body) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/image"),
        Some(&token),
        Some(json!({ "prompt": "a lighthouse" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{body}");
    assert_eq!(body["success"], false);

    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    assert_eq!(body["chats"][0]["messages"].as_array().unwrap().len(), 0);
    assert_eq!(credits(&t, &token).await, 20);
}

#[tokio::test]
async fn second_image_inside_the_window_is_throttled() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let (status, _) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/image"),
        Some(&token),
        Some(json!({ "prompt": "first" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/image"),
        Some(&token),
        Some(json!({ "prompt": "second" })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["success"], false);
    assert!(body["retry_after"].as_u64().unwrap() >= 1);

    // Only the first request was charged and stored.
    assert_eq!(credits(&t, &token).await, 18);
    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    assert_eq!(body["chats"][0]["messages"].as_array().unwrap().len(), 2);

    // The window follows the caller; a fresh chat does not reopen it.
    let second_chat = create_chat(&t, &token).await;
    let (status, _) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{second_chat}/messages/image"),
        Some(&token),
        Some(json!({ "prompt": "third" })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(credits(&t, &token).await, 18);

    // The window is per user, not global.
    let token_b = sign_up(&t, "Bo", "bo@example.com").await;
    let chat_b = create_chat(&t, &token_b).await;
    let (status, _) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_b}/messages/image"),
        Some(&token_b),
        Some(json!({ "prompt": "mine" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

// -- Publish and delete --

#[tokio::test]
async fn publishing_an_existing_image_is_idempotent() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let (_, body) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/image"),
        Some(&token),
        Some(json!({ "prompt": "a quiet harbor" })),
    )
    .await;
    let url = body["reply"]["content"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let (status, _) = request(
            &t.app,
            "POST",
            &format!("/api/chats/{chat_id}/images/publish"),
            Some(&token),
            Some(json!({ "image_url": url })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (_, body) = request(&t.app, "GET", "/api/community/images", None, None).await;
    assert_eq!(body["images"].as_array().unwrap().len(), 1);

    // The chat copy now reads as published.
    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    let messages = body["chats"][0]["messages"].as_array().unwrap();
    assert_eq!(messages[1]["is_published"], true);
}

#[tokio::test]
async fn publish_rejects_urls_not_in_the_chat() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let (status, _) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/images/publish"),
        Some(&token),
        Some(json!({ "image_url": "https://cdn.test/not-here.png" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_a_published_image_keeps_the_gallery_copy() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let (_, body) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/image"),
        Some(&token),
        Some(json!({ "prompt": "a shared view", "publish": true })),
    )
    .await;
    let url = body["reply"]["content"].as_str().unwrap().to_string();

    let (status, body) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/images/delete"),
        Some(&token),
        Some(json!({ "image_url": url })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        body["message"].as_str().unwrap().contains("remains in community"),
        "{body}"
    );

    // The image reply is gone from the chat; the prompt stays.
    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    let messages = body["chats"][0]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], "user");

    let (_, body) = request(&t.app, "GET", "/api/community/images", None, None).await;
    assert_eq!(body["images"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn deleting_an_unpublished_image_reports_plain_success() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let (_, body) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/messages/image"),
        Some(&token),
        Some(json!({ "prompt": "a draft" })),
    )
    .await;
    let url = body["reply"]["content"].as_str().unwrap().to_string();

    let (status, body) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/images/delete"),
        Some(&token),
        Some(json!({ "image_url": url })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Image deleted successfully");

    // Already gone.
    let (status, _) = request(
        &t.app,
        "POST",
        &format!("/api/chats/{chat_id}/images/delete"),
        Some(&token),
        Some(json!({ "image_url": url })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// -- Chat management --

#[tokio::test]
async fn chats_can_be_renamed_and_deleted() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    let chat_id = create_chat(&t, &token).await;

    let (status, _) = request(
        &t.app,
        "PATCH",
        &format!("/api/chats/{chat_id}"),
        Some(&token),
        Some(json!({ "name": "Trip planning" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    assert_eq!(body["chats"][0]["name"], "Trip planning");

    let (status, _) = request(
        &t.app,
        "PATCH",
        &format!("/api/chats/{chat_id}"),
        Some(&token),
        Some(json!({ "name": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(
        &t.app,
        "PATCH",
        &format!("/api/chats/{}", Uuid::new_v4()),
        Some(&token),
        Some(json!({ "name": "Ghost" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request(
        &t.app,
        "DELETE",
        &format!("/api/chats/{chat_id}"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    assert_eq!(body["chats"].as_array().unwrap().len(), 0);

    let (status, _) = request(
        &t.app,
        "DELETE",
        &format!("/api/chats/{chat_id}"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_all_chats_clears_the_account() {
    let t = test_app();
    let token = sign_up(&t, "Ada", "ada@example.com").await;
    create_chat(&t, &token).await;
    let (status, _) = request(&t.app, "POST", "/api/chats", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(&t.app, "DELETE", "/api/chats", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = request(&t.app, "GET", "/api/chats", Some(&token), None).await;
    assert_eq!(body["chats"].as_array().unwrap().len(), 0);
}

// -- Community --

#[tokio::test]
async fn creator_board_groups_published_images_by_name() {
    let t = test_app();
    for (id, url) in [
        ("g1", "https://cdn.test/a.png"),
        ("g2", "https://cdn.test/b.png"),
    ] {
        t.state
            .db
            .upsert_community_image(id, url, "u1", "Ada", "a cat")
            .unwrap();
    }
    t.state
        .db
        .upsert_community_image("g3", "https://cdn.test/c.png", "u2", "Bo", "a dog")
        .unwrap();

    let (status, body) = request(&t.app, "GET", "/api/community/creators", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let creators = body["creators"].as_array().unwrap();
    assert_eq!(creators.len(), 2);
    assert_eq!(creators[0]["user_name"], "Ada");
    assert_eq!(creators[0]["image_count"], 2);
    assert_eq!(creators[1]["user_name"], "Bo");
    assert_eq!(creators[1]["image_count"], 1);

    let (status, body) = request(&t.app, "GET", "/api/community/profile/Ada", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_name"], "Ada");
    assert_eq!(body["total_images"], 2);
    assert_eq!(body["images"].as_array().unwrap().len(), 2);

    // An unknown creator is an empty profile, not an error.
    let (status, body) = request(
        &t.app,
        "GET",
        "/api/community/profile/Nobody",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_images"], 0);
}

#[tokio::test]
async fn health_answers_at_the_root() {
    let t = test_app();
    let (status, body) = request(&t.app, "GET", "/", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("Server is running".to_string()));
}
