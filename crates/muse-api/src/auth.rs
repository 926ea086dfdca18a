use std::time::Instant;

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use axum::Json;
use axum::extract::State;
use jsonwebtoken::{EncodingKey, Header, encode};
use muse_db::models::Promotion;
use muse_types::api::{
    Ack, Claims, ForgotPasswordRequest, LoginRequest, LoginResponse, RegisterRequest,
    ResendVerificationRequest, ResetPasswordRequest, VerifyEmailRequest,
};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::blocking;
use crate::error::{ApiError, db_error};
use crate::limit::RateDecision;
use crate::state::AppState;

/// POST /api/auth/register
///
/// Creates a pending registration and mails a verification link. The
/// account itself only exists once the link is redeemed.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Ack>, ApiError> {
    let name = req.name.trim().to_string();
    let email = req.email.trim().to_lowercase();

    if name.is_empty() || email.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest("Missing details".to_string()));
    }
    if !email.contains('@') {
        return Err(ApiError::BadRequest(
            "Please enter a valid email address".to_string(),
        ));
    }
    if req.password.len() < 8 {
        return Err(ApiError::BadRequest(
            "Password must be at least 8 characters".to_string(),
        ));
    }

    let password_hash = hash_password(&req.password)?;
    let token = generate_token();
    let token_hash = hash_token(&token);

    let db = state.clone();
    let reg_email = email.clone();
    blocking(move || {
        if db.db.get_user_by_email(&reg_email).map_err(db_error)?.is_some() {
            return Err(ApiError::BadRequest("User already exists".to_string()));
        }
        // Registering again before verifying replaces the pending signup,
        // so only the latest mailed link works.
        db.db
            .upsert_pending_registration(
                &Uuid::new_v4().to_string(),
                &name,
                &reg_email,
                &password_hash,
                &token_hash,
            )
            .map_err(db_error)
    })
    .await?;

    send_verification_mail(&state, &email, &token);
    info!("Registration pending for {email}");

    Ok(Json(Ack::ok(
        "Registration successful. Please check your email to verify your account.",
    )))
}

/// POST /api/auth/verify-email
pub async fn verify_email(
    State(state): State<AppState>,
    Json(req): Json<VerifyEmailRequest>,
) -> Result<Json<Ack>, ApiError> {
    let token = req.token.trim().to_string();
    if token.is_empty() {
        return Err(ApiError::BadRequest(
            "Verification token is required".to_string(),
        ));
    }

    let token_hash = hash_token(&token);
    let db = state.clone();
    let outcome = blocking(move || {
        db.db
            .promote_pending(&token_hash, &Uuid::new_v4().to_string())
            .map_err(db_error)
    })
    .await?;

    match outcome {
        Promotion::Invalid => Err(ApiError::BadRequest(
            "Invalid or expired verification link. Please register again.".to_string(),
        )),
        Promotion::AlreadyVerified | Promotion::Promoted => Ok(Json(Ack::ok(
            "Email verified successfully. You can now log in.",
        ))),
    }
}

/// POST /api/auth/resend-verification
///
/// Rotates the pending token and mails a fresh link, at most once per
/// window per email. Unknown addresses get the same answer as known ones.
pub async fn resend_verification(
    State(state): State<AppState>,
    Json(req): Json<ResendVerificationRequest>,
) -> Result<Json<Ack>, ApiError> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() {
        return Err(ApiError::BadRequest("Email is required".to_string()));
    }

    let db = state.clone();
    let lookup_email = email.clone();
    let (user, pending) = blocking(move || {
        let user = db.db.get_user_by_email(&lookup_email).map_err(db_error)?;
        let pending = db.db.get_pending_by_email(&lookup_email).map_err(db_error)?;
        Ok((user, pending))
    })
    .await?;

    if user.is_some() {
        return Ok(Json(Ack::ok(
            "This account is already verified. Please log in.",
        )));
    }
    if pending.is_none() {
        return Ok(Json(Ack::ok(
            "If a registration exists for this email, a new verification link has been sent.",
        )));
    }

    if let RateDecision::Throttled { retry_after_secs } =
        state.resend_limiter.check_and_record(&email, Instant::now())
    {
        return Err(ApiError::RateLimited { retry_after_secs });
    }

    let token = generate_token();
    let token_hash = hash_token(&token);
    let db = state.clone();
    let rotate_email = email.clone();
    blocking(move || {
        db.db
            .rotate_pending_token(&rotate_email, &token_hash)
            .map_err(db_error)
    })
    .await?;

    send_verification_mail(&state, &email, &token);

    Ok(Json(Ack::ok(
        "If a registration exists for this email, a new verification link has been sent.",
    )))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "Email and password are required".to_string(),
        ));
    }

    let db = state.clone();
    let lookup_email = email.clone();
    let (user, pending) = blocking(move || {
        let user = db.db.get_user_by_email(&lookup_email).map_err(db_error)?;
        let pending = db.db.get_pending_by_email(&lookup_email).map_err(db_error)?;
        Ok((user, pending))
    })
    .await?;

    let Some(user) = user else {
        // A pending signup gets pointed at verification rather than the
        // generic failure, so the client can offer a re-send.
        if pending.is_some() {
            return Err(ApiError::EmailUnverified);
        }
        return Err(ApiError::Unauthorized(
            "Invalid email or password".to_string(),
        ));
    };

    if !user.is_verified {
        return Err(ApiError::EmailUnverified);
    }

    if !verify_password(&user.password, &req.password) {
        return Err(ApiError::Unauthorized(
            "Invalid email or password".to_string(),
        ));
    }

    let token = create_token(&state.jwt_secret, &user.id, &user.name)?;
    debug!("Login for {}", user.email);

    Ok(Json(LoginResponse {
        success: true,
        token,
    }))
}

/// POST /api/auth/forgot-password
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(req): Json<ForgotPasswordRequest>,
) -> Result<Json<Ack>, ApiError> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() {
        return Err(ApiError::BadRequest("Email is required".to_string()));
    }

    let db = state.clone();
    let lookup_email = email.clone();
    let user = blocking(move || db.db.get_user_by_email(&lookup_email).map_err(db_error)).await?;

    if let Some(user) = user {
        let token = generate_token();
        let token_hash = hash_token(&token);
        let db = state.clone();
        let user_id = user.id.clone();
        blocking(move || db.db.set_reset_token(&user_id, &token_hash).map_err(db_error)).await?;
        send_reset_mail(&state, &email, &token);
    }

    // Uniform answer; the caller never learns whether the account exists.
    Ok(Json(Ack::ok(
        "If that email is registered, a password reset link has been sent.",
    )))
}

/// POST /api/auth/reset-password
pub async fn reset_password(
    State(state): State<AppState>,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<Json<Ack>, ApiError> {
    let token = req.token.trim().to_string();
    if token.is_empty() {
        return Err(ApiError::BadRequest("Reset token is required".to_string()));
    }
    if req.password.len() < 8 {
        return Err(ApiError::BadRequest(
            "Password must be at least 8 characters".to_string(),
        ));
    }

    let token_hash = hash_token(&token);
    let password_hash = hash_password(&req.password)?;

    let db = state.clone();
    let changed = blocking(move || {
        db.db
            .reset_password_with_token(&token_hash, &password_hash)
            .map_err(db_error)
    })
    .await?;

    if !changed {
        return Err(ApiError::BadRequest(
            "Invalid or expired reset link. Please request a new one.".to_string(),
        ));
    }

    Ok(Json(Ack::ok(
        "Password has been reset successfully. You can now log in.",
    )))
}

// -- Outgoing mail --

/// Mail goes out on a detached task; the request never waits on the mail
/// backend.
fn send_verification_mail(state: &AppState, email: &str, token: &str) {
    let mailer = state.mailer.clone();
    let to = email.to_string();
    let link = format!("{}/verify-email?token={}", state.client_url, token);
    tokio::spawn(async move {
        let body = format!(
            "Welcome to Muse!\n\nVerify your email to activate your account:\n{link}\n\nThe link expires in 24 hours."
        );
        if let Err(e) = mailer.send(&to, "Verify your Muse account", &body).await {
            error!("Failed to send verification email to {to}: {e}");
        }
    });
}

fn send_reset_mail(state: &AppState, email: &str, token: &str) {
    let mailer = state.mailer.clone();
    let to = email.to_string();
    let link = format!("{}/reset-password?token={}", state.client_url, token);
    tokio::spawn(async move {
        let body = format!(
            "A password reset was requested for your Muse account.\n\nSet a new password here:\n{link}\n\nThe link expires in 1 hour. If this wasn't you, ignore this email."
        );
        if let Err(e) = mailer.send(&to, "Reset your Muse password", &body).await {
            error!("Failed to send reset email to {to}: {e}");
        }
    });
}

// -- Credentials --

fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            error!("Failed to hash password: {e}");
            ApiError::Internal
        })
}

fn verify_password(stored_hash: &str, password: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            error!("Stored password hash failed to parse: {e}");
            false
        }
    }
}

// -- Tokens --

/// Random 256-bit link token. Only its SHA-256 lands in the database, so
/// a leaked table cannot redeem anything.
fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn create_token(secret: &str, user_id: &str, name: &str) -> Result<String, ApiError> {
    let sub: Uuid = user_id.parse().map_err(|e| {
        error!("Corrupt user id '{user_id}' while issuing a token: {e}");
        ApiError::Internal
    })?;

    let claims = Claims {
        sub,
        name: name.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        error!("Failed to sign token: {e}");
        ApiError::Internal
    })
}
