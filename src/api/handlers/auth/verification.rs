//! Email verification endpoints.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::error::AuthError;
use super::rate_limit::RateLimitAction;
use super::state::AuthState;
use super::storage::{ResendOutcome, consume_verification_token, enqueue_resend_verification};
use super::types::{MessageResponse, ResendVerificationRequest, VerifyEmailRequest};
use super::utils::{extract_client_ip, hash_token, normalize_email, valid_email};

/// Verify the email link by consuming the hashed token and activating the
/// user. Missing, mismatched, and expired tokens share one generic 400.
#[utoipa::path(
    post,
    path = "/v1/auth/verify-email",
    request_body = VerifyEmailRequest,
    responses(
        (status = 204, description = "Email verified"),
        (status = 400, description = "Invalid or expired token", body = MessageResponse),
        (status = 429, description = "Rate limited", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn verify_email(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<VerifyEmailRequest>>,
) -> impl IntoResponse {
    let request: VerifyEmailRequest = match payload {
        Some(Json(payload)) => payload,
        None => return message(StatusCode::BAD_REQUEST, "Missing payload"),
    };

    let token = request.token.trim();
    if token.is_empty() {
        return message(StatusCode::BAD_REQUEST, "Missing token");
    }

    // Rate limits are enforced before any token work to avoid amplification.
    let client_ip = extract_client_ip(&headers);
    let identifier = client_ip.as_deref().unwrap_or("unknown");
    match auth_state
        .rate_limiter()
        .enforce(identifier, RateLimitAction::VerifyEmail)
        .await
    {
        Ok(_) => {}
        Err(AuthError::RateLimitExceeded(result)) => {
            return message(
                StatusCode::TOO_MANY_REQUESTS,
                &format!(
                    "Too many verification attempts. Please try again in {} minutes.",
                    result.retry_after_minutes()
                ),
            );
        }
        Err(err) => {
            error!("Rate limit check failed: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Verification failed");
        }
    }

    // Hash the token before lookup; raw tokens are never stored server-side.
    match consume_verification_token(&pool, &hash_token(token)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(AuthError::InvalidOrExpiredToken) => {
            message(StatusCode::BAD_REQUEST, "Invalid or expired verification token")
        }
        Err(err) => {
            error!("Failed to verify email: {err}");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Verification failed")
        }
    }
}

/// Resend a verification email (always returns 204 to avoid user
/// enumeration).
#[utoipa::path(
    post,
    path = "/v1/auth/resend-verification",
    request_body = ResendVerificationRequest,
    responses(
        (status = 204, description = "Resend accepted")
    ),
    tag = "auth"
)]
pub async fn resend_verification(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ResendVerificationRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return message(StatusCode::BAD_REQUEST, "Missing payload");
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        // Always return 204 for invalid emails to avoid account probing.
        return StatusCode::NO_CONTENT.into_response();
    }

    let client_ip = extract_client_ip(&headers);
    let identifier = client_ip.as_deref().unwrap_or("unknown");
    // Resend is intentionally opaque; rate limits and store errors still
    // return 204.
    match auth_state
        .rate_limiter()
        .enforce(identifier, RateLimitAction::ResendVerification)
        .await
    {
        Ok(_) => {}
        Err(AuthError::RateLimitExceeded(_)) => return StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            error!("Rate limit check failed: {err}");
            return StatusCode::NO_CONTENT.into_response();
        }
    }

    // Email-scoped limit reduces repeated resend attempts for one address
    // from many networks.
    match auth_state
        .rate_limiter()
        .enforce(&email, RateLimitAction::ResendVerification)
        .await
    {
        Ok(_) => {}
        Err(AuthError::RateLimitExceeded(_)) => return StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            error!("Rate limit check failed: {err}");
            return StatusCode::NO_CONTENT.into_response();
        }
    }

    match enqueue_resend_verification(&pool, &email, auth_state.config()).await {
        Ok(ResendOutcome::Queued | ResendOutcome::Cooldown | ResendOutcome::Noop) => {
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            error!("Failed to enqueue resend verification: {err}");
            // Avoid leaking failures; always return 204 to callers.
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

fn message(status: StatusCode, text: &str) -> axum::response::Response {
    (
        status,
        Json(MessageResponse {
            message: text.to_string(),
        }),
    )
        .into_response()
}
