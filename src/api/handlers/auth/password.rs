//! Password endpoints: request a reset link, consume it, and authenticated
//! password change.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::IntoResponse,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, error};

use super::error::AuthError;
use super::rate_limit::RateLimitAction;
use super::state::AuthState;
use super::storage::{
    consume_reset_token, issue_reset_token, lookup_login_record, lookup_session, update_password,
};
use super::types::{
    ChangePasswordRequest, ForgotPasswordRequest, MessageResponse, ResetPasswordRequest,
};
use super::utils::{
    extract_client_ip, hash_password, hash_token, normalize_email, valid_email, valid_password,
    verify_password,
};

const RESET_SENT_MESSAGE: &str =
    "If an account exists, a reset link has been sent to your email";

/// Issue a password reset token and email the link. Always answers with the
/// same generic 200 whether or not the account exists.
#[utoipa::path(
    post,
    path = "/v1/auth/forgot-password",
    request_body = ForgotPasswordRequest,
    responses(
        (status = 200, description = "Generic acknowledgement", body = MessageResponse),
        (status = 400, description = "Invalid payload", body = MessageResponse),
        (status = 429, description = "Rate limited", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn forgot_password(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ForgotPasswordRequest>>,
) -> impl IntoResponse {
    let request: ForgotPasswordRequest = match payload {
        Some(Json(payload)) => payload,
        None => return message(StatusCode::BAD_REQUEST, "Missing payload"),
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return message(StatusCode::BAD_REQUEST, "Invalid email address");
    }

    let client_ip = extract_client_ip(&headers);
    let identifier = client_ip.as_deref().unwrap_or("unknown");
    match auth_state
        .rate_limiter()
        .enforce(identifier, RateLimitAction::ForgotPassword)
        .await
    {
        Ok(_) => {}
        Err(AuthError::RateLimitExceeded(result)) => {
            return message(
                StatusCode::TOO_MANY_REQUESTS,
                &format!(
                    "Too many password reset requests. Please try again in {} minutes.",
                    result.retry_after_minutes()
                ),
            );
        }
        Err(err) => {
            error!("Rate limit check failed: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
    }

    match issue_reset_token(&pool, &email, auth_state.config()).await {
        Ok(issued) => {
            // No-account and issued cases are indistinguishable to callers.
            debug!(issued, "password reset request processed");
            message(StatusCode::OK, RESET_SENT_MESSAGE)
        }
        Err(err) => {
            error!("Failed to issue reset token: {err}");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong")
        }
    }
}

/// Consume a reset token and set the new password. Missing, mismatched, and
/// expired tokens all produce the same generic 400.
#[utoipa::path(
    post,
    path = "/v1/auth/reset-password",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password reset", body = MessageResponse),
        (status = 400, description = "Invalid or expired reset token", body = MessageResponse),
        (status = 429, description = "Rate limited", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn reset_password(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ResetPasswordRequest>>,
) -> impl IntoResponse {
    let request: ResetPasswordRequest = match payload {
        Some(Json(payload)) => payload,
        None => return message(StatusCode::BAD_REQUEST, "Missing payload"),
    };

    let client_ip = extract_client_ip(&headers);
    let identifier = client_ip.as_deref().unwrap_or("unknown");
    match auth_state
        .rate_limiter()
        .enforce(identifier, RateLimitAction::ResetPassword)
        .await
    {
        Ok(_) => {}
        Err(AuthError::RateLimitExceeded(result)) => {
            return message(
                StatusCode::TOO_MANY_REQUESTS,
                &format!(
                    "Too many password reset attempts. Please try again in {} minutes.",
                    result.retry_after_minutes()
                ),
            );
        }
        Err(err) => {
            error!("Rate limit check failed: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
    }

    let token = request.token.trim();
    if token.is_empty() {
        return message(StatusCode::BAD_REQUEST, "Missing token");
    }

    if !valid_password(&request.password) {
        return message(
            StatusCode::BAD_REQUEST,
            "Password must be at least 8 characters with uppercase, lowercase, number, and special character",
        );
    }

    let password = request.password;
    let password_hash = match tokio::task::spawn_blocking(move || hash_password(&password)).await {
        Ok(Ok(hash)) => hash,
        Ok(Err(err)) => {
            error!("Failed to hash password: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
        Err(err) => {
            error!("Password hashing task failed: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
    };

    // Hash the token before lookup; raw tokens are never stored server-side.
    match consume_reset_token(&pool, &hash_token(token), &password_hash).await {
        Ok(()) => message(StatusCode::OK, "Password reset successful"),
        Err(AuthError::InvalidOrExpiredToken) => {
            message(StatusCode::BAD_REQUEST, "Invalid or expired reset token")
        }
        Err(err) => {
            error!("Failed to consume reset token: {err}");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong")
        }
    }
}

/// Change the password for the authenticated user. Requires the current
/// password and is throttled per account.
#[utoipa::path(
    post,
    path = "/v1/auth/change-password",
    request_body = ChangePasswordRequest,
    params(
        ("Authorization" = String, Header, description = "Bearer session token")
    ),
    responses(
        (status = 200, description = "Password changed", body = MessageResponse),
        (status = 400, description = "Invalid payload", body = MessageResponse),
        (status = 401, description = "Missing session or wrong current password", body = MessageResponse),
        (status = 429, description = "Rate limited", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn change_password(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ChangePasswordRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return message(StatusCode::BAD_REQUEST, "Missing payload");
    };

    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let Some(token) = token else {
        return message(StatusCode::UNAUTHORIZED, "Missing session token");
    };

    if !valid_password(&request.new_password) {
        return message(
            StatusCode::BAD_REQUEST,
            "Password must be at least 8 characters with uppercase, lowercase, number, and special character",
        );
    }

    let session = match lookup_session(&pool, &hash_token(token)).await {
        Ok(Some(record)) => record,
        Ok(None) => return message(StatusCode::UNAUTHORIZED, "Invalid or expired session"),
        Err(err) => {
            error!("Failed to lookup session: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
    };

    // Per-account limit: changing passwords is sensitive even when
    // authenticated.
    match auth_state
        .rate_limiter()
        .enforce(&session.email, RateLimitAction::ChangePassword)
        .await
    {
        Ok(_) => {}
        Err(AuthError::RateLimitExceeded(result)) => {
            return message(
                StatusCode::TOO_MANY_REQUESTS,
                &format!(
                    "Too many password change attempts. Please try again in {} minutes.",
                    result.retry_after_minutes()
                ),
            );
        }
        Err(err) => {
            error!("Rate limit check failed: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
    }

    let record = match lookup_login_record(&pool, &session.email).await {
        Ok(Some(record)) => record,
        Ok(None) => return message(StatusCode::UNAUTHORIZED, "Invalid or expired session"),
        Err(err) => {
            error!("Failed to lookup login record: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
    };

    let current_password = request.current_password;
    let stored_hash = record.password_hash.clone();
    let verified = match tokio::task::spawn_blocking(move || {
        verify_password(&current_password, &stored_hash)
    })
    .await
    {
        Ok(verified) => verified,
        Err(err) => {
            error!("Password verification task failed: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
        }
    };
    if !verified {
        return message(StatusCode::UNAUTHORIZED, "Current password is incorrect");
    }

    let new_password = request.new_password;
    let new_password_hash =
        match tokio::task::spawn_blocking(move || hash_password(&new_password)).await {
            Ok(Ok(hash)) => hash,
            Ok(Err(err)) => {
                error!("Failed to hash password: {err}");
                return message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
            }
            Err(err) => {
                error!("Password hashing task failed: {err}");
                return message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong");
            }
        };

    match update_password(&pool, record.user_id, &record.email, &new_password_hash).await {
        Ok(()) => message(StatusCode::OK, "Password changed successfully"),
        Err(err) => {
            error!("Failed to update password: {err}");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong")
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

#[cfg(test)]
mod tests {
    use super::super::rate_limit::{MemoryCounterStore, RateLimiter};
    use super::super::state::{AuthConfig, AuthState};
    use super::{change_password, forgot_password, reset_password};
    use anyhow::Result;
    use axum::Json;
    use axum::extract::Extension;
    use axum::http::{HeaderMap, HeaderValue, StatusCode, header::AUTHORIZATION};
    use axum::response::IntoResponse;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    fn auth_state() -> Arc<AuthState> {
        let config = AuthConfig::new("https://gardisto.dev".to_string());
        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()));
        Arc::new(AuthState::new(config, limiter))
    }

    #[tokio::test]
    async fn forgot_password_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = forgot_password(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            None,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn forgot_password_invalid_email() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = forgot_password(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::ForgotPasswordRequest {
                email: "not-an-email".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn reset_password_empty_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = reset_password(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::ResetPasswordRequest {
                token: " ".to_string(),
                password: "Str0ng!pass".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn change_password_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = change_password(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            None,
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn change_password_missing_session_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = change_password(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::ChangePasswordRequest {
                current_password: "Str0ng!pass".to_string(),
                new_password: "N3w!passw0rd".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn change_password_weak_new_password() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sometoken"));
        let response = change_password(
            headers,
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::ChangePasswordRequest {
                current_password: "Str0ng!pass".to_string(),
                new_password: "weak".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn reset_password_weak_password() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = reset_password(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::ResetPasswordRequest {
                token: "sometoken".to_string(),
                password: "weak".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }
}
