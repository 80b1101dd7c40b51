//! Login, logout, and session introspection endpoints.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::IntoResponse,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::error::AuthError;
use super::rate_limit::RateLimitAction;
use super::state::AuthState;
use super::storage::{
    delete_session, insert_session, lookup_login_record, lookup_session,
};
use super::types::{
    LoginRequest, LoginResponse, LogoutRequest, MessageResponse, SessionResponse,
};
use super::utils::{
    dummy_password_hash, extract_client_ip, hash_token, login_identifier, normalize_email,
    valid_email, verify_password,
};

/// Authenticate with email + password and issue a session token.
/// Throttled per IP+email composite so one address cannot exhaust another
/// user's quota from a different network.
#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated", body = LoginResponse),
        (status = 400, description = "Invalid payload", body = MessageResponse),
        (status = 401, description = "Invalid credentials", body = MessageResponse),
        (status = 403, description = "Email not verified", body = MessageResponse),
        (status = 429, description = "Rate limited", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<LoginRequest>>,
) -> impl IntoResponse {
    let request: LoginRequest = match payload {
        Some(Json(payload)) => payload,
        None => return message(StatusCode::BAD_REQUEST, "Missing payload"),
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return message(StatusCode::BAD_REQUEST, "Invalid email address");
    }

    let client_ip = extract_client_ip(&headers);
    let identifier = login_identifier(client_ip.as_deref(), &email);
    match auth_state
        .rate_limiter()
        .enforce(&identifier, RateLimitAction::Login)
        .await
    {
        Ok(_) => {}
        Err(AuthError::RateLimitExceeded(result)) => {
            return message(
                StatusCode::TOO_MANY_REQUESTS,
                &format!(
                    "Too many login attempts. Please try again in {} minutes.",
                    result.retry_after_minutes()
                ),
            );
        }
        Err(err) => {
            error!("Rate limit check failed: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Login failed");
        }
    }

    let record = match lookup_login_record(&pool, &email).await {
        Ok(record) => record,
        Err(err) => {
            error!("Failed to lookup login record: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Login failed");
        }
    };

    // Unknown email and wrong password share one response; the unknown-email
    // branch verifies against a dummy hash so both paths pay the same argon2
    // cost.
    let (stored_hash, record) = match record {
        Some(record) => (record.password_hash.clone(), Some(record)),
        None => (dummy_password_hash().to_string(), None),
    };
    let password = request.password;
    let verified = match tokio::task::spawn_blocking(move || {
        verify_password(&password, &stored_hash)
    })
    .await
    {
        Ok(verified) => verified,
        Err(err) => {
            error!("Password verification task failed: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Login failed");
        }
    };

    let Some(record) = record else {
        return message(StatusCode::UNAUTHORIZED, "Invalid email or password");
    };
    if !verified {
        return message(StatusCode::UNAUTHORIZED, "Invalid email or password");
    }

    if record.status != "active" {
        return message(
            StatusCode::FORBIDDEN,
            "Please verify your email address before logging in",
        );
    }

    let ttl = auth_state.config().session_ttl_seconds();
    match insert_session(&pool, record.user_id, ttl).await {
        Ok(session_token) => (
            StatusCode::OK,
            Json(LoginResponse {
                session_token,
                user_id: record.user_id.to_string(),
                email: record.email,
                name: record.name,
            }),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to create session: {err}");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Login failed")
        }
    }
}

/// Delete the session matching the supplied token. Always 204; logout is
/// idempotent and never leaks whether the token existed.
#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 204, description = "Session deleted (or never existed)")
    ),
    tag = "auth"
)]
pub async fn logout(
    pool: Extension<PgPool>,
    payload: Option<Json<LogoutRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let token = request.session_token.trim();
    if token.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }

    if let Err(err) = delete_session(&pool, &hash_token(token)).await {
        error!("Failed to delete session: {err}");
    }
    StatusCode::NO_CONTENT.into_response()
}

/// Resolve the bearer session token to its owner.
#[utoipa::path(
    get,
    path = "/v1/auth/session",
    params(
        ("Authorization" = String, Header, description = "Bearer session token")
    ),
    responses(
        (status = 200, description = "Session is valid", body = SessionResponse),
        (status = 401, description = "Missing, unknown, or expired session", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn session(
    headers: HeaderMap,
    pool: Extension<PgPool>,
) -> impl IntoResponse {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let Some(token) = token else {
        return message(StatusCode::UNAUTHORIZED, "Missing session token");
    };

    match lookup_session(&pool, &hash_token(token)).await {
        Ok(Some(record)) => (
            StatusCode::OK,
            Json(SessionResponse {
                user_id: record.user_id.to_string(),
                email: record.email,
                name: record.name,
            }),
        )
            .into_response(),
        Ok(None) => message(StatusCode::UNAUTHORIZED, "Invalid or expired session"),
        Err(err) => {
            error!("Failed to lookup session: {err}");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Session lookup failed")
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
    use super::{login, logout, session};
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
    async fn login_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = login(HeaderMap::new(), Extension(pool), Extension(auth_state()), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn login_invalid_email() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = login(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::LoginRequest {
                email: "not-an-email".to_string(),
                password: "Str0ng!pass".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn logout_without_payload_is_idempotent() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = logout(Extension(pool), None).await.into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        Ok(())
    }

    #[tokio::test]
    async fn session_missing_token() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = session(HeaderMap::new(), Extension(pool)).await.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn session_rejects_non_bearer_header() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        let response = session(headers, Extension(pool)).await.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }
}
