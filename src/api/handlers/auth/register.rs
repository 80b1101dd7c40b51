//! Registration endpoint.

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
use super::storage::{SignupOutcome, insert_user_and_verification};
use super::types::{MessageResponse, RegisterRequest};
use super::utils::{extract_client_ip, hash_password, normalize_email, valid_email, valid_password};

/// Create a new account in `pending_verification` state and send the
/// verification link. Throttled per IP.
#[utoipa::path(
    post,
    path = "/v1/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Account created, verification email queued", body = MessageResponse),
        (status = 400, description = "Invalid payload", body = MessageResponse),
        (status = 409, description = "Email already registered", body = MessageResponse),
        (status = 429, description = "Rate limited", body = MessageResponse)
    ),
    tag = "auth"
)]
pub async fn register(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<RegisterRequest>>,
) -> impl IntoResponse {
    let request: RegisterRequest = match payload {
        Some(Json(payload)) => payload,
        None => {
            return message(StatusCode::BAD_REQUEST, "Missing payload");
        }
    };

    // Rate limit before any validation or database work.
    let client_ip = extract_client_ip(&headers);
    let identifier = client_ip.as_deref().unwrap_or("unknown");
    match auth_state
        .rate_limiter()
        .enforce(identifier, RateLimitAction::Register)
        .await
    {
        Ok(_) => {}
        Err(AuthError::RateLimitExceeded(result)) => {
            return message(
                StatusCode::TOO_MANY_REQUESTS,
                &format!(
                    "Too many registration attempts. Please try again in {} minutes.",
                    result.retry_after_minutes()
                ),
            );
        }
        Err(err) => {
            error!("Rate limit check failed: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Registration failed");
        }
    }

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return message(StatusCode::BAD_REQUEST, "Invalid email address");
    }

    let name = request.name.trim();
    if name.is_empty() {
        return message(StatusCode::BAD_REQUEST, "Missing name");
    }

    if !valid_password(&request.password) {
        return message(
            StatusCode::BAD_REQUEST,
            "Password must be at least 8 characters with uppercase, lowercase, number, and special character",
        );
    }

    // Argon2 is CPU-bound; keep it off the async worker threads.
    let password = request.password;
    let password_hash = match tokio::task::spawn_blocking(move || hash_password(&password)).await {
        Ok(Ok(hash)) => hash,
        Ok(Err(err)) => {
            error!("Failed to hash password: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Registration failed");
        }
        Err(err) => {
            error!("Password hashing task failed: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Registration failed");
        }
    };

    match insert_user_and_verification(&pool, &email, name, &password_hash, auth_state.config())
        .await
    {
        Ok(SignupOutcome::Created) => message(
            StatusCode::CREATED,
            "Account created. Please check your email to verify your address.",
        ),
        Ok(SignupOutcome::Conflict) => {
            message(StatusCode::CONFLICT, "Email is already registered")
        }
        Err(err) => {
            error!("Failed to create user: {err}");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Registration failed")
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
    use super::register;
    use anyhow::Result;
    use axum::Json;
    use axum::extract::Extension;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    fn auth_state() -> Arc<AuthState> {
        let config = AuthConfig::new("https://gardisto.dev".to_string());
        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()));
        Arc::new(AuthState::new(config, limiter))
    }

    #[tokio::test]
    async fn register_missing_payload() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = register(HeaderMap::new(), Extension(pool), Extension(auth_state()), None)
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn register_invalid_email() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = register(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::RegisterRequest {
                email: "not-an-email".to_string(),
                name: "Alice".to_string(),
                password: "Str0ng!pass".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn register_weak_password() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let response = register(
            HeaderMap::new(),
            Extension(pool),
            Extension(auth_state()),
            Some(Json(super::RegisterRequest {
                email: "a@example.com".to_string(),
                name: "Alice".to_string(),
                password: "weak".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn register_rate_limited_after_threshold() -> Result<()> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://postgres@localhost/postgres")?;
        let state = auth_state();

        // Exhaust the window with invalid payloads; the limiter runs first.
        for _ in 0..5 {
            let response = register(
                HeaderMap::new(),
                Extension(pool.clone()),
                Extension(state.clone()),
                Some(Json(super::RegisterRequest {
                    email: "not-an-email".to_string(),
                    name: "Alice".to_string(),
                    password: "Str0ng!pass".to_string(),
                })),
            )
            .await
            .into_response();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        let response = register(
            HeaderMap::new(),
            Extension(pool),
            Extension(state),
            Some(Json(super::RegisterRequest {
                email: "not-an-email".to_string(),
                name: "Alice".to_string(),
                password: "Str0ng!pass".to_string(),
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        Ok(())
    }
}
