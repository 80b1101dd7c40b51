//! Database helpers for accounts, verification/reset tokens, and sessions.
//!
//! Raw tokens never reach this module in persisted form: callers hand over
//! SHA-256 hex digests, and token consumption clears the token fields in the
//! same UPDATE that applies the side effect, so a matched token cannot be
//! replayed.

use anyhow::{Context, Result, anyhow};
use serde_json::json;

use super::error::AuthError;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::state::AuthConfig;
use super::utils::{
    build_reset_url, build_verify_url, generate_reset_token, generate_session_token,
    generate_verification_token, hash_token, is_unique_violation,
};

/// Outcome when attempting to create a new user + verification token.
#[derive(Debug)]
pub(super) enum SignupOutcome {
    Created,
    Conflict,
}

/// Outcome for a resend request (the endpoint always answers 204 to avoid
/// account probing).
#[derive(Debug)]
pub(super) enum ResendOutcome {
    Queued,
    Cooldown,
    Noop,
}

/// Minimal fields needed to authenticate a login attempt.
pub(super) struct LoginRecord {
    pub(super) user_id: Uuid,
    pub(super) email: String,
    pub(super) name: String,
    pub(super) password_hash: String,
    pub(super) status: String,
}

/// Minimal data returned for a valid session token.
pub(super) struct SessionRecord {
    pub(super) user_id: Uuid,
    pub(super) email: String,
    pub(super) name: String,
}

/// Look up login data by email.
pub(super) async fn lookup_login_record(pool: &PgPool, email: &str) -> Result<Option<LoginRecord>> {
    let query = "SELECT id, email, name, password_hash, status FROM users WHERE email = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup login record")?;

    Ok(row.map(|row| LoginRecord {
        user_id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        password_hash: row.get("password_hash"),
        status: row.get("status"),
    }))
}

/// Create a user in `pending_verification` state together with their first
/// verification token and the outbox row carrying the link.
pub(super) async fn insert_user_and_verification(
    pool: &PgPool,
    email: &str,
    name: &str,
    password_hash: &str,
    config: &AuthConfig,
) -> Result<SignupOutcome> {
    // Transaction keeps user creation, token issuance, and the email outbox
    // row consistent even if something fails mid-way.
    let mut tx = pool.begin().await.context("begin signup transaction")?;

    let query = r"
        INSERT INTO users (email, name, password_hash)
        VALUES ($1, $2, $3)
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .bind(name)
        .bind(password_hash)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await;

    let user_id: Uuid = match row {
        Ok(row) => row.get("id"),
        Err(err) => {
            if is_unique_violation(&err) {
                let _ = tx.rollback().await;
                return Ok(SignupOutcome::Conflict);
            }
            return Err(err).context("failed to insert user");
        }
    };

    let _token = issue_verification_token(&mut tx, user_id, email, config).await?;

    tx.commit().await.context("commit signup transaction")?;

    Ok(SignupOutcome::Created)
}

/// Store a fresh verification token hash on the user row (superseding any
/// previous one) and enqueue the verification email.
pub(super) async fn issue_verification_token(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    email: &str,
    config: &AuthConfig,
) -> Result<String> {
    // Generate a raw token for the email link and store only its hash.
    let token = generate_verification_token()?;
    let token_hash = hash_token(&token);

    let query = r"
        UPDATE users
        SET verification_token_hash = $2,
            verification_token_expires_at = NOW() + ($3 * INTERVAL '1 second'),
            verification_sent_at = NOW(),
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(&token_hash)
        .bind(config.verification_token_ttl_seconds())
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to store verification token")?;

    let verify_url = build_verify_url(config.frontend_base_url(), &token);
    enqueue_email(
        tx,
        email,
        "verify_email",
        &json!({
            "email": email,
            "verify_url": verify_url,
        }),
    )
    .await?;

    Ok(token)
}

/// Consume a verification token and activate the user.
///
/// Match and side effect happen in one UPDATE: the token fields are cleared
/// by the same statement that marks the email verified, so a second verify
/// with the same token cannot succeed. Missing, mismatched, and expired
/// tokens all surface as `AuthError::InvalidOrExpiredToken`.
pub(super) async fn consume_verification_token(
    pool: &PgPool,
    token_hash: &str,
) -> Result<(), AuthError> {
    let mut tx = pool.begin().await.context("begin verify transaction")?;

    let query = r"
        UPDATE users
        SET email_verified_at = NOW(),
            status = 'active',
            verification_token_hash = NULL,
            verification_token_expires_at = NULL,
            updated_at = NOW()
        WHERE verification_token_hash = $1
          AND verification_token_expires_at > NOW()
        RETURNING email, name
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to consume verification token")?;

    let Some(row) = row else {
        let _ = tx.rollback().await;
        return Err(AuthError::InvalidOrExpiredToken);
    };

    let email: String = row.get("email");
    let name: String = row.get("name");
    enqueue_email(
        &mut tx,
        &email,
        "welcome",
        &json!({
            "email": email,
            "name": name,
        }),
    )
    .await?;

    tx.commit().await.context("commit verify transaction")?;
    Ok(())
}

/// Issue a password reset token for the given email, if an account exists.
///
/// Returns `false` when no account matched; the handler responds with the
/// same generic message either way to prevent user enumeration.
pub(super) async fn issue_reset_token(
    pool: &PgPool,
    email: &str,
    config: &AuthConfig,
) -> Result<bool> {
    let mut tx = pool.begin().await.context("begin reset-issue transaction")?;

    let query = "SELECT id FROM users WHERE email = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to lookup user for password reset")?;

    let Some(row) = row else {
        tx.commit().await.context("commit reset-issue noop")?;
        return Ok(false);
    };

    let user_id: Uuid = row.get("id");
    let token = generate_reset_token()?;
    let token_hash = hash_token(&token);

    // A newer request supersedes any outstanding reset token.
    let query = r"
        UPDATE users
        SET reset_token_hash = $2,
            reset_token_expires_at = NOW() + ($3 * INTERVAL '1 second'),
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(&token_hash)
        .bind(config.reset_token_ttl_seconds())
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to store reset token")?;

    let reset_url = build_reset_url(config.frontend_base_url(), &token);
    enqueue_email(
        &mut tx,
        email,
        "password_reset",
        &json!({
            "email": email,
            "reset_url": reset_url,
        }),
    )
    .await?;

    tx.commit().await.context("commit reset-issue transaction")?;
    Ok(true)
}

/// Consume a reset token and set the new password hash.
///
/// Clear-and-use in one UPDATE: the statement that matches the hash also
/// replaces the password and nulls the token fields, so the token cannot be
/// used twice even under concurrent requests. Missing, mismatched, and
/// expired tokens all surface as `AuthError::InvalidOrExpiredToken`.
pub(super) async fn consume_reset_token(
    pool: &PgPool,
    token_hash: &str,
    new_password_hash: &str,
) -> Result<(), AuthError> {
    let mut tx = pool
        .begin()
        .await
        .context("begin reset-consume transaction")?;

    let query = r"
        UPDATE users
        SET password_hash = $2,
            reset_token_hash = NULL,
            reset_token_expires_at = NULL,
            updated_at = NOW()
        WHERE reset_token_hash = $1
          AND reset_token_expires_at > NOW()
        RETURNING email
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .bind(new_password_hash)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to consume reset token")?;

    let Some(row) = row else {
        let _ = tx.rollback().await;
        return Err(AuthError::InvalidOrExpiredToken);
    };

    let email: String = row.get("email");
    enqueue_email(
        &mut tx,
        &email,
        "password_changed",
        &json!({
            "email": email,
        }),
    )
    .await?;

    tx.commit().await.context("commit reset-consume transaction")?;
    Ok(())
}

/// Replace the password for an authenticated user and notify them.
pub(super) async fn update_password(
    pool: &PgPool,
    user_id: Uuid,
    email: &str,
    new_password_hash: &str,
) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .context("begin password-change transaction")?;

    let query = r"
        UPDATE users
        SET password_hash = $2,
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(new_password_hash)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to update password")?;

    enqueue_email(
        &mut tx,
        email,
        "password_changed",
        &json!({
            "email": email,
        }),
    )
    .await?;

    tx.commit()
        .await
        .context("commit password-change transaction")?;
    Ok(())
}

/// Re-issue a verification token unless the user is already verified or a
/// token was sent within the cooldown window.
pub(super) async fn enqueue_resend_verification(
    pool: &PgPool,
    email: &str,
    config: &AuthConfig,
) -> Result<ResendOutcome> {
    let mut tx = pool.begin().await.context("begin resend transaction")?;

    let query = r"
        SELECT id, email, status,
               verification_sent_at > NOW() - ($2 * INTERVAL '1 second') AS in_cooldown
        FROM users
        WHERE email = $1
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .bind(config.resend_cooldown_seconds())
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to lookup user for resend")?;

    let Some(row) = row else {
        tx.commit().await.context("commit resend noop")?;
        return Ok(ResendOutcome::Noop);
    };

    let status: String = row.get("status");
    if status != "pending_verification" {
        tx.commit().await.context("commit resend noop")?;
        return Ok(ResendOutcome::Noop);
    }

    if row.get::<Option<bool>, _>("in_cooldown").unwrap_or(false) {
        tx.commit().await.context("commit resend cooldown")?;
        return Ok(ResendOutcome::Cooldown);
    }

    let user_id: Uuid = row.get("id");
    let email: String = row.get("email");
    let _ = issue_verification_token(&mut tx, user_id, &email, config).await?;
    tx.commit().await.context("commit resend enqueue")?;
    Ok(ResendOutcome::Queued)
}

/// Create a session for an authenticated user and return the raw token.
pub(super) async fn insert_session(
    pool: &PgPool,
    user_id: Uuid,
    ttl_seconds: i64,
) -> Result<String> {
    // Generate a random token, store only its hash, and return the raw value
    // so the caller can hand it to the client.
    let query = r"
        INSERT INTO user_sessions (user_id, session_hash, expires_at)
        VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );

    for _ in 0..3 {
        let token = generate_session_token()?;
        let token_hash = hash_token(&token);
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(&token_hash)
            .bind(ttl_seconds)
            .execute(pool)
            .instrument(span.clone())
            .await;

        match result {
            Ok(_) => return Ok(token),
            Err(err) if is_unique_violation(&err) => {}
            Err(err) => return Err(err).context("failed to insert session"),
        }
    }

    Err(anyhow!("failed to generate unique session token"))
}

/// Resolve a session token hash to its owner, for active users and unexpired
/// sessions only.
pub(super) async fn lookup_session(
    pool: &PgPool,
    token_hash: &str,
) -> Result<Option<SessionRecord>> {
    let query = r"
        SELECT users.id, users.email, users.name
        FROM user_sessions
        JOIN users ON users.id = user_sessions.user_id
        WHERE user_sessions.session_hash = $1
          AND user_sessions.expires_at > NOW()
          AND users.status = 'active'
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup session")?;

    if row.is_none() {
        return Ok(None);
    }

    // Record activity for audit/visibility without extending the session TTL.
    let query = r"
        UPDATE user_sessions
        SET last_seen_at = NOW()
        WHERE session_hash = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to update session last_seen_at")?;

    Ok(row.map(|row| SessionRecord {
        user_id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
    }))
}

/// Delete a session by token hash. Logout is idempotent; deleting nothing is
/// fine.
pub(super) async fn delete_session(pool: &PgPool, token_hash: &str) -> Result<()> {
    let query = "DELETE FROM user_sessions WHERE session_hash = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete session")?;
    Ok(())
}

async fn enqueue_email(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    to_email: &str,
    template: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let payload_text = serde_json::to_string(payload).context("failed to serialize email payload")?;

    let query = r"
        INSERT INTO email_outbox (to_email, template, payload_json)
        VALUES ($1, $2, $3::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(to_email)
        .bind(template)
        .bind(payload_text)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert email outbox row")?;
    Ok(())
}
