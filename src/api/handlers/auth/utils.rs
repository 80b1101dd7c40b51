//! Helpers for auth validation, token generation, and token hashing.

use anyhow::{Context, Result, anyhow};
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng as SaltRng},
};
use once_cell::sync::Lazy;
use rand::{RngCore, rngs::OsRng};
use regex::Regex;
use sha2::{Digest, Sha256};

// Hashed once at first use; verified against when a login email matches no
// account, so unknown and known emails cost the same argon2 work.
static DUMMY_PASSWORD_HASH: Lazy<String> =
    Lazy::new(|| hash_password("timing-equalizer").unwrap_or_default());

/// Normalize an email for lookup/uniqueness checks.
pub(super) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(super) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Password policy: at least 8 characters with upper, lower, digit, and one
/// of `!@#$%^&*`.
pub(super) fn valid_password(password: &str) -> bool {
    password.len() >= 8
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| "!@#$%^&*".contains(c))
}

fn generate_token(byte_len: usize) -> Result<String> {
    let mut bytes = vec![0u8; byte_len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate token bytes")?;
    Ok(hex::encode(bytes))
}

/// Create a password reset token for email links: 20 random bytes, hex.
/// The raw token is only sent to the user; the database stores a hash.
pub(super) fn generate_reset_token() -> Result<String> {
    generate_token(20)
}

/// Create an email verification token: 32 random bytes, hex.
pub(super) fn generate_verification_token() -> Result<String> {
    generate_token(32)
}

/// Create a session token for authenticated requests: 32 random bytes, hex.
/// The raw value is only returned to the client; the database stores a hash.
pub(crate) fn generate_session_token() -> Result<String> {
    generate_token(32)
}

/// One-way hash of a raw token, hex-encoded. The only form ever persisted.
pub(crate) fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash a password into a PHC string for storage. CPU-bound; call from
/// `spawn_blocking` in handlers.
pub(super) fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut SaltRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| anyhow!("failed to hash password: {err}"))
}

/// PHC string for equalizing login timing when no account matches.
pub(super) fn dummy_password_hash() -> &'static str {
    &DUMMY_PASSWORD_HASH
}

/// Verify a candidate password against a stored PHC string.
pub(super) fn verify_password(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

/// Build the frontend verification link included in outbound emails.
pub(super) fn build_verify_url(frontend_base_url: &str, token: &str) -> String {
    let base = frontend_base_url.trim_end_matches('/');
    format!("{base}/verify-email?token={token}")
}

/// Build the frontend password reset link included in outbound emails.
pub(super) fn build_reset_url(frontend_base_url: &str, token: &str) -> String {
    let base = frontend_base_url.trim_end_matches('/');
    format!("{base}/reset-password?token={token}")
}

pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Extract a client IP for rate limiting from common proxy headers.
pub(super) fn extract_client_ip(headers: &axum::http::HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Composite key for login throttling: per IP and email together, so one
/// address cannot exhaust another user's quota from a different network.
pub(super) fn login_identifier(client_ip: Option<&str>, email_normalized: &str) -> String {
    format!("{}:{}", client_ip.unwrap_or("unknown"), email_normalized)
}
