//! Typed errors shared by the auth flows.

use super::rate_limit::RateLimitResult;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The actor exhausted its window. Carries the limiter snapshot so the
    /// handler can build a retry-after message.
    #[error("too many attempts, retry in {} minute(s)", .0.retry_after_minutes())]
    RateLimitExceeded(RateLimitResult),

    /// Missing, mismatched, and expired tokens are deliberately a single
    /// case so responses never reveal whether a token ever existed.
    #[error("invalid or expired token")]
    InvalidOrExpiredToken,

    /// Counter or token store failure. Handlers answer 500 and do not admit
    /// the request (fail closed).
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
