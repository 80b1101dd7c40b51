//! Auth configuration and shared per-request state.

use super::rate_limit::RateLimiter;

const DEFAULT_VERIFICATION_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_RESET_TOKEN_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_RESEND_COOLDOWN_SECONDS: i64 = 60;
const DEFAULT_SESSION_TTL_SECONDS: i64 = 12 * 60 * 60;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    verification_token_ttl_seconds: i64,
    reset_token_ttl_seconds: i64,
    resend_cooldown_seconds: i64,
    session_ttl_seconds: i64,
}

impl AuthConfig {
    /// Defaults: verification links live 24 hours (users may delay checking
    /// email), reset links 10 minutes (a live reset link is riskier).
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        Self {
            frontend_base_url,
            verification_token_ttl_seconds: DEFAULT_VERIFICATION_TOKEN_TTL_SECONDS,
            reset_token_ttl_seconds: DEFAULT_RESET_TOKEN_TTL_SECONDS,
            resend_cooldown_seconds: DEFAULT_RESEND_COOLDOWN_SECONDS,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_verification_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.verification_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_reset_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.reset_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_resend_cooldown_seconds(mut self, seconds: i64) -> Self {
        self.resend_cooldown_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    pub(crate) fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    pub(super) fn verification_token_ttl_seconds(&self) -> i64 {
        self.verification_token_ttl_seconds
    }

    pub(super) fn reset_token_ttl_seconds(&self) -> i64 {
        self.reset_token_ttl_seconds
    }

    pub(super) fn resend_cooldown_seconds(&self) -> i64 {
        self.resend_cooldown_seconds
    }

    pub(super) fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }
}

/// Shared auth state handed to handlers via `Extension`.
pub struct AuthState {
    config: AuthConfig,
    rate_limiter: RateLimiter,
}

impl AuthState {
    #[must_use]
    pub fn new(config: AuthConfig, rate_limiter: RateLimiter) -> Self {
        Self {
            config,
            rate_limiter,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }
}
