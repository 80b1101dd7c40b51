//! Sliding-window rate limiting for sensitive auth endpoints.
//!
//! Flow Overview:
//! 1) Each check targets a (identifier, action) pair: IP, email, or a
//!    composite key, plus the operation name being throttled.
//! 2) A live counter row is incremented atomically; if none exists (first
//!    request or expired window) an upsert creates `count = 1` with a fresh
//!    `expires_at`. Concurrent creations collapse into increments instead of
//!    failing on the unique key.
//! 3) The attempt that pushes the count past `max_attempts` is itself counted
//!    and rejected, so rejected attempts keep consuming quota.
//!
//! Scaling: `PgCounterStore` pushes all coordination into single-statement
//! Postgres operations, so limits stay consistent across service instances.
//! `MemoryCounterStore` offers the same contract behind a mutex for tests and
//! single-process deployments.
//!
//! Failure policy: a store error propagates to the caller (fail closed);
//! handlers answer 500 and the request is not admitted.

use super::error::AuthError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{Instrument, debug, error};

/// Named operations that share the rate-limit store. Each carries its own
/// default threshold and window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitAction {
    Register,
    Login,
    ChangePassword,
    ForgotPassword,
    ResetPassword,
    VerifyEmail,
    ResendVerification,
}

impl RateLimitAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Login => "login",
            Self::ChangePassword => "change-password",
            Self::ForgotPassword => "forgot-password",
            Self::ResetPassword => "reset-password",
            Self::VerifyEmail => "verify-email",
            Self::ResendVerification => "resend-verification",
        }
    }

    /// Attempts allowed per window before requests are rejected.
    #[must_use]
    pub const fn max_attempts(self) -> i64 {
        match self {
            Self::Register | Self::Login | Self::ChangePassword => 5,
            Self::ForgotPassword | Self::ResendVerification => 3,
            Self::ResetPassword | Self::VerifyEmail => 10,
        }
    }

    /// All auth actions currently use a one-hour rolling window.
    #[must_use]
    pub const fn window_seconds(self) -> i64 {
        3600
    }
}

/// Snapshot of a counter row after an increment or upsert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Counter {
    pub count: i64,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a rate-limit check, returned to the calling handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: i64,
    pub reset_in_seconds: i64,
}

impl RateLimitResult {
    /// Rounded-up minutes until the window resets, for retry-after messages.
    #[must_use]
    pub const fn retry_after_minutes(&self) -> i64 {
        (self.reset_in_seconds + 59) / 60
    }
}

/// Atomic counter storage contract.
///
/// Both operations must be atomic with respect to concurrent callers on the
/// same (identifier, action) pair: N concurrent checks produce exactly N
/// increments with no lost updates.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment a live (unexpired) counter, returning the updated row, or
    /// `None` when no live row exists.
    async fn find_and_increment(&self, identifier: &str, action: &str) -> Result<Option<Counter>>;

    /// Create a fresh window with `count = 1`, or increment a row created by a
    /// concurrent caller. An expired row is replaced by the fresh window.
    async fn upsert_window(
        &self,
        identifier: &str,
        action: &str,
        window_seconds: i64,
    ) -> Result<Counter>;
}

/// Postgres-backed counter store shared by all service instances.
#[derive(Clone, Debug)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn find_and_increment(&self, identifier: &str, action: &str) -> Result<Option<Counter>> {
        let query = r"
            UPDATE rate_limits
            SET count = count + 1
            WHERE identifier = $1
              AND action = $2
              AND expires_at > NOW()
            RETURNING count, expires_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identifier)
            .bind(action)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to increment rate limit counter")?;

        Ok(row.map(|row| Counter {
            count: row.get("count"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn upsert_window(
        &self,
        identifier: &str,
        action: &str,
        window_seconds: i64,
    ) -> Result<Counter> {
        // A concurrent insert for the same pair lands on the conflict arm and
        // becomes an increment; an expired row is reset to a fresh window.
        let query = r"
            INSERT INTO rate_limits (identifier, action, count, expires_at)
            VALUES ($1, $2, 1, NOW() + ($3 * INTERVAL '1 second'))
            ON CONFLICT (identifier, action) DO UPDATE
            SET count = CASE
                    WHEN rate_limits.expires_at > NOW() THEN rate_limits.count + 1
                    ELSE 1
                END,
                expires_at = CASE
                    WHEN rate_limits.expires_at > NOW() THEN rate_limits.expires_at
                    ELSE EXCLUDED.expires_at
                END
            RETURNING count, expires_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identifier)
            .bind(action)
            .bind(window_seconds)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to upsert rate limit window")?;

        Ok(Counter {
            count: row.get("count"),
            expires_at: row.get("expires_at"),
        })
    }
}

/// In-memory counter store satisfying the same atomicity contract as
/// `PgCounterStore`. Used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<(String, String), Counter>>,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a counter row directly, e.g. one with an already-passed
    /// `expires_at` to exercise window expiry.
    pub async fn seed(&self, identifier: &str, action: &str, counter: Counter) {
        let mut counters = self.counters.lock().await;
        counters.insert((identifier.to_string(), action.to_string()), counter);
    }

    /// Current counter row, if any (expired rows included).
    pub async fn get(&self, identifier: &str, action: &str) -> Option<Counter> {
        let counters = self.counters.lock().await;
        counters
            .get(&(identifier.to_string(), action.to_string()))
            .copied()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn find_and_increment(&self, identifier: &str, action: &str) -> Result<Option<Counter>> {
        let mut counters = self.counters.lock().await;
        let key = (identifier.to_string(), action.to_string());
        match counters.get_mut(&key) {
            Some(counter) if counter.expires_at > Utc::now() => {
                counter.count += 1;
                Ok(Some(*counter))
            }
            _ => Ok(None),
        }
    }

    async fn upsert_window(
        &self,
        identifier: &str,
        action: &str,
        window_seconds: i64,
    ) -> Result<Counter> {
        let mut counters = self.counters.lock().await;
        let key = (identifier.to_string(), action.to_string());
        let now = Utc::now();
        let counter = counters
            .entry(key)
            .and_modify(|counter| {
                if counter.expires_at > now {
                    counter.count += 1;
                } else {
                    counter.count = 1;
                    counter.expires_at = now + ChronoDuration::seconds(window_seconds);
                }
            })
            .or_insert(Counter {
                count: 1,
                expires_at: now + ChronoDuration::seconds(window_seconds),
            });
        Ok(*counter)
    }
}

/// Rate limiter over an injected counter store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Check an action using its default threshold and window.
    ///
    /// # Errors
    /// Returns an error if the counter store is unreachable; callers must
    /// treat that as a rejection (fail closed).
    pub async fn check(
        &self,
        identifier: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitResult> {
        self.check_with(
            identifier,
            action.as_str(),
            action.max_attempts(),
            action.window_seconds(),
        )
        .await
    }

    /// Check an action and turn a rejection into a typed error.
    ///
    /// # Errors
    /// `AuthError::RateLimitExceeded` carrying the limiter snapshot when the
    /// window is exhausted; `AuthError::Store` when the counter store is
    /// unreachable.
    pub async fn enforce(
        &self,
        identifier: &str,
        action: RateLimitAction,
    ) -> std::result::Result<RateLimitResult, AuthError> {
        let result = self.check(identifier, action).await?;
        if result.allowed {
            Ok(result)
        } else {
            Err(AuthError::RateLimitExceeded(result))
        }
    }

    /// Check with explicit threshold and window.
    ///
    /// # Errors
    /// Returns an error if the counter store is unreachable.
    pub async fn check_with(
        &self,
        identifier: &str,
        action: &str,
        max_attempts: i64,
        window_seconds: i64,
    ) -> Result<RateLimitResult> {
        let counter = match self.store.find_and_increment(identifier, action).await? {
            Some(counter) => counter,
            None => {
                self.store
                    .upsert_window(identifier, action, window_seconds)
                    .await?
            }
        };

        let result = RateLimitResult {
            allowed: counter.count <= max_attempts,
            remaining: (max_attempts - counter.count).max(0),
            reset_in_seconds: (counter.expires_at - Utc::now()).num_seconds().max(0),
        };

        if !result.allowed {
            debug!(
                identifier,
                action,
                count = counter.count,
                "rate limit exceeded"
            );
        }

        Ok(result)
    }
}

/// Spawn a background sweep that deletes expired counter rows.
///
/// Purely storage hygiene: correctness never depends on it, since expired
/// rows are already treated as nonexistent by the store predicates.
pub fn spawn_expiry_sweep(pool: PgPool, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(interval).await;

            let query = "DELETE FROM rate_limits WHERE expires_at < NOW()";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "DELETE",
                db.statement = query
            );
            match sqlx::query(query).execute(&pool).instrument(span).await {
                Ok(result) if result.rows_affected() > 0 => {
                    debug!(rows = result.rows_affected(), "swept expired rate limits");
                }
                Ok(_) => {}
                Err(err) => error!("rate limit sweep failed: {err}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> (Arc<MemoryCounterStore>, RateLimiter) {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = RateLimiter::new(store.clone());
        (store, limiter)
    }

    #[tokio::test]
    async fn first_check_creates_window() -> Result<()> {
        let (store, limiter) = limiter();
        let result = limiter.check("1.2.3.4", RateLimitAction::Login).await?;

        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
        assert!(result.reset_in_seconds <= 3600);

        let counter = store.get("1.2.3.4", "login").await.expect("counter row");
        assert_eq!(counter.count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn sixth_login_attempt_is_rejected() -> Result<()> {
        let (_, limiter) = limiter();

        for expected_remaining in [4, 3, 2, 1, 0] {
            let result = limiter.check("1.2.3.4", RateLimitAction::Login).await?;
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
        }

        let result = limiter.check("1.2.3.4", RateLimitAction::Login).await?;
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert!(result.reset_in_seconds > 3590 && result.reset_in_seconds <= 3600);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_attempts_keep_consuming_quota() -> Result<()> {
        let (store, limiter) = limiter();

        for _ in 0..7 {
            let _ = limiter.check("1.2.3.4", RateLimitAction::ForgotPassword).await?;
        }

        let counter = store
            .get("1.2.3.4", "forgot-password")
            .await
            .expect("counter row");
        assert_eq!(counter.count, 7);
        Ok(())
    }

    #[tokio::test]
    async fn expired_window_behaves_as_nonexistent() -> Result<()> {
        let (store, limiter) = limiter();
        store
            .seed(
                "1.2.3.4",
                "login",
                Counter {
                    count: 99,
                    expires_at: Utc::now() - ChronoDuration::seconds(1),
                },
            )
            .await;

        let result = limiter.check("1.2.3.4", RateLimitAction::Login).await?;
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);

        let counter = store.get("1.2.3.4", "login").await.expect("counter row");
        assert_eq!(counter.count, 1);
        assert!(counter.expires_at > Utc::now());
        Ok(())
    }

    #[tokio::test]
    async fn identifiers_and_actions_are_independent() -> Result<()> {
        let (_, limiter) = limiter();

        for _ in 0..4 {
            let _ = limiter
                .check("1.2.3.4", RateLimitAction::ForgotPassword)
                .await?;
        }

        let other_ip = limiter
            .check("5.6.7.8", RateLimitAction::ForgotPassword)
            .await?;
        assert!(other_ip.allowed);
        assert_eq!(other_ip.remaining, 2);

        let other_action = limiter.check("1.2.3.4", RateLimitAction::Login).await?;
        assert!(other_action.allowed);
        assert_eq!(other_action.remaining, 4);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_checks_never_lose_updates() -> Result<()> {
        let (store, limiter) = limiter();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("1.2.3.4", RateLimitAction::Register).await
            }));
        }

        let mut rejected = 0;
        for handle in handles {
            let result = handle.await??;
            if !result.allowed {
                rejected += 1;
            }
        }

        let counter = store.get("1.2.3.4", "register").await.expect("counter row");
        assert_eq!(counter.count, 20);
        assert_eq!(rejected, 20 - RateLimitAction::Register.max_attempts());
        Ok(())
    }

    #[test]
    fn retry_after_minutes_rounds_up() {
        let result = RateLimitResult {
            allowed: false,
            remaining: 0,
            reset_in_seconds: 61,
        };
        assert_eq!(result.retry_after_minutes(), 2);

        let result = RateLimitResult {
            allowed: false,
            remaining: 0,
            reset_in_seconds: 0,
        };
        assert_eq!(result.retry_after_minutes(), 0);
    }

    #[test]
    fn action_policy_table() {
        assert_eq!(RateLimitAction::Login.as_str(), "login");
        assert_eq!(RateLimitAction::Login.max_attempts(), 5);
        assert_eq!(RateLimitAction::ChangePassword.as_str(), "change-password");
        assert_eq!(RateLimitAction::ChangePassword.max_attempts(), 5);
        assert_eq!(RateLimitAction::ForgotPassword.max_attempts(), 3);
        assert_eq!(RateLimitAction::ResetPassword.max_attempts(), 10);
        assert_eq!(RateLimitAction::VerifyEmail.window_seconds(), 3600);
    }

    #[tokio::test]
    async fn enforce_maps_rejection_to_typed_error() -> Result<()> {
        let (_, limiter) = limiter();

        for _ in 0..3 {
            let _ = limiter
                .check("1.2.3.4", RateLimitAction::ForgotPassword)
                .await?;
        }

        let err = limiter
            .enforce("1.2.3.4", RateLimitAction::ForgotPassword)
            .await
            .expect_err("window exhausted");
        match err {
            AuthError::RateLimitExceeded(result) => {
                assert!(!result.allowed);
                assert_eq!(result.remaining, 0);
                assert!(result.reset_in_seconds > 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }
}
