//! Rate limiter behavior through the public crate API.

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use gardisto::api::handlers::auth::rate_limit::{
    Counter, CounterStore, MemoryCounterStore, RateLimitAction, RateLimiter,
};
use std::sync::Arc;

#[tokio::test]
async fn window_lifecycle_for_forgot_password() -> Result<()> {
    let store = Arc::new(MemoryCounterStore::new());
    let limiter = RateLimiter::new(store.clone());

    // Three allowed attempts, then rejection.
    for remaining in [2, 1, 0] {
        let result = limiter
            .check("203.0.113.9", RateLimitAction::ForgotPassword)
            .await?;
        assert!(result.allowed);
        assert_eq!(result.remaining, remaining);
    }

    let rejected = limiter
        .check("203.0.113.9", RateLimitAction::ForgotPassword)
        .await?;
    assert!(!rejected.allowed);
    assert!(rejected.reset_in_seconds > 0);

    // The rejection itself consumed quota.
    let counter = store
        .get("203.0.113.9", "forgot-password")
        .await
        .expect("counter row");
    assert_eq!(counter.count, 4);

    // Once the window lapses the same key starts fresh.
    store
        .seed(
            "203.0.113.9",
            "forgot-password",
            Counter {
                count: counter.count,
                expires_at: Utc::now() - Duration::seconds(1),
            },
        )
        .await;

    let fresh = limiter
        .check("203.0.113.9", RateLimitAction::ForgotPassword)
        .await?;
    assert!(fresh.allowed);
    assert_eq!(fresh.remaining, 2);
    Ok(())
}

#[tokio::test]
async fn custom_thresholds_apply_per_call() -> Result<()> {
    let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()));

    let first = limiter.check_with("tenant-7", "bulk-import", 1, 60).await?;
    assert!(first.allowed);
    assert_eq!(first.remaining, 0);

    let second = limiter.check_with("tenant-7", "bulk-import", 1, 60).await?;
    assert!(!second.allowed);
    Ok(())
}

#[tokio::test]
async fn concurrent_checks_count_every_attempt() -> Result<()> {
    let store = Arc::new(MemoryCounterStore::new());
    let limiter = RateLimiter::new(store.clone());

    let mut handles = Vec::new();
    for _ in 0..32 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter.check("198.51.100.4", RateLimitAction::Login).await
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await??.allowed {
            allowed += 1;
        }
    }

    assert_eq!(allowed, RateLimitAction::Login.max_attempts());
    let counter = store
        .get("198.51.100.4", "login")
        .await
        .expect("counter row");
    assert_eq!(counter.count, 32);
    Ok(())
}

struct FailingStore;

#[async_trait]
impl CounterStore for FailingStore {
    async fn find_and_increment(&self, _identifier: &str, _action: &str) -> Result<Option<Counter>> {
        bail!("store unreachable")
    }

    async fn upsert_window(
        &self,
        _identifier: &str,
        _action: &str,
        _window_seconds: i64,
    ) -> Result<Counter> {
        bail!("store unreachable")
    }
}

#[tokio::test]
async fn store_errors_propagate_to_the_caller() {
    let limiter = RateLimiter::new(Arc::new(FailingStore));
    let result = limiter.check("203.0.113.9", RateLimitAction::Login).await;
    assert!(result.is_err());
}
