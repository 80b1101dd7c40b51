//! Email outbox worker and delivery abstractions.
//!
//! Auth flows enqueue rows in `email_outbox` with status `pending` inside the
//! same transaction that issues a token, so a token never exists without its
//! outbound message. A background task polls that table, locks a batch via
//! `FOR UPDATE SKIP LOCKED`, and hands each row to an `EmailSender`. Failed
//! rows are retried with exponential backoff and jitter until a max attempt
//! threshold is reached, then marked `failed`.
//!
//! Actual delivery (SMTP, API) is behind the `EmailSender` trait; the default
//! `LogEmailSender` logs the payload and returns `Ok(())`, which is enough
//! for local development. Raw tokens never appear here: payloads carry full
//! URLs built by the issuing flow.

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

/// Email delivery abstraction used by the outbox worker.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs the payload instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = %message.template,
            payload = %message.payload_json,
            "email outbox send stub"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EmailWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl EmailWorkerConfig {
    /// Default worker config: 5s poll interval, 10 messages per batch,
    /// 5 max attempts, and 5s->5m exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Clamp nonsensical values (zero intervals, empty batches) to workable
    /// minimums.
    #[must_use]
    pub fn normalize(self) -> Self {
        let poll_interval = if self.poll_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.poll_interval
        };
        let batch_size = if self.batch_size == 0 {
            1
        } else {
            self.batch_size
        };
        let max_attempts = self.max_attempts.max(1);
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        let backoff_max = if self.backoff_max < backoff_base {
            backoff_base
        } else {
            self.backoff_max
        };
        Self {
            poll_interval,
            batch_size,
            max_attempts,
            backoff_base,
            backoff_max,
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for EmailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that polls and processes the email outbox.
pub fn spawn_outbox_worker(
    pool: PgPool,
    sender: Arc<dyn EmailSender>,
    config: EmailWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        let poll_interval = config.poll_interval();

        loop {
            // Poll the outbox table on a fixed cadence; sender handles
            // delivery or logging.
            let batch_result = process_outbox_batch(&pool, sender.as_ref(), &config).await;
            if let Err(err) = batch_result {
                error!("email outbox batch failed: {err}");
            }

            sleep(poll_interval).await;
        }
    })
}

async fn process_outbox_batch(
    pool: &PgPool,
    sender: &dyn EmailSender,
    config: &EmailWorkerConfig,
) -> Result<usize> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start email outbox transaction")?;

    // Grab a locked batch so multiple workers can run without double-sending.
    let query = r"
        SELECT id, to_email, template, payload_json::text AS payload_json, attempts
        FROM email_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(i64::try_from(config.batch_size()).unwrap_or(1))
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load email outbox batch")?;

    if rows.is_empty() {
        // Commit even on empty to release locks and keep poll loop consistent.
        tx.commit()
            .await
            .context("failed to commit empty outbox batch")?;
        return Ok(0);
    }

    let row_count = rows.len();
    for row in rows {
        let id: Uuid = row.get("id");
        let attempts: i32 = row.get("attempts");
        let message = EmailMessage {
            to_email: row.get("to_email"),
            template: row.get("template"),
            payload_json: row.get("payload_json"),
        };

        match sender.send(&message) {
            Ok(()) => mark_sent(&mut tx, id).await?,
            Err(err) => {
                error!(outbox_id = %id, "email delivery failed: {err}");
                let attempts = u32::try_from(attempts).unwrap_or(0) + 1;
                if attempts >= config.max_attempts() {
                    mark_failed(&mut tx, id, attempts).await?;
                } else {
                    let delay = retry_delay(config, attempts);
                    mark_retry(&mut tx, id, attempts, delay).await?;
                }
            }
        }
    }

    tx.commit()
        .await
        .context("failed to commit email outbox batch")?;
    Ok(row_count)
}

/// Exponential backoff capped at `backoff_max`, plus up to half the base as
/// jitter so retries from parallel workers spread out.
fn retry_delay(config: &EmailWorkerConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    let scaled = config
        .backoff_base
        .saturating_mul(2_u32.saturating_pow(exponent));
    let capped = scaled.min(config.backoff_max);
    let jitter_ceiling = (config.backoff_base.as_secs() / 2).max(1);
    let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
    capped + Duration::from_secs(jitter)
}

async fn mark_sent(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, id: Uuid) -> Result<()> {
    let query = r"
        UPDATE email_outbox
        SET status = 'sent', sent_at = NOW(), attempts = attempts + 1
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to mark outbox row sent")?;
    Ok(())
}

async fn mark_retry(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    attempts: u32,
    delay: Duration,
) -> Result<()> {
    let query = r"
        UPDATE email_outbox
        SET attempts = $2, next_attempt_at = NOW() + ($3 * INTERVAL '1 second')
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(id)
        .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
        .bind(i64::try_from(delay.as_secs()).unwrap_or(i64::MAX))
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to schedule outbox retry")?;
    Ok(())
}

async fn mark_failed(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    attempts: u32,
) -> Result<()> {
    let query = r"
        UPDATE email_outbox
        SET status = 'failed', attempts = $2
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(id)
        .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to mark outbox row failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_sender_always_succeeds() {
        let sender = LogEmailSender;
        let message = EmailMessage {
            to_email: "a@example.com".to_string(),
            template: "verify_email".to_string(),
            payload_json: "{}".to_string(),
        };
        assert!(sender.send(&message).is_ok());
    }

    #[test]
    fn normalize_clamps_zero_values() {
        let config = EmailWorkerConfig::new()
            .with_poll_interval_seconds(0)
            .with_batch_size(0)
            .with_max_attempts(0)
            .normalize();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_size(), 1);
        assert_eq!(config.max_attempts(), 1);
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let config = EmailWorkerConfig::new().normalize();
        let first = retry_delay(&config, 1);
        let late = retry_delay(&config, 12);
        assert!(first >= config.backoff_base);
        // Max backoff plus worst-case jitter.
        assert!(late <= config.backoff_max + Duration::from_secs(3));
    }
}
