use crate::api::{self, email::EmailWorkerConfig};
use crate::api::handlers::auth::AuthConfig;
use crate::cli::actions::Action;
use anyhow::Result;

/// Handle the server action
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Server {
            port,
            dsn,
            frontend_url,
            verification_token_ttl,
            reset_token_ttl,
            resend_cooldown,
            session_ttl,
            outbox_poll_seconds,
        } => {
            let auth_config = AuthConfig::new(frontend_url)
                .with_verification_token_ttl_seconds(i64::try_from(verification_token_ttl)?)
                .with_reset_token_ttl_seconds(i64::try_from(reset_token_ttl)?)
                .with_resend_cooldown_seconds(i64::try_from(resend_cooldown)?)
                .with_session_ttl_seconds(i64::try_from(session_ttl)?);

            let email_config =
                EmailWorkerConfig::new().with_poll_interval_seconds(outbox_poll_seconds);

            api::new(port, dsn, auth_config, email_config).await?;
        }
    }

    Ok(())
}
