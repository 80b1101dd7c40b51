//! Account verification and abuse protection service.
//!
//! Exposes the auth API (registration, login, password reset, email
//! verification) backed by Postgres, with a sliding-window rate limiter in
//! front of every flow and an email outbox worker behind them.

pub mod api;
pub mod cli;

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::APP_USER_AGENT;

    #[test]
    fn user_agent_contains_name_and_version() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.ends_with(env!("CARGO_PKG_VERSION")));
    }
}
