pub mod server;

#[derive(Debug)]
pub enum Action {
    Server {
        port: u16,
        dsn: String,
        frontend_url: String,
        verification_token_ttl: u64,
        reset_token_ttl: u64,
        resend_cooldown: u64,
        session_ttl: u64,
        outbox_poll_seconds: u64,
    },
}
