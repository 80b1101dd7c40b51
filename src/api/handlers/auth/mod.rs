//! Auth flows: registration, login/session, password reset, and email
//! verification, all throttled through the shared rate limiter.

pub mod error;
pub mod login;
pub mod password;
pub mod rate_limit;
pub mod register;
pub mod state;
pub mod types;
pub mod verification;

mod storage;
mod utils;

pub use state::{AuthConfig, AuthState};
