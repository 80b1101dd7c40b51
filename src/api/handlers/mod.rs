//! API handlers: auth flows plus the health and banner routes.

pub mod auth;
pub mod health;
pub mod root;
