pub mod audit;
pub mod auth_session;
pub mod health;
pub mod idempotency;
pub mod identity;
pub mod session;
pub mod session_activity;
