pub mod auth_session;
pub mod idempotency;
pub mod postgres_repository;
pub mod session_activity;
pub mod tenant;
