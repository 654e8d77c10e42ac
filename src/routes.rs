pub mod auth;
pub mod cron;
pub mod error;
pub mod health;
pub mod session;
