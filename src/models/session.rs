use chrono::{DateTime, Utc};
use rocket::serde::{Deserialize, Serialize};
use schemars::JsonSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Deserialize, Debug, Validate, JsonSchema)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Serialize, Debug, JsonSchema)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize, Debug, Validate, JsonSchema)]
pub struct PasswordRecoveryRequest {
    #[validate(email)]
    pub email: String,
}

#[derive(Serialize, Debug, JsonSchema)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Deserialize, Debug, Validate, JsonSchema)]
pub struct ReauthRequest {
    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthFlow {
    Bearer,
    Cookie,
}

#[derive(Serialize, Debug, JsonSchema)]
pub struct SessionInfoResponse {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: Option<String>,
    pub flow: AuthFlow,
    pub session_id: String,
    pub last_seen_at: DateTime<Utc>,
    pub last_reauth_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize, Debug, JsonSchema)]
pub struct ActivityResponse {
    pub session_id: String,
    pub last_seen_at: DateTime<Utc>,
    pub last_reauth_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&crate::models::session_activity::SessionActivity> for ActivityResponse {
    fn from(activity: &crate::models::session_activity::SessionActivity) -> Self {
        Self {
            session_id: activity.session_id.clone(),
            last_seen_at: activity.last_seen_at,
            last_reauth_at: activity.last_reauth_at,
            expires_at: activity.expires_at,
        }
    }
}

/// Result of one scheduled expiry pass.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub struct ExpireSessionsResponse {
    pub timebox_revoked: u64,
    pub idle_revoked: u64,
    pub idempotency_purged: u64,
}
