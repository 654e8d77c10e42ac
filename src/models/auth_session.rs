use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One persisted cookie-flow session row.
///
/// Several rows may share a `session_id`; the newest non-revoked one is current.
/// Rows are never deleted, revocation only stamps `revoked_at`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AuthSession {
    pub id: Uuid,
    pub session_id: String,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub last_refresh_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub ip_hash: Option<String>,
    pub ua_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAuthSession {
    pub session_id: String,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub ip_hash: Option<String>,
    pub ua_hash: Option<String>,
}

/// Fresh credentials written over an existing row on refresh.
#[derive(Debug, Clone)]
pub struct TokenRotation {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

impl AuthSession {
    pub fn expires_within(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.access_expires_at <= now + window
    }
}

/// Result of a successful cookie-session creation.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
    pub record: AuthSession,
}
