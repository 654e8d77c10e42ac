use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Idle/timebox/re-authentication ledger entry keyed by `(user_id, session_id)`.
///
/// `expires_at` is fixed when the row is created; only `last_seen_at` and
/// `last_reauth_at` move afterwards.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SessionActivity {
    pub user_id: Uuid,
    pub session_id: String,
    pub tenant_id: Option<Uuid>,
    pub last_seen_at: DateTime<Utc>,
    pub last_reauth_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub ip_hash: Option<String>,
    pub ua_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewSessionActivity {
    pub user_id: Uuid,
    pub session_id: String,
    pub tenant_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ip_hash: Option<String>,
    pub ua_hash: Option<String>,
}

impl NewSessionActivity {
    /// Row as it is stored: both activity clocks start at creation time.
    pub fn into_record(self) -> SessionActivity {
        SessionActivity {
            user_id: self.user_id,
            session_id: self.session_id,
            tenant_id: self.tenant_id,
            last_seen_at: self.created_at,
            last_reauth_at: self.created_at,
            created_at: self.created_at,
            expires_at: self.expires_at,
            revoked_at: None,
            ip_hash: self.ip_hash,
            ua_hash: self.ua_hash,
        }
    }
}

/// Outcome of the optimistic insert used for lazy creation.
#[derive(Debug, Clone)]
pub enum ActivityInsert {
    Created(SessionActivity),
    /// A concurrent request won the race; re-read the row.
    AlreadyExists,
}

/// Where a request sits in the activity state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Active { reauth_satisfied: bool },
    IdleExpired,
    TimeboxExpired,
    Revoked,
}

/// Counts returned by the scheduled expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, schemars::JsonSchema)]
pub struct ExpirySweep {
    pub timebox_revoked: u64,
    pub idle_revoked: u64,
}
