use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub tenant_id: Uuid,
    pub key: String,
    pub fingerprint: String,
    pub status_code: Option<i32>,
    pub response_body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A stored response replayed for a repeated idempotent request.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub status_code: u16,
    pub body: String,
}

/// What the idempotency check decided for an incoming request.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyDecision {
    /// First time this key is seen; the key is now reserved.
    Fresh,
    /// Same key and same request fingerprint with a recorded response.
    Replay(StoredResponse),
    /// Same key, different request.
    Conflict,
    /// Same key and fingerprint but the first attempt has not finished yet.
    InFlight,
}

impl IdempotencyRecord {
    pub fn stored_response(&self) -> Option<StoredResponse> {
        match (self.status_code, &self.response_body) {
            (Some(status), Some(body)) => Some(StoredResponse {
                status_code: status as u16,
                body: body.clone(),
            }),
            _ => None,
        }
    }
}
