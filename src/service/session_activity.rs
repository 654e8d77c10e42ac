//! Idle, absolute-lifetime and step-up policy on top of the activity ledger.
//!
//! Independent of token validity: a session with a perfectly fresh access
//! token is still refused once its activity record has gone idle or hit its
//! timebox.

use crate::database::session_activity::SessionActivityRepository;
use crate::error::app_error::AppError;
use crate::models::audit::audit_events;
use crate::models::session_activity::{ActivityInsert, ActivityState, ExpirySweep, NewSessionActivity, SessionActivity};
use crate::service::audit::record_security_event;
use crate::service::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub const TIMEBOX_HOURS: i64 = 12;
pub const IDLE_TIMEOUT_MINUTES: i64 = 30;
pub const REAUTH_WINDOW_MINUTES: i64 = 15;
pub const TOUCH_THROTTLE_SECS: i64 = 30;

/// Identifies the ledger row a request maps to, plus what to stamp on creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityKey {
    pub user_id: Uuid,
    pub session_id: String,
    pub tenant_id: Option<Uuid>,
    pub ip_hash: Option<String>,
    pub ua_hash: Option<String>,
}

/// Classifies a record at `now`. Checks run revoked, timebox, idle, then re-auth.
pub fn evaluate(record: &SessionActivity, now: DateTime<Utc>) -> ActivityState {
    if record.revoked_at.is_some() {
        return ActivityState::Revoked;
    }
    if now > record.expires_at {
        return ActivityState::TimeboxExpired;
    }

    let last_seen = record.last_seen_at.max(record.created_at);
    if now - last_seen > Duration::minutes(IDLE_TIMEOUT_MINUTES) {
        return ActivityState::IdleExpired;
    }

    let last_reauth = record.last_reauth_at.max(record.created_at);
    ActivityState::Active {
        reauth_satisfied: now - last_reauth <= Duration::minutes(REAUTH_WINDOW_MINUTES),
    }
}

pub struct SessionActivityTracker {
    repo: Arc<dyn SessionActivityRepository>,
    clock: Arc<dyn Clock>,
}

impl SessionActivityTracker {
    pub fn new(repo: Arc<dyn SessionActivityRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    async fn load_or_create(&self, key: &ActivityKey, now: DateTime<Utc>) -> Result<SessionActivity, AppError> {
        if let Some(record) = self.repo.find_session_activity(&key.user_id, &key.session_id).await? {
            return Ok(record);
        }

        let new_record = NewSessionActivity {
            user_id: key.user_id,
            session_id: key.session_id.clone(),
            tenant_id: key.tenant_id,
            created_at: now,
            expires_at: now + Duration::hours(TIMEBOX_HOURS),
            ip_hash: key.ip_hash.clone(),
            ua_hash: key.ua_hash.clone(),
        };

        match self.repo.insert_session_activity(&new_record).await? {
            ActivityInsert::Created(record) => {
                debug!(user_id = %key.user_id, session_id = %key.session_id, "session activity record created");
                Ok(record)
            }
            ActivityInsert::AlreadyExists => {
                debug!(user_id = %key.user_id, session_id = %key.session_id, "lost activity insert race, re-reading");
                self.repo
                    .find_session_activity(&key.user_id, &key.session_id)
                    .await?
                    .ok_or_else(|| AppError::upstream("activity.create", None, None, "activity record missing after insert conflict"))
            }
        }
    }

    async fn expire(&self, record: &SessionActivity, now: DateTime<Utc>, event: &str) -> Result<(), AppError> {
        self.repo.revoke_session_activity(&record.user_id, &record.session_id, now).await?;
        record_security_event(Some(&record.user_id), event, false, Some(&record.session_id), None);
        Ok(())
    }

    /// Loads (or lazily creates) the record and applies the policy checks.
    ///
    /// Idle and timebox expiry revoke the record before failing with
    /// [`AppError::SessionExpired`]. A stale step-up fails with
    /// [`AppError::ReauthRequired`] and leaves the record alone.
    pub async fn validate(&self, key: &ActivityKey, require_reauth: bool) -> Result<SessionActivity, AppError> {
        let now = self.clock.now();
        let record = self.load_or_create(key, now).await?;

        match evaluate(&record, now) {
            ActivityState::Revoked => Err(AppError::SessionExpired),
            ActivityState::TimeboxExpired => {
                info!(user_id = %record.user_id, session_id = %record.session_id, "session hit its absolute lifetime");
                self.expire(&record, now, audit_events::SESSION_TIMEBOX_EXPIRED).await?;
                Err(AppError::SessionExpired)
            }
            ActivityState::IdleExpired => {
                info!(user_id = %record.user_id, session_id = %record.session_id, "session idle for too long");
                self.expire(&record, now, audit_events::SESSION_IDLE_EXPIRED).await?;
                Err(AppError::SessionExpired)
            }
            ActivityState::Active { reauth_satisfied: false } if require_reauth => Err(AppError::ReauthRequired),
            ActivityState::Active { .. } => Ok(record),
        }
    }

    /// Moves `last_seen_at` forward, at most once per throttle interval.
    pub async fn touch(&self, key: &ActivityKey) -> Result<SessionActivity, AppError> {
        let record = self.validate(key, false).await?;
        let now = self.clock.now();

        if now - record.last_seen_at <= Duration::seconds(TOUCH_THROTTLE_SECS) {
            return Ok(record);
        }

        self.repo
            .touch_session_activity(&key.user_id, &key.session_id, now, key.ip_hash.as_deref(), key.ua_hash.as_deref())
            .await?
            .ok_or(AppError::SessionExpired)
    }

    /// Stamps a successful step-up confirmation. Never throttled.
    pub async fn mark_reauth(&self, key: &ActivityKey) -> Result<SessionActivity, AppError> {
        self.validate(key, false).await?;
        let now = self.clock.now();

        let record = self
            .repo
            .mark_session_reauth(&key.user_id, &key.session_id, now)
            .await?
            .ok_or(AppError::SessionExpired)?;
        record_security_event(Some(&key.user_id), audit_events::REAUTH_CONFIRMED, true, Some(&key.session_id), None);
        Ok(record)
    }

    /// Records the tenant on a record created before the tenant was resolved.
    pub async fn assign_tenant(&self, record: &mut SessionActivity, tenant_id: Uuid) -> Result<(), AppError> {
        if record.tenant_id.is_some() {
            return Ok(());
        }
        self.repo.assign_activity_tenant(&record.user_id, &record.session_id, &tenant_id).await?;
        record.tenant_id = Some(tenant_id);
        Ok(())
    }

    pub async fn revoke(&self, user_id: &Uuid, session_id: &str) -> Result<(), AppError> {
        self.repo.revoke_session_activity(user_id, session_id, self.clock.now()).await?;
        Ok(())
    }

    /// Revokes every live record past its timebox or idle limit.
    pub async fn sweep_expired(&self) -> Result<ExpirySweep, AppError> {
        let now = self.clock.now();
        let sweep = self.repo.revoke_expired_activity(now, now - Duration::minutes(IDLE_TIMEOUT_MINUTES)).await?;
        if sweep.timebox_revoked + sweep.idle_revoked > 0 {
            info!(timebox_revoked = sweep.timebox_revoked, idle_revoked = sweep.idle_revoked, "expired session activity revoked");
        } else {
            debug!("expiry sweep found nothing to revoke");
        }
        Ok(sweep)
    }
}
