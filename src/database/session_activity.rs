use crate::database::postgres_repository::{PostgresRepository, unique_violation_as_none};
use crate::error::app_error::AppError;
use crate::models::session_activity::{ActivityInsert, ExpirySweep, NewSessionActivity, SessionActivity};
use chrono::{DateTime, Utc};
use uuid::Uuid;

const ACTIVITY_COLUMNS: &str = "user_id, session_id, tenant_id, last_seen_at, last_reauth_at, created_at, expires_at, revoked_at, ip_hash, ua_hash";

#[async_trait::async_trait]
pub trait SessionActivityRepository: Send + Sync {
    async fn find_session_activity(&self, user_id: &Uuid, session_id: &str) -> Result<Option<SessionActivity>, AppError>;
    /// Plain insert; a unique-key collision comes back as [`ActivityInsert::AlreadyExists`].
    async fn insert_session_activity(&self, activity: &NewSessionActivity) -> Result<ActivityInsert, AppError>;
    async fn touch_session_activity(
        &self,
        user_id: &Uuid,
        session_id: &str,
        at: DateTime<Utc>,
        ip_hash: Option<&str>,
        ua_hash: Option<&str>,
    ) -> Result<Option<SessionActivity>, AppError>;
    async fn mark_session_reauth(&self, user_id: &Uuid, session_id: &str, at: DateTime<Utc>) -> Result<Option<SessionActivity>, AppError>;
    async fn revoke_session_activity(&self, user_id: &Uuid, session_id: &str, at: DateTime<Utc>) -> Result<u64, AppError>;
    /// Fills in the tenant on a row created before it was known. Never overwrites.
    async fn assign_activity_tenant(&self, user_id: &Uuid, session_id: &str, tenant_id: &Uuid) -> Result<u64, AppError>;
    /// Revokes live rows past their timebox or idle limit.
    async fn revoke_expired_activity(&self, now: DateTime<Utc>, idle_cutoff: DateTime<Utc>) -> Result<ExpirySweep, AppError>;
}

#[async_trait::async_trait]
impl SessionActivityRepository for PostgresRepository {
    async fn find_session_activity(&self, user_id: &Uuid, session_id: &str) -> Result<Option<SessionActivity>, AppError> {
        let query = format!("SELECT {ACTIVITY_COLUMNS} FROM session_activity WHERE user_id = $1 AND session_id = $2");

        let record = sqlx::query_as::<_, SessionActivity>(&query)
            .bind(user_id)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::db("Failed to load session activity", e))?;

        Ok(record)
    }

    async fn insert_session_activity(&self, activity: &NewSessionActivity) -> Result<ActivityInsert, AppError> {
        let query = format!(
            r#"
            INSERT INTO session_activity (user_id, session_id, tenant_id, last_seen_at, last_reauth_at, created_at, expires_at, ip_hash, ua_hash)
            VALUES ($1, $2, $3, $4, $4, $4, $5, $6, $7)
            RETURNING {ACTIVITY_COLUMNS}
            "#
        );

        let result = sqlx::query_as::<_, SessionActivity>(&query)
            .bind(activity.user_id)
            .bind(&activity.session_id)
            .bind(activity.tenant_id)
            .bind(activity.created_at)
            .bind(activity.expires_at)
            .bind(&activity.ip_hash)
            .bind(&activity.ua_hash)
            .fetch_one(&self.pool)
            .await;

        match unique_violation_as_none(result).map_err(|e| AppError::db("Failed to create session activity", e))? {
            Some(record) => Ok(ActivityInsert::Created(record)),
            None => Ok(ActivityInsert::AlreadyExists),
        }
    }

    async fn touch_session_activity(
        &self,
        user_id: &Uuid,
        session_id: &str,
        at: DateTime<Utc>,
        ip_hash: Option<&str>,
        ua_hash: Option<&str>,
    ) -> Result<Option<SessionActivity>, AppError> {
        let query = format!(
            r#"
            UPDATE session_activity
            SET last_seen_at = GREATEST(last_seen_at, $3),
                ip_hash = COALESCE($4, ip_hash),
                ua_hash = COALESCE($5, ua_hash)
            WHERE user_id = $1 AND session_id = $2 AND revoked_at IS NULL
            RETURNING {ACTIVITY_COLUMNS}
            "#
        );

        let record = sqlx::query_as::<_, SessionActivity>(&query)
            .bind(user_id)
            .bind(session_id)
            .bind(at)
            .bind(ip_hash)
            .bind(ua_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::db("Failed to touch session activity", e))?;

        Ok(record)
    }

    async fn mark_session_reauth(&self, user_id: &Uuid, session_id: &str, at: DateTime<Utc>) -> Result<Option<SessionActivity>, AppError> {
        let query = format!(
            r#"
            UPDATE session_activity
            SET last_reauth_at = $3, last_seen_at = $3
            WHERE user_id = $1 AND session_id = $2 AND revoked_at IS NULL
            RETURNING {ACTIVITY_COLUMNS}
            "#
        );

        let record = sqlx::query_as::<_, SessionActivity>(&query)
            .bind(user_id)
            .bind(session_id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::db("Failed to record re-authentication", e))?;

        Ok(record)
    }

    async fn revoke_session_activity(&self, user_id: &Uuid, session_id: &str, at: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE session_activity SET revoked_at = $3 WHERE user_id = $1 AND session_id = $2 AND revoked_at IS NULL",
        )
        .bind(user_id)
        .bind(session_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::db("Failed to revoke session activity", e))?;

        Ok(result.rows_affected())
    }

    async fn assign_activity_tenant(&self, user_id: &Uuid, session_id: &str, tenant_id: &Uuid) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE session_activity SET tenant_id = $3 WHERE user_id = $1 AND session_id = $2 AND tenant_id IS NULL",
        )
        .bind(user_id)
        .bind(session_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::db("Failed to assign session activity tenant", e))?;

        Ok(result.rows_affected())
    }

    async fn revoke_expired_activity(&self, now: DateTime<Utc>, idle_cutoff: DateTime<Utc>) -> Result<ExpirySweep, AppError> {
        let timebox = sqlx::query("UPDATE session_activity SET revoked_at = $1 WHERE revoked_at IS NULL AND expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::db("Failed to revoke timeboxed sessions", e))?;

        let idle = sqlx::query(
            "UPDATE session_activity SET revoked_at = $1 WHERE revoked_at IS NULL AND GREATEST(last_seen_at, created_at) < $2",
        )
        .bind(now)
        .bind(idle_cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::db("Failed to revoke idle sessions", e))?;

        Ok(ExpirySweep {
            timebox_revoked: timebox.rows_affected(),
            idle_revoked: idle.rows_affected(),
        })
    }
}
