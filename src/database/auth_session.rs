use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::auth_session::{AuthSession, NewAuthSession, TokenRotation};
use chrono::{DateTime, Utc};
use uuid::Uuid;

const AUTH_SESSION_COLUMNS: &str = "id, session_id, user_id, tenant_id, access_token, refresh_token, access_expires_at, \
     last_refresh_at, created_at, updated_at, revoked_at, ip_hash, ua_hash";

#[async_trait::async_trait]
pub trait AuthSessionRepository: Send + Sync {
    async fn insert_auth_session(&self, session: &NewAuthSession) -> Result<AuthSession, AppError>;
    /// Newest non-revoked row for the session id.
    async fn find_current_auth_session(&self, session_id: &str) -> Result<Option<AuthSession>, AppError>;
    async fn rotate_auth_session_tokens(&self, id: &Uuid, rotation: &TokenRotation) -> Result<Option<AuthSession>, AppError>;
    /// Stamps `revoked_at` on every live row for the session id; returns rows touched.
    async fn revoke_auth_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<u64, AppError>;
}

#[async_trait::async_trait]
impl AuthSessionRepository for PostgresRepository {
    async fn insert_auth_session(&self, session: &NewAuthSession) -> Result<AuthSession, AppError> {
        let query = format!(
            r#"
            INSERT INTO auth_sessions (session_id, user_id, tenant_id, access_token, refresh_token, access_expires_at,
                                       last_refresh_at, created_at, updated_at, ip_hash, ua_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $7, $8, $9)
            RETURNING {AUTH_SESSION_COLUMNS}
            "#
        );

        let record = sqlx::query_as::<_, AuthSession>(&query)
            .bind(&session.session_id)
            .bind(session.user_id)
            .bind(session.tenant_id)
            .bind(&session.access_token)
            .bind(&session.refresh_token)
            .bind(session.access_expires_at)
            .bind(session.created_at)
            .bind(&session.ip_hash)
            .bind(&session.ua_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::db("Failed to create auth session", e))?;

        Ok(record)
    }

    async fn find_current_auth_session(&self, session_id: &str) -> Result<Option<AuthSession>, AppError> {
        let query = format!(
            r#"
            SELECT {AUTH_SESSION_COLUMNS}
            FROM auth_sessions
            WHERE session_id = $1
              AND revoked_at IS NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#
        );

        let record = sqlx::query_as::<_, AuthSession>(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::db("Failed to load auth session", e))?;

        Ok(record)
    }

    async fn rotate_auth_session_tokens(&self, id: &Uuid, rotation: &TokenRotation) -> Result<Option<AuthSession>, AppError> {
        let query = format!(
            r#"
            UPDATE auth_sessions
            SET access_token = $2,
                refresh_token = $3,
                access_expires_at = $4,
                last_refresh_at = $5,
                updated_at = $5
            WHERE id = $1
              AND revoked_at IS NULL
            RETURNING {AUTH_SESSION_COLUMNS}
            "#
        );

        let record = sqlx::query_as::<_, AuthSession>(&query)
            .bind(id)
            .bind(&rotation.access_token)
            .bind(&rotation.refresh_token)
            .bind(rotation.access_expires_at)
            .bind(rotation.refreshed_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::db("Failed to rotate auth session tokens", e))?;

        Ok(record)
    }

    async fn revoke_auth_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE auth_sessions
            SET revoked_at = $2, updated_at = $2
            WHERE session_id = $1
              AND revoked_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::db("Failed to revoke auth session", e))?;

        Ok(result.rows_affected())
    }
}
