use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use uuid::Uuid;

/// Privileged user → tenant lookup, the last resort of tenant resolution.
#[async_trait::async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn owner_for_user(&self, user_id: &Uuid) -> Result<Option<Uuid>, AppError>;
}

#[async_trait::async_trait]
impl TenantDirectory for PostgresRepository {
    async fn owner_for_user(&self, user_id: &Uuid) -> Result<Option<Uuid>, AppError> {
        let owner = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT owner_id
            FROM tenant_members
            WHERE user_id = $1
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::db("Failed to look up tenant owner", e))?;

        Ok(owner)
    }
}
