use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::idempotency::{IdempotencyDecision, IdempotencyRecord};
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait::async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Reserves `key` for this request or reports what an earlier request left behind.
    async fn begin_idempotent(&self, tenant_id: &Uuid, key: &str, fingerprint: &str, now: DateTime<Utc>) -> Result<IdempotencyDecision, AppError>;
    async fn complete_idempotent(&self, tenant_id: &Uuid, key: &str, status_code: u16, body: &str, now: DateTime<Utc>) -> Result<(), AppError>;
    /// Drops an unfinished reservation so the client may retry.
    async fn release_idempotent(&self, tenant_id: &Uuid, key: &str) -> Result<(), AppError>;
    async fn purge_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Decision for a key that was already present.
pub(crate) fn decide_existing(record: &IdempotencyRecord, fingerprint: &str) -> IdempotencyDecision {
    if record.fingerprint != fingerprint {
        return IdempotencyDecision::Conflict;
    }
    match record.stored_response() {
        Some(stored) => IdempotencyDecision::Replay(stored),
        None => IdempotencyDecision::InFlight,
    }
}

#[async_trait::async_trait]
impl IdempotencyRepository for PostgresRepository {
    async fn begin_idempotent(&self, tenant_id: &Uuid, key: &str, fingerprint: &str, now: DateTime<Utc>) -> Result<IdempotencyDecision, AppError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (tenant_id, key, fingerprint, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, key) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(key)
        .bind(fingerprint)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::db("Failed to reserve idempotency key", e))?;

        if inserted.rows_affected() == 1 {
            return Ok(IdempotencyDecision::Fresh);
        }

        let existing = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT tenant_id, key, fingerprint, status_code, response_body, created_at, completed_at
            FROM idempotency_keys
            WHERE tenant_id = $1 AND key = $2
            "#,
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::db("Failed to read idempotency key", e))?;

        // Released between our insert attempt and the read: treat as in flight, the client retries.
        Ok(existing.map_or(IdempotencyDecision::InFlight, |record| decide_existing(&record, fingerprint)))
    }

    async fn complete_idempotent(&self, tenant_id: &Uuid, key: &str, status_code: u16, body: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status_code = $3, response_body = $4, completed_at = $5
            WHERE tenant_id = $1 AND key = $2 AND completed_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .bind(key)
        .bind(i32::from(status_code))
        .bind(body)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::db("Failed to record idempotent response", e))?;

        Ok(())
    }

    async fn release_idempotent(&self, tenant_id: &Uuid, key: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM idempotency_keys WHERE tenant_id = $1 AND key = $2 AND completed_at IS NULL")
            .bind(tenant_id)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::db("Failed to release idempotency key", e))?;

        Ok(())
    }

    async fn purge_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::db("Failed to purge idempotency keys", e))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::idempotency::StoredResponse;

    fn record(fingerprint: &str, status: Option<i32>, body: Option<&str>) -> IdempotencyRecord {
        IdempotencyRecord {
            tenant_id: Uuid::new_v4(),
            key: "k1".to_string(),
            fingerprint: fingerprint.to_string(),
            status_code: status,
            response_body: body.map(str::to_string),
            created_at: Utc::now(),
            completed_at: status.map(|_| Utc::now()),
        }
    }

    #[test]
    fn different_fingerprint_conflicts() {
        assert_eq!(decide_existing(&record("a", Some(201), Some("{}")), "b"), IdempotencyDecision::Conflict);
    }

    #[test]
    fn completed_record_replays() {
        let decision = decide_existing(&record("a", Some(201), Some(r#"{"id":1}"#)), "a");
        assert_eq!(
            decision,
            IdempotencyDecision::Replay(StoredResponse {
                status_code: 201,
                body: r#"{"id":1}"#.to_string()
            })
        );
    }

    #[test]
    fn unfinished_record_is_in_flight() {
        assert_eq!(decide_existing(&record("a", None, None), "a"), IdempotencyDecision::InFlight);
    }
}
