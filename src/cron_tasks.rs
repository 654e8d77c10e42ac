use crate::Config;
use crate::db::connect_services;
use crate::error::app_error::AppError;
use crate::models::session::ExpireSessionsResponse;
use crate::service::AppServices;
use chrono::Duration;
use tracing::info;

/// Revokes idle and timeboxed sessions, then drops idempotency keys older
/// than `retention_hours`.
pub(crate) async fn run_expiry(services: &AppServices, retention_hours: i64) -> Result<ExpireSessionsResponse, AppError> {
    let sweep = services.authenticator.sweep_expired().await?;

    let cutoff = services.clock.now() - Duration::hours(retention_hours.max(1));
    let idempotency_purged = services.idempotency.purge_idempotency_before(cutoff).await?;
    info!(idempotency_purged, %cutoff, "idempotency keys purged");

    Ok(ExpireSessionsResponse {
        timebox_revoked: sweep.timebox_revoked,
        idle_revoked: sweep.idle_revoked,
        idempotency_purged,
    })
}

pub async fn expire_sessions(config: &Config) -> Result<ExpireSessionsResponse, String> {
    let (pool, services) = connect_services(config, None).await?;

    let result = run_expiry(&services, config.idempotency.retention_hours)
        .await
        .map_err(|err| format!("Failed to expire sessions: {err:?}"));

    pool.close().await;
    result
}
