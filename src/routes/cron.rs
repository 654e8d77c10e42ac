use crate::auth::Admitted;
use crate::config::Config;
use crate::cron_tasks::run_expiry;
use crate::error::app_error::AppError;
use crate::models::session::ExpireSessionsResponse;
use crate::service::AppServices;
use rocket::serde::json::Json;
use rocket::{State, post, routes};

/// Scheduled maintenance; admitted only with the `X-Cron-Token` secret.
#[post("/expire-sessions")]
pub async fn expire_sessions(
    services: &State<AppServices>,
    config: &State<Config>,
    admitted: Admitted,
) -> Result<Json<ExpireSessionsResponse>, AppError> {
    admitted.require_scheduler()?;
    let result = run_expiry(services, config.idempotency.retention_hours).await?;
    Ok(Json(result))
}

pub fn routes() -> Vec<rocket::Route> {
    routes![expire_sessions]
}

#[cfg(test)]
mod tests {
    use crate::service::session_activity::IDLE_TIMEOUT_MINUTES;
    use crate::test_utils::{TEST_CRON_TOKEN, TestHarness, bearer_parts, test_client};
    use chrono::Duration;
    use rocket::http::{Header, Method, Status};
    use serde_json::Value;

    #[rocket::async_test]
    async fn wrong_or_missing_token_is_forbidden() {
        let harness = TestHarness::new();
        let client = test_client(&harness, None).await;

        let missing = client.post("/api/v1/cron/expire-sessions").dispatch().await;
        assert_eq!(missing.status(), Status::Forbidden);

        let wrong = client
            .post("/api/v1/cron/expire-sessions")
            .header(Header::new("X-Cron-Token", "guess"))
            .dispatch()
            .await;
        assert_eq!(wrong.status(), Status::Forbidden);
        let body: Value = wrong.into_json().await.expect("json body");
        assert_eq!(body["error"]["code"], "FORBIDDEN");
    }

    #[rocket::async_test]
    async fn scheduler_sweeps_idle_sessions() {
        let harness = TestHarness::new();
        let (token, user_id, _) = harness.bearer_user();
        let parts = bearer_parts(Method::Get, "/session", &token);
        let principal = harness.authenticator.authenticate(&parts).await.expect("authenticated");
        let client = test_client(&harness, None).await;

        harness.clock.advance(Duration::minutes(IDLE_TIMEOUT_MINUTES + 5));
        let response = client
            .post("/api/v1/cron/expire-sessions")
            .header(Header::new("X-Cron-Token", TEST_CRON_TOKEN))
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::Ok);
        let body: Value = response.into_json().await.expect("json body");
        assert_eq!(body["idle_revoked"], 1);
        assert_eq!(body["timebox_revoked"], 0);

        let record = harness.store.activity(&user_id, &principal.session_id).expect("activity record");
        assert!(record.revoked_at.is_some());
    }
}
