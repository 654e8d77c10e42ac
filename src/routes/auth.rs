use crate::auth::{AdmittedJson, SessionRequest};
use crate::config::Config;
use crate::error::app_error::AppError;
use crate::middleware::rate_limit::RateLimit;
use crate::models::session::{LoginRequest, LoginResponse, MessageResponse, PasswordRecoveryRequest};
use crate::service::AppServices;
use crate::service::session_activity::TIMEBOX_HOURS;
use rocket::http::{Cookie, CookieJar};
use rocket::response::status;
use rocket::serde::json::Json;
use rocket::{State, post};
use rocket_okapi::openapi;

fn session_cookie(config: &Config, session_id: String) -> Cookie<'static> {
    Cookie::build((config.session.cookie_name.clone(), session_id))
        .path("/")
        .http_only(true)
        .secure(config.cookie_secure())
        .same_site(config.session.same_site())
        .max_age(rocket::time::Duration::hours(TIMEBOX_HOURS))
        .build()
}

/// Sign in with email and password and receive an HttpOnly session cookie
#[openapi(tag = "Auth")]
#[post("/login", data = "<payload>")]
pub async fn login(
    services: &State<AppServices>,
    config: &State<Config>,
    cookies: &CookieJar<'_>,
    payload: AdmittedJson<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let AdmittedJson { admitted, payload } = payload;

    let (created, user) = services.authenticator.login(&payload.email, &payload.password, &admitted.parts).await?;
    cookies.add_private(session_cookie(config, created.session_id.clone()));

    Ok(Json(LoginResponse {
        user_id: user.id,
        tenant_id: created.record.tenant_id,
        email: user.email,
        expires_at: created.expires_at,
    }))
}

/// Ask the identity provider to send password recovery instructions
///
/// Always answers 202 so the response does not reveal whether the account exists.
#[openapi(tag = "Auth")]
#[post("/password-recovery", data = "<payload>")]
pub async fn password_recovery(
    services: &State<AppServices>,
    payload: AdmittedJson<PasswordRecoveryRequest>,
) -> status::Accepted<Json<MessageResponse>> {
    services.authenticator.request_password_recovery(&payload.payload.email).await;

    status::Accepted(Json(MessageResponse {
        message: "If the address belongs to an account, recovery instructions are on their way.".to_string(),
    }))
}

/// End the current session and clear the session cookie
#[openapi(tag = "Auth")]
#[post("/logout")]
pub async fn logout(
    services: &State<AppServices>,
    config: &State<Config>,
    cookies: &CookieJar<'_>,
    _rate_limit: RateLimit,
    request: SessionRequest,
) -> Result<status::NoContent, AppError> {
    services.authenticator.logout(&request.0).await?;
    cookies.remove_private(Cookie::build(config.session.cookie_name.clone()).path("/").build());
    Ok(status::NoContent)
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![login, password_recovery, logout]
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{TEST_PASSWORD, TestHarness, test_client};
    use rocket::http::{ContentType, Status};
    use serde_json::{Value, json};

    const COOKIE: &str = "stockline_session";

    #[rocket::async_test]
    async fn login_sets_http_only_session_cookie() {
        let harness = TestHarness::new();
        let (email, user_id, tenant_id) = harness.password_user();
        let client = test_client(&harness, None).await;

        let response = client
            .post("/api/v1/auth/login")
            .header(ContentType::JSON)
            .body(json!({ "email": email, "password": TEST_PASSWORD }).to_string())
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::Ok);
        let cookie = response.cookies().get(COOKIE).expect("session cookie");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.path(), Some("/"));

        let body: Value = response.into_json().await.expect("json body");
        assert_eq!(body["user_id"], user_id.to_string());
        assert_eq!(body["tenant_id"], tenant_id.to_string());

        let session_id = client.cookies().get_private(COOKIE).expect("private cookie").value().to_string();
        let stored = harness.store.current_auth_session(&session_id).expect("stored session");
        assert_eq!(stored.user_id, user_id);
    }

    #[rocket::async_test]
    async fn wrong_password_is_rejected_without_cookie() {
        let harness = TestHarness::new();
        let (email, _, _) = harness.password_user();
        let client = test_client(&harness, None).await;

        let response = client
            .post("/api/v1/auth/login")
            .header(ContentType::JSON)
            .body(json!({ "email": email, "password": "wrong" }).to_string())
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::Unauthorized);
        assert!(response.cookies().get(COOKIE).is_none());
        let body: Value = response.into_json().await.expect("json body");
        assert_eq!(body["error"]["code"], "INVALID_CREDENTIALS");
        assert_eq!(harness.store.auth_session_count(), 0);
    }

    #[rocket::async_test]
    async fn malformed_email_is_a_validation_error() {
        let harness = TestHarness::new();
        let client = test_client(&harness, None).await;

        let response = client
            .post("/api/v1/auth/login")
            .header(ContentType::JSON)
            .body(json!({ "email": "not-an-email", "password": "x" }).to_string())
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::BadRequest);
        let body: Value = response.into_json().await.expect("json body");
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert!(body["error"]["request_id"].is_string());
    }

    #[rocket::async_test]
    async fn password_recovery_is_neutral_for_unknown_accounts() {
        let harness = TestHarness::new();
        let client = test_client(&harness, None).await;

        let response = client
            .post("/api/v1/auth/password-recovery")
            .header(ContentType::JSON)
            .body(json!({ "email": "nobody@example.com" }).to_string())
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::Accepted);
    }

    #[rocket::async_test]
    async fn logout_revokes_session_and_clears_cookie() {
        let harness = TestHarness::new();
        let (email, _, _) = harness.password_user();
        let client = test_client(&harness, None).await;

        client
            .post("/api/v1/auth/login")
            .header(ContentType::JSON)
            .body(json!({ "email": email, "password": TEST_PASSWORD }).to_string())
            .dispatch()
            .await;
        let session_id = client.cookies().get_private(COOKIE).expect("private cookie").value().to_string();

        let response = client.post("/api/v1/auth/logout").dispatch().await;
        assert_eq!(response.status(), Status::NoContent);
        assert!(harness.store.current_auth_session(&session_id).is_none());

        let response = client.get("/api/v1/session").dispatch().await;
        assert_eq!(response.status(), Status::Unauthorized);

        let again = client.post("/api/v1/auth/logout").dispatch().await;
        assert_eq!(again.status(), Status::NoContent);
    }
}
