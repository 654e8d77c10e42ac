use crate::auth::{Admitted, SessionRequest};
use crate::error::app_error::AppError;
use crate::middleware::rate_limit::RateLimit;
use crate::models::session::{ActivityResponse, ReauthRequest, SessionInfoResponse};
use crate::service::AppServices;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use rocket_okapi::openapi;
use validator::Validate;

/// Who the current session belongs to and where it stands against the idle,
/// timebox and re-authentication limits
#[openapi(tag = "Session")]
#[get("/")]
pub async fn get_session(admitted: Admitted) -> Result<Json<SessionInfoResponse>, AppError> {
    let principal = admitted.principal()?;

    Ok(Json(SessionInfoResponse {
        user_id: principal.user.id,
        tenant_id: principal.tenant_id,
        email: principal.user.email.clone(),
        flow: principal.flow,
        session_id: principal.session_id.clone(),
        last_seen_at: principal.activity.last_seen_at,
        last_reauth_at: principal.activity.last_reauth_at,
        expires_at: principal.activity.expires_at,
    }))
}

/// Reset the idle timer. Requires `X-User-Interaction: true`.
#[openapi(tag = "Session")]
#[post("/touch")]
pub async fn touch(services: &State<AppServices>, _rate_limit: RateLimit, request: SessionRequest) -> Result<Json<ActivityResponse>, AppError> {
    let activity = services.authenticator.touch(&request.0).await?;
    Ok(Json(ActivityResponse::from(&activity)))
}

/// Confirm the password to unlock sensitive operations for the next few minutes
#[openapi(tag = "Session")]
#[post("/reauth", data = "<payload>")]
pub async fn reauth(
    services: &State<AppServices>,
    _rate_limit: RateLimit,
    request: SessionRequest,
    payload: Json<ReauthRequest>,
) -> Result<Json<ActivityResponse>, AppError> {
    payload.validate()?;

    let activity = services.authenticator.mark_reauth(&request.0, &payload.password).await?;
    Ok(Json(ActivityResponse::from(&activity)))
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![get_session, touch, reauth]
}
