use crate::auth::Admitted;
use crate::models::health::HealthResponse;
use rocket::get;
use rocket::serde::json::Json;
use rocket_okapi::openapi;

/// Liveness probe. Public; never touches the session ledgers.
#[openapi(tag = "Health")]
#[get("/")]
pub async fn healthcheck(_admitted: Admitted) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![healthcheck]
}
