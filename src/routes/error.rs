use crate::error::app_error::{HaltResponse, RenderedError};
use crate::middleware::RequestId;
use rocket::http::Status;
use rocket::{Request, catch};
use serde_json::json;

fn code_for(status: Status) -> &'static str {
    match status.code {
        400 => "BAD_REQUEST",
        401 => "AUTH_REQUIRED",
        403 => "FORBIDDEN",
        404 => "NOT_FOUND",
        409 => "CONFLICT",
        422 => "VALIDATION_ERROR",
        429 => "RATE_LIMITED",
        504 => "UPSTREAM_TIMEOUT",
        code if code >= 500 => "INTERNAL_ERROR",
        _ => "ERROR",
    }
}

/// The halt a guard cached for this request, or a generic envelope for `status`.
fn caught(status: Status, req: &Request<'_>) -> HaltResponse {
    HaltResponse::cached(req).unwrap_or_else(|| {
        let request_id = RequestId::peek(req);
        HaltResponse::Error(RenderedError {
            status,
            body: json!({
                "error": {
                    "code": code_for(status),
                    "message": status.reason().unwrap_or("Error"),
                    "request_id": request_id,
                }
            }),
            retry_after_secs: None,
        })
    })
}

#[catch(404)]
pub fn not_found(req: &Request) -> HaltResponse {
    caught(Status::NotFound, req)
}

#[catch(409)]
pub fn conflict(req: &Request) -> HaltResponse {
    caught(Status::Conflict, req)
}

#[catch(429)]
pub fn too_many_requests(req: &Request) -> HaltResponse {
    caught(Status::TooManyRequests, req)
}

#[catch(default)]
pub fn default_catcher(status: Status, req: &Request) -> HaltResponse {
    caught(status, req)
}
