use rocket::http::{ContentType, Header, Status};
use rocket::response::Responder;
use rocket::{Request, Response};
use rocket_okapi::OpenApiError;
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::Responses;
use rocket_okapi::response::OpenApiResponderInner;
use serde_json::json;
use std::io::Cursor;
use thiserror::Error;
use tracing::{error, warn};
use validator::ValidationErrors;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Authentication required")]
    AuthRequired,
    #[error("Authentication expired")]
    AuthExpired,
    #[error("Session expired")]
    SessionExpired,
    #[error("Session could not be established")]
    SessionInvalid,
    #[error("Please confirm your password to continue")]
    ReauthRequired,
    #[error("User interaction required")]
    InteractionRequired,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Tenant owner not found")]
    OwnerNotFound,
    #[error("Access denied for this tenant")]
    RlsDenied,
    #[error("Forbidden")]
    Forbidden,
    #[error("Too many requests")]
    RateLimited { retry_after_secs: u64 },
    #[error("Idempotency key was already used with a different request")]
    IdempotencyConflict,
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationErrors),
    #[error("Upstream service error")]
    Upstream {
        stage: &'static str,
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },
    #[error("Upstream service timed out")]
    UpstreamTimeout { stage: &'static str },
    #[error("Internal server error")]
    Db {
        message: String,
        #[source]
        source: sqlx::error::Error,
    },
    #[error("Internal server error")]
    ConfigurationError {
        message: String,
        #[source]
        source: figment::Error,
    },
}

impl AppError {
    pub fn db(message: impl Into<String>, source: sqlx::error::Error) -> Self {
        Self::Db {
            message: message.into(),
            source,
        }
    }

    pub fn upstream(stage: &'static str, status: Option<u16>, code: Option<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            stage,
            status,
            code,
            message: message.into(),
        }
    }

    /// Stable machine-readable code clients branch on.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::AuthRequired => "AUTH_REQUIRED",
            AppError::AuthExpired => "AUTH_EXPIRED",
            AppError::SessionExpired => "SESSION_EXPIRED",
            AppError::SessionInvalid => "SESSION_INVALID",
            AppError::ReauthRequired => "REAUTH_REQUIRED",
            AppError::InteractionRequired => "VALIDATION_ERROR",
            AppError::InvalidCredentials => "INVALID_CREDENTIALS",
            AppError::OwnerNotFound => "OWNER_NOT_FOUND",
            AppError::RlsDenied => "RLS_DENIED",
            AppError::Forbidden => "FORBIDDEN",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::Upstream { .. } => "UPSTREAM_ERROR",
            AppError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            AppError::Db { .. } | AppError::ConfigurationError { .. } => "INTERNAL_ERROR",
        }
    }

    /// Render the `{error: {code, message, request_id}}` envelope.
    pub fn envelope(&self, request_id: &str) -> serde_json::Value {
        let message = match self {
            AppError::InteractionRequired => "Explicit user interaction is required to extend the session".to_string(),
            other => other.to_string(),
        };

        json!({
            "error": {
                "code": self.code(),
                "message": message,
                "request_id": request_id,
            }
        })
    }
}

impl From<&AppError> for Status {
    fn from(e: &AppError) -> Self {
        match e {
            AppError::AuthRequired => Status::Unauthorized,
            AppError::AuthExpired => Status::Unauthorized,
            AppError::SessionExpired => Status::Unauthorized,
            AppError::SessionInvalid => Status::Unauthorized,
            AppError::InvalidCredentials => Status::Unauthorized,
            AppError::ReauthRequired => Status::Forbidden,
            AppError::InteractionRequired => Status::BadRequest,
            AppError::OwnerNotFound => Status::Forbidden,
            AppError::RlsDenied => Status::Forbidden,
            AppError::Forbidden => Status::Forbidden,
            AppError::RateLimited { .. } => Status::TooManyRequests,
            AppError::IdempotencyConflict => Status::Conflict,
            AppError::BadRequest(_) => Status::BadRequest,
            AppError::NotFound(_) => Status::NotFound,
            AppError::ValidationError(_) => Status::BadRequest,
            AppError::Upstream { status, .. } => status
                .and_then(Status::from_code)
                .filter(|s| s.code >= 400)
                .unwrap_or(Status::InternalServerError),
            AppError::UpstreamTimeout { .. } => Status::GatewayTimeout,
            AppError::Db { .. } => Status::InternalServerError,
            AppError::ConfigurationError { .. } => Status::InternalServerError,
        }
    }
}

/// Pre-rendered error response. Request-local caches need `Send + Sync + 'static`
/// values, so guards cache this instead of the error itself.
#[derive(Debug, Clone)]
pub struct RenderedError {
    pub status: Status,
    pub body: serde_json::Value,
    pub retry_after_secs: Option<u64>,
}

impl RenderedError {
    pub fn from_error(err: &AppError, request_id: &str) -> Self {
        Self {
            status: Status::from(err),
            body: err.envelope(request_id),
            retry_after_secs: match err {
                AppError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
                _ => None,
            },
        }
    }

    pub fn into_response(self) -> rocket::response::Result<'static> {
        let body = self.body.to_string();
        let mut response = Response::build();
        response.status(self.status).header(ContentType::JSON).sized_body(body.len(), Cursor::new(body));
        if let Some(secs) = self.retry_after_secs {
            response.header(Header::new("Retry-After", secs.to_string()));
        }
        response.ok()
    }
}

/// What a guard that halted the request wants the catcher to send.
#[derive(Debug, Clone)]
pub enum HaltResponse {
    Error(RenderedError),
    Replay(crate::models::idempotency::StoredResponse),
}

impl HaltResponse {
    /// Logs `err` and caches its rendering for the catcher. The first halt
    /// cached for a request wins.
    pub fn cache_error(req: &Request<'_>, err: &AppError) -> HaltResponse {
        log_app_error(err, req);
        let request_id = crate::middleware::RequestId::peek(req);
        let halt = HaltResponse::Error(RenderedError::from_error(err, &request_id));
        req.local_cache(|| Some(halt.clone()));
        halt
    }

    pub fn cache_replay(req: &Request<'_>, stored: crate::models::idempotency::StoredResponse) -> HaltResponse {
        let halt = HaltResponse::Replay(stored);
        req.local_cache(|| Some(halt.clone()));
        halt
    }

    pub fn cached(req: &Request<'_>) -> Option<HaltResponse> {
        req.local_cache(|| None::<HaltResponse>).clone()
    }

    pub fn into_response(self) -> rocket::response::Result<'static> {
        match self {
            HaltResponse::Error(rendered) => rendered.into_response(),
            HaltResponse::Replay(stored) => {
                let status = Status::from_code(stored.status_code).unwrap_or(Status::Ok);
                Response::build()
                    .status(status)
                    .header(ContentType::JSON)
                    .header(Header::new("Idempotent-Replayed", "true"))
                    .sized_body(stored.body.len(), Cursor::new(stored.body))
                    .ok()
            }
        }
    }
}

impl<'r> Responder<'r, 'static> for HaltResponse {
    fn respond_to(self, _req: &'r Request<'_>) -> rocket::response::Result<'static> {
        self.into_response()
    }
}

pub(crate) fn log_app_error(err: &AppError, req: &Request<'_>) {
    let request_id = crate::middleware::RequestId::peek(req);
    let user_id = req
        .local_cache(|| None::<crate::auth::AuthSnapshot>)
        .as_ref()
        .map(|u| u.user_id.to_string())
        .unwrap_or_else(|| "anonymous".to_string());

    match err {
        AppError::Upstream { stage, status, code, message } => error!(
            error = ?err,
            stage = %stage,
            upstream_status = ?status,
            upstream_code = ?code,
            upstream_message = %message,
            request_id = %request_id,
            user_id = %user_id,
            method = %req.method(),
            uri = %req.uri(),
            "upstream call failed"
        ),
        AppError::Db { .. } | AppError::ConfigurationError { .. } | AppError::UpstreamTimeout { .. } => error!(
            error = ?err,
            request_id = %request_id,
            user_id = %user_id,
            method = %req.method(),
            uri = %req.uri(),
            "request failed"
        ),
        _ => warn!(
            code = err.code(),
            request_id = %request_id,
            user_id = %user_id,
            method = %req.method(),
            uri = %req.uri(),
            "request rejected"
        ),
    }
}

impl<'r> Responder<'r, 'static> for AppError {
    fn respond_to(self, req: &'r Request<'_>) -> rocket::response::Result<'static> {
        log_app_error(&self, req);
        let request_id = crate::middleware::RequestId::peek(req);
        RenderedError::from_error(&self, &request_id).into_response()
    }
}

impl OpenApiResponderInner for AppError {
    fn responses(_gen: &mut OpenApiGenerator) -> Result<Responses, OpenApiError> {
        use rocket_okapi::okapi::openapi3::{RefOr, Response as OpenApiResponse};
        let mut responses = Responses::default();
        for (code, description) in [
            ("400", "Bad Request"),
            ("401", "Authentication required or expired"),
            ("403", "Re-authentication required or tenant access denied"),
            ("429", "Too Many Requests"),
            ("500", "Internal Server Error"),
        ] {
            responses.responses.insert(
                code.to_string(),
                RefOr::Object(OpenApiResponse {
                    description: description.to_string(),
                    ..Default::default()
                }),
            );
        }
        Ok(responses)
    }
}

impl From<figment::Error> for AppError {
    fn from(e: figment::Error) -> Self {
        AppError::ConfigurationError {
            message: "Failed to read configuration".to_string(),
            source: e,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => AppError::NotFound("Resource not found".to_string()),
            _ => AppError::db("Database error", e),
        }
    }
}
