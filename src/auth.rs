//! Rocket side of the admission pipeline.
//!
//! [`Admitted`] and [`AdmittedJson`] translate the incoming request into
//! [`RequestParts`], run the managed [`Pipeline`](crate::pipeline::Pipeline),
//! and on a halt cache the rendered response for the catchers. Handlers only
//! ever see admitted requests.

pub mod credentials;

use crate::config::Config;
use crate::error::app_error::{AppError, HaltResponse};
use crate::error::json::{decode_payload, read_json_body};
use crate::middleware::RequestId;
use crate::pipeline::{Caller, Halt, IdempotencyClaim, RequestContext, RequestParts};
use crate::service::AppServices;
use crate::service::authenticator::Principal;
use rocket::data::{self, Data, FromData};
use rocket::http::Status;
use rocket::outcome::Outcome;
use rocket::request::{FromRequest, Outcome as RequestOutcome, Request};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::{MediaType, Object, RefOr, RequestBody, Response, Responses, SecurityRequirement, SecurityScheme, SecuritySchemeData};
use rocket_okapi::request::{OpenApiFromData, OpenApiFromRequest, RequestHeaderInput};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;
use validator::Validate;

/// Mount points the API is served under, longest first.
#[derive(Debug, Clone)]
pub struct ApiBasePaths(pub Vec<String>);

impl ApiBasePaths {
    pub fn new(mut paths: Vec<String>) -> Self {
        paths.sort_by_key(|p| std::cmp::Reverse(p.len()));
        Self(paths)
    }

    /// `path` with its base path removed; unchanged when no base matches.
    pub fn relative<'a>(&self, path: &'a str) -> &'a str {
        self.0
            .iter()
            .filter(|base| base.as_str() != "/")
            .find_map(|base| {
                path.strip_prefix(base.as_str())
                    .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            })
            .map(|rest| if rest.is_empty() { "/" } else { rest })
            .unwrap_or(path)
    }
}

/// Who the current request was admitted as, cached for logging and fairings.
#[derive(Debug, Clone)]
pub struct AuthSnapshot {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub session_id: String,
}

/// Builds the framework-free view of `req` the pipeline and authenticator work on.
pub fn request_parts(req: &Request<'_>, body: Option<Value>) -> RequestParts {
    let path = req.uri().path().as_str();
    let path = match req.rocket().state::<ApiBasePaths>() {
        Some(bases) => bases.relative(path),
        None => path,
    };

    let cookie_name = req
        .rocket()
        .state::<Config>()
        .map(|config| config.session.cookie_name.clone())
        .unwrap_or_default();
    let session_cookie = (!cookie_name.is_empty())
        .then(|| req.cookies().get_private(&cookie_name))
        .flatten()
        .map(|cookie| cookie.value().to_string());

    RequestParts {
        method: req.method(),
        path: path.to_string(),
        headers: req.headers().iter().map(|h| (h.name().to_string(), h.value().to_string())).collect(),
        session_cookie,
        client_ip: req.client_ip().map(|ip| ip.to_string()),
        body,
    }
}

fn services<'r>(req: &'r Request<'_>) -> Result<&'r AppServices, HaltResponse> {
    req.rocket().state::<AppServices>().ok_or_else(|| {
        let err = AppError::upstream("services", None, None, "application services are not managed");
        HaltResponse::cache_error(req, &err)
    })
}

async fn admit(req: &Request<'_>, body: Option<Value>) -> Result<Admitted, (Status, HaltResponse)> {
    let services = services(req).map_err(|halt| (Status::InternalServerError, halt))?;
    let ctx = RequestContext::new(Some(RequestId::peek(req)), request_parts(req, body));

    match services.pipeline.run(ctx).await {
        Ok(ctx) => Ok(Admitted::from_context(req, ctx)),
        Err(Halt::Reject(err)) => Err((Status::from(&err), HaltResponse::cache_error(req, &err))),
        // Any error status reaches the catcher, which sends the stored status.
        Err(Halt::Replay(stored)) => Err((Status::Conflict, HaltResponse::cache_replay(req, stored))),
    }
}

/// A request that passed every admission stage.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub request_id: String,
    pub caller: Caller,
    pub principal: Option<Principal>,
    pub parts: RequestParts,
}

impl Admitted {
    fn from_context(req: &Request<'_>, ctx: RequestContext) -> Self {
        let principal = ctx.principal();
        if let Some(principal) = &principal {
            req.local_cache(|| {
                Some(AuthSnapshot {
                    user_id: principal.user.id,
                    tenant_id: principal.tenant_id,
                    session_id: principal.session_id.clone(),
                })
            });
        }
        if let Some(claim) = &ctx.idempotency {
            req.local_cache(|| Some(claim.clone()));
        }

        Self {
            request_id: ctx.request_id().to_string(),
            caller: ctx.caller,
            principal,
            parts: ctx.parts,
        }
    }

    /// The authenticated caller; public and scheduler requests have none.
    pub fn principal(&self) -> Result<&Principal, AppError> {
        self.principal.as_ref().ok_or(AppError::AuthRequired)
    }

    pub fn require_scheduler(&self) -> Result<(), AppError> {
        match self.caller {
            Caller::Scheduler => Ok(()),
            _ => Err(AppError::Forbidden),
        }
    }
}

/// The idempotency key reserved for this request, if any.
pub fn idempotency_claim(req: &Request<'_>) -> Option<IdempotencyClaim> {
    req.local_cache(|| None::<IdempotencyClaim>).clone()
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Admitted {
    type Error = HaltResponse;

    async fn from_request(req: &'r Request<'_>) -> RequestOutcome<Self, Self::Error> {
        match admit(req, None).await {
            Ok(admitted) => Outcome::Success(admitted),
            Err(halt) => Outcome::Error(halt),
        }
    }
}

/// An admitted request plus its decoded and validated JSON body.
///
/// The raw body is part of the admission decision: the tenant guard and the
/// idempotency fingerprint both look at it.
#[derive(Debug)]
pub struct AdmittedJson<T> {
    pub admitted: Admitted,
    pub payload: T,
}

#[rocket::async_trait]
impl<'r, T> FromData<'r> for AdmittedJson<T>
where
    T: DeserializeOwned + Validate + Send,
{
    type Error = HaltResponse;

    async fn from_data(req: &'r Request<'_>, data: Data<'r>) -> data::Outcome<'r, Self> {
        let body = match read_json_body(req, data).await {
            Ok(body) => body,
            Err(err) => return Outcome::Error((Status::from(&err), HaltResponse::cache_error(req, &err))),
        };

        let admitted = match admit(req, body.clone()).await {
            Ok(admitted) => admitted,
            Err(halt) => return Outcome::Error(halt),
        };

        let payload = decode_payload::<T>(body).and_then(|payload: T| {
            payload.validate()?;
            Ok(payload)
        });
        match payload {
            Ok(payload) => Outcome::Success(AdmittedJson { admitted, payload }),
            Err(err) => Outcome::Error((Status::from(&err), HaltResponse::cache_error(req, &err))),
        }
    }
}

/// Request parts for the session-maintenance routes that call the
/// authenticator directly instead of going through admission.
#[derive(Debug, Clone)]
pub struct SessionRequest(pub RequestParts);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for SessionRequest {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> RequestOutcome<Self, Self::Error> {
        RequestId::peek(req);
        Outcome::Success(SessionRequest(request_parts(req, None)))
    }
}

fn session_security() -> RequestHeaderInput {
    let security_scheme = SecurityScheme {
        description: Some(
            "Bearer access token from the identity provider, or the HttpOnly session cookie set by POST /auth/login.".to_string(),
        ),
        data: SecuritySchemeData::Http {
            scheme: "bearer".to_string(),
            bearer_format: Some("JWT".to_string()),
        },
        extensions: Object::default(),
    };

    let mut security_req = SecurityRequirement::new();
    security_req.insert("sessionAuth".to_string(), Vec::new());

    RequestHeaderInput::Security("sessionAuth".to_string(), security_scheme, security_req)
}

fn auth_responses() -> Responses {
    let mut responses = Responses::default();
    for (code, description) in [
        ("401", "Authentication required, expired or revoked"),
        ("403", "Re-authentication required or tenant access denied"),
        ("429", "Too Many Requests"),
    ] {
        responses.responses.insert(
            code.to_string(),
            RefOr::Object(Response {
                description: description.to_string(),
                ..Default::default()
            }),
        );
    }
    responses
}

impl<'a> OpenApiFromRequest<'a> for Admitted {
    fn from_request_input(_gen: &mut OpenApiGenerator, _name: String, _required: bool) -> rocket_okapi::Result<RequestHeaderInput> {
        Ok(session_security())
    }

    fn get_responses(_gen: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        Ok(auth_responses())
    }
}

impl<'a> OpenApiFromRequest<'a> for SessionRequest {
    fn from_request_input(_gen: &mut OpenApiGenerator, _name: String, _required: bool) -> rocket_okapi::Result<RequestHeaderInput> {
        Ok(session_security())
    }

    fn get_responses(_gen: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        Ok(auth_responses())
    }
}

impl<'r, T> OpenApiFromData<'r> for AdmittedJson<T>
where
    T: DeserializeOwned + Validate + Send + JsonSchema,
{
    fn request_body(generator: &mut OpenApiGenerator) -> rocket_okapi::Result<RequestBody> {
        let mut content = rocket_okapi::okapi::Map::new();
        content.insert(
            "application/json".to_string(),
            MediaType {
                schema: Some(generator.json_schema::<T>()),
                ..MediaType::default()
            },
        );

        Ok(RequestBody {
            content,
            required: true,
            ..RequestBody::default()
        })
    }
}
