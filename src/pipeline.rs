//! Request admission pipeline.
//!
//! An ordered list of [`Stage`]s runs over a framework-free view of the
//! request. Each stage either lets the request continue or halts it with a
//! rejection or a stored replay; nothing after a halt runs. The Rocket guards
//! in `auth` build the [`RequestParts`] and turn a [`Halt`] into a response.

pub mod stages;

use crate::error::app_error::AppError;
use crate::models::idempotency::StoredResponse;
use crate::models::session_activity::SessionActivity;
use crate::service::authenticator::{Principal, VerifiedCredential};
use async_trait::async_trait;
use rocket::http::Method;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// The parts of an HTTP request the pipeline looks at.
#[derive(Debug, Clone)]
pub struct RequestParts {
    pub method: Method,
    /// Path relative to the API base path, e.g. `/session/touch`.
    pub path: String,
    pub headers: Vec<(String, String)>,
    /// Decrypted session id from the private session cookie.
    pub session_cookie: Option<String>,
    pub client_ip: Option<String>,
    pub body: Option<Value>,
}

impl RequestParts {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            session_cookie: None,
            client_ip: None,
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_session_cookie(mut self, session_id: impl Into<String>) -> Self {
        self.session_cookie = Some(session_id.into());
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)).map(|(_, value)| value.as_str())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent").filter(|ua| !ua.trim().is_empty())
    }

    pub fn is_mutating(&self) -> bool {
        matches!(self.method, Method::Post | Method::Put | Method::Patch | Method::Delete)
    }
}

/// Who the pipeline decided the caller is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// Not yet decided.
    Unknown,
    /// A public path; no authentication was attempted.
    Public,
    /// The shared-secret scheduled job.
    Scheduler,
    Authenticated,
}

impl Caller {
    pub fn is_bypass(self) -> bool {
        matches!(self, Caller::Public | Caller::Scheduler)
    }
}

/// An idempotency key reserved for this request; the response recorder completes or releases it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyClaim {
    pub tenant_id: Uuid,
    pub key: String,
}

/// State accumulated while a request moves through the stages.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Option<String>,
    pub parts: RequestParts,
    pub caller: Caller,
    pub credential: Option<VerifiedCredential>,
    pub activity: Option<SessionActivity>,
    pub tenant_id: Option<Uuid>,
    pub idempotency: Option<IdempotencyClaim>,
}

impl RequestContext {
    pub fn new(request_id: Option<String>, parts: RequestParts) -> Self {
        Self {
            request_id,
            parts,
            caller: Caller::Unknown,
            credential: None,
            activity: None,
            tenant_id: None,
            idempotency: None,
        }
    }

    pub fn request_id(&self) -> &str {
        self.request_id.as_deref().unwrap_or("unknown")
    }

    /// The fully admitted caller, if the authentication stages all ran.
    pub fn principal(&self) -> Option<Principal> {
        let credential = self.credential.as_ref()?;
        Some(Principal {
            user: credential.user.clone(),
            tenant_id: self.tenant_id?,
            flow: credential.flow,
            session_id: credential.session_id.clone(),
            activity: self.activity.clone()?,
        })
    }
}

pub enum StageOutcome {
    Continue,
    /// Answer with a previously recorded response and stop.
    Replay(StoredResponse),
}

/// Why the pipeline stopped early.
#[derive(Debug)]
pub enum Halt {
    Reject(AppError),
    Replay(StoredResponse),
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the stage still runs for public and scheduler callers.
    fn runs_on_bypass(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, AppError>;
}

pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, mut ctx: RequestContext) -> Result<RequestContext, Halt> {
        for stage in &self.stages {
            if ctx.caller.is_bypass() && !stage.runs_on_bypass() {
                continue;
            }

            match stage.run(&mut ctx).await {
                Ok(StageOutcome::Continue) => {}
                Ok(StageOutcome::Replay(stored)) => {
                    debug!(request_id = %ctx.request_id(), stage = stage.name(), status = stored.status_code, "replaying stored response");
                    return Err(Halt::Replay(stored));
                }
                Err(err) => {
                    debug!(request_id = %ctx.request_id(), stage = stage.name(), code = err.code(), "request halted");
                    return Err(Halt::Reject(err));
                }
            }
        }

        Ok(ctx)
    }
}
