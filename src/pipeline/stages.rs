//! The standard admission stages, in the order [`standard`] runs them.

use crate::database::idempotency::IdempotencyRepository;
use crate::error::app_error::AppError;
use crate::middleware::rate_limit::{RateLimitBucket, RateLimiter};
use crate::models::idempotency::IdempotencyDecision;
use crate::pipeline::{Caller, IdempotencyClaim, Pipeline, RequestContext, Stage, StageOutcome};
use crate::service::authenticator::{Authenticator, bounded};
use crate::service::clock::Clock;
use crate::service::tenant::ensure_body_tenant;
use crate::util::sha256_hex;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CRON_TOKEN_HEADER: &str = "x-cron-token";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

const MAX_REQUEST_ID_LEN: usize = 128;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
const CRON_PATH_PREFIX: &str = "/cron/";

/// Reuses a well-formed inbound request id, otherwise mints a UUIDv4.
pub fn propagate_request_id(inbound: Option<&str>) -> String {
    match inbound.map(str::trim) {
        Some(id) if !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN && id.bytes().all(|b| b.is_ascii_graphic()) => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}

/// Hash of everything that makes two mutations "the same request".
pub fn request_fingerprint(ctx: &RequestContext) -> String {
    let body = ctx.parts.body.as_ref().map(|b| b.to_string()).unwrap_or_default();
    sha256_hex(&format!("{}\n{}\n{}", ctx.parts.method, ctx.parts.path, body))
}

fn tokens_match(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && sha256_hex(presented) == sha256_hex(expected)
}

fn missing(stage: &'static str) -> AppError {
    AppError::upstream(stage, None, None, "pipeline stage ran out of order")
}

pub struct RequestIdStage;

#[async_trait]
impl Stage for RequestIdStage {
    fn name(&self) -> &'static str {
        "request_id"
    }

    fn runs_on_bypass(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, AppError> {
        if ctx.request_id.is_none() {
            ctx.request_id = Some(propagate_request_id(ctx.parts.header(REQUEST_ID_HEADER)));
        }
        Ok(StageOutcome::Continue)
    }
}

/// Admits public paths and the scheduled job without authentication.
pub struct BypassStage {
    pub public_paths: Vec<String>,
    pub cron_token: String,
}

#[async_trait]
impl Stage for BypassStage {
    fn name(&self) -> &'static str {
        "bypass"
    }

    fn runs_on_bypass(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, AppError> {
        if ctx.parts.path.starts_with(CRON_PATH_PREFIX) {
            return match ctx.parts.header(CRON_TOKEN_HEADER) {
                Some(token) if tokens_match(token.trim(), &self.cron_token) => {
                    ctx.caller = Caller::Scheduler;
                    Ok(StageOutcome::Continue)
                }
                _ => {
                    warn!(request_id = %ctx.request_id(), path = %ctx.parts.path, "scheduled job token missing or wrong");
                    Err(AppError::Forbidden)
                }
            };
        }

        if self.public_paths.iter().any(|p| p == &ctx.parts.path) {
            ctx.caller = Caller::Public;
        }
        Ok(StageOutcome::Continue)
    }
}

pub struct AuthenticateStage {
    pub authenticator: Arc<Authenticator>,
}

#[async_trait]
impl Stage for AuthenticateStage {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, AppError> {
        let credential = self.authenticator.verify_credentials(&ctx.parts).await?;
        debug!(request_id = %ctx.request_id(), user_id = %credential.user.id, flow = ?credential.flow, "caller authenticated");
        ctx.credential = Some(credential);
        ctx.caller = Caller::Authenticated;
        Ok(StageOutcome::Continue)
    }
}

pub struct ActivityStage {
    pub authenticator: Arc<Authenticator>,
}

#[async_trait]
impl Stage for ActivityStage {
    fn name(&self) -> &'static str {
        "activity"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, AppError> {
        let credential = ctx.credential.as_ref().ok_or_else(|| missing("activity"))?;
        let require_reauth = self.authenticator.requires_reauth(&ctx.parts);
        let activity = self.authenticator.validate_activity(credential, &ctx.parts, require_reauth).await?;
        ctx.activity = Some(activity);
        Ok(StageOutcome::Continue)
    }
}

pub struct TenantStage {
    pub authenticator: Arc<Authenticator>,
}

#[async_trait]
impl Stage for TenantStage {
    fn name(&self) -> &'static str {
        "tenant"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, AppError> {
        let credential = ctx.credential.as_ref().ok_or_else(|| missing("tenant"))?;
        let tenant_id = self.authenticator.resolve_tenant(credential).await?;
        if let Some(activity) = ctx.activity.as_mut() {
            self.authenticator.stamp_activity_tenant(activity, tenant_id).await?;
        }
        ctx.tenant_id = Some(tenant_id);
        Ok(StageOutcome::Continue)
    }
}

/// Refuses bodies that name a tenant other than the resolved one.
pub struct TenantGuardStage;

#[async_trait]
impl Stage for TenantGuardStage {
    fn name(&self) -> &'static str {
        "tenant_guard"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, AppError> {
        let tenant_id = ctx.tenant_id.ok_or_else(|| missing("tenant_guard"))?;
        if let Err(err) = ensure_body_tenant(ctx.parts.body.as_ref(), &tenant_id) {
            warn!(request_id = %ctx.request_id(), tenant_id = %tenant_id, "request body names a foreign tenant");
            return Err(err);
        }
        Ok(StageOutcome::Continue)
    }
}

pub struct RateLimitStage {
    pub limiter: Option<Arc<RateLimiter>>,
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn runs_on_bypass(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, AppError> {
        let Some(limiter) = &self.limiter else {
            return Ok(StageOutcome::Continue);
        };

        let (bucket, user_id) = match ctx.caller {
            Caller::Scheduler => return Ok(StageOutcome::Continue),
            Caller::Public => (RateLimitBucket::Auth, None),
            _ => (RateLimitBucket::from_method(ctx.parts.method), ctx.credential.as_ref().map(|c| c.user.id)),
        };

        limiter.check_request(ctx.parts.client_ip.as_deref(), user_id.as_ref(), bucket).await?;
        Ok(StageOutcome::Continue)
    }
}

/// Reserves, replays or rejects mutations that carry an `Idempotency-Key`.
pub struct IdempotencyStage {
    pub repo: Arc<dyn IdempotencyRepository>,
    pub clock: Arc<dyn Clock>,
    pub io_timeout: std::time::Duration,
}

#[async_trait]
impl Stage for IdempotencyStage {
    fn name(&self) -> &'static str {
        "idempotency"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<StageOutcome, AppError> {
        if !ctx.parts.is_mutating() {
            return Ok(StageOutcome::Continue);
        }
        let Some(key) = ctx.parts.header(IDEMPOTENCY_KEY_HEADER).map(str::trim).filter(|k| !k.is_empty()) else {
            return Ok(StageOutcome::Continue);
        };
        if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(AppError::BadRequest("Idempotency-Key is too long".to_string()));
        }
        let key = key.to_string();
        let tenant_id = ctx.tenant_id.ok_or_else(|| missing("idempotency"))?;

        let fingerprint = request_fingerprint(ctx);
        let decision = bounded(
            "idempotency.begin",
            self.io_timeout,
            self.repo.begin_idempotent(&tenant_id, &key, &fingerprint, self.clock.now()),
        )
        .await?;

        match decision {
            IdempotencyDecision::Fresh => {
                ctx.idempotency = Some(IdempotencyClaim { tenant_id, key });
                Ok(StageOutcome::Continue)
            }
            IdempotencyDecision::Replay(stored) => Ok(StageOutcome::Replay(stored)),
            IdempotencyDecision::Conflict => {
                warn!(request_id = %ctx.request_id(), tenant_id = %tenant_id, "idempotency key reused for a different request");
                Err(AppError::IdempotencyConflict)
            }
            IdempotencyDecision::InFlight => {
                debug!(request_id = %ctx.request_id(), tenant_id = %tenant_id, "idempotent request still in flight");
                Err(AppError::IdempotencyConflict)
            }
        }
    }
}

/// Everything the standard pipeline needs besides the authenticator.
pub struct PipelineSettings {
    pub public_paths: Vec<String>,
    pub cron_token: String,
    pub io_timeout: std::time::Duration,
}

/// Request id, bypass, authenticate, activity, tenant, tenant guard, rate limit, idempotency.
pub fn standard(
    authenticator: Arc<Authenticator>,
    limiter: Option<Arc<RateLimiter>>,
    idempotency: Arc<dyn IdempotencyRepository>,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
) -> Pipeline {
    Pipeline::new(vec![
        Box::new(RequestIdStage),
        Box::new(BypassStage {
            public_paths: settings.public_paths,
            cron_token: settings.cron_token,
        }),
        Box::new(AuthenticateStage {
            authenticator: authenticator.clone(),
        }),
        Box::new(ActivityStage {
            authenticator: authenticator.clone(),
        }),
        Box::new(TenantStage { authenticator }),
        Box::new(TenantGuardStage),
        Box::new(RateLimitStage { limiter }),
        Box::new(IdempotencyStage {
            repo: idempotency,
            clock,
            io_timeout: settings.io_timeout,
        }),
    ])
}
