use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::error::app_error::{AppError, HaltResponse};
use rocket::http::{Method, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::{RefOr, Response as OpenApiResponse, Responses};
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitBucket {
    Read,
    Mutation,
    /// Unauthenticated credential endpoints (login, password recovery).
    Auth,
}

impl RateLimitBucket {
    pub fn from_method(method: Method) -> Self {
        match method {
            Method::Post | Method::Put | Method::Patch | Method::Delete => RateLimitBucket::Mutation,
            _ => RateLimitBucket::Read,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RateLimitIdentity {
    Ip(String),
    User(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RateLimitKey {
    identity: RateLimitIdentity,
    bucket: RateLimitBucket,
}

#[derive(Debug, Clone)]
struct Counter {
    window_start: Instant,
    count: u32,
}

/// Fixed-window, in-process request counter keyed by client ip and user id.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Duration,
    cleanup_interval: Duration,
    counters: Mutex<HashMap<RateLimitKey, Counter>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let window = Duration::from_secs(config.window_seconds.max(1));
        let cleanup_interval = Duration::from_secs(config.cleanup_interval_seconds.max(1));

        Self {
            config,
            window,
            cleanup_interval,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn_cleanup_task(self: Arc<Self>) {
        let cleanup_interval = self.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let window = self.window;
                let mut counters = self.counters.lock().await;
                counters.retain(|_, counter| now.duration_since(counter.window_start) < window);
            }
        });
    }

    /// Counts one request against every identity it carries.
    ///
    /// Missing client ip is [`AppError::BadRequest`] when `require_client_ip`
    /// is set, otherwise the request shares a single anonymous counter.
    pub async fn check_request(&self, client_ip: Option<&str>, user_id: Option<&Uuid>, bucket: RateLimitBucket) -> Result<(), AppError> {
        let mut identities = Vec::with_capacity(2);
        if let Some(ip) = client_ip {
            identities.push(RateLimitIdentity::Ip(ip.to_string()));
        }
        if let Some(user_id) = user_id {
            identities.push(RateLimitIdentity::User(*user_id));
        }

        if client_ip.is_none() {
            if self.config.require_client_ip {
                return Err(AppError::BadRequest("Client address unavailable".to_string()));
            }
            if identities.is_empty() {
                identities.push(RateLimitIdentity::Ip("missing-ip".to_string()));
            }
        }

        match self.check(&identities, bucket).await {
            RateLimitDecision::Allow => Ok(()),
            RateLimitDecision::Limited { retry_after } => Err(AppError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            }),
        }
    }

    async fn check(&self, identities: &[RateLimitIdentity], bucket: RateLimitBucket) -> RateLimitDecision {
        if identities.is_empty() {
            return RateLimitDecision::Allow;
        }

        // NOTE: This is a fixed-window counter; bursts can exceed the limit near window boundaries.
        let limit = self.limit_for_bucket(bucket);
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        let mut retry_after: Option<Duration> = None;

        for identity in identities {
            let key = RateLimitKey {
                identity: identity.clone(),
                bucket,
            };
            let counter = counters.entry(key).or_insert_with(|| Counter { window_start: now, count: 0 });

            if now.duration_since(counter.window_start) >= self.window {
                counter.window_start = now;
                counter.count = 0;
            }

            if counter.count >= limit {
                let remaining = self.window.saturating_sub(now.duration_since(counter.window_start));
                retry_after = Some(retry_after.map_or(remaining, |current| current.max(remaining)));
            }
        }

        if let Some(retry_after) = retry_after {
            return RateLimitDecision::Limited { retry_after };
        }

        for identity in identities {
            let key = RateLimitKey {
                identity: identity.clone(),
                bucket,
            };
            if let Some(counter) = counters.get_mut(&key) {
                counter.count += 1;
            }
        }

        RateLimitDecision::Allow
    }

    fn limit_for_bucket(&self, bucket: RateLimitBucket) -> u32 {
        match bucket {
            RateLimitBucket::Read => self.config.read_limit,
            RateLimitBucket::Mutation => self.config.mutation_limit,
            RateLimitBucket::Auth => self.config.auth_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateLimitDecision {
    Allow,
    Limited { retry_after: Duration },
}

/// Ip-keyed limit for routes that sit outside the admission pipeline.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RateLimit {
    type Error = AppError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(limiter) = request.rocket().state::<Arc<RateLimiter>>() else {
            return Outcome::Success(RateLimit);
        };

        let ip = request.client_ip().map(|addr| addr.to_string());
        let bucket = RateLimitBucket::from_method(request.method());
        match limiter.check_request(ip.as_deref(), None, bucket).await {
            Ok(()) => Outcome::Success(RateLimit),
            Err(err) => {
                HaltResponse::cache_error(request, &err);
                Outcome::Error((Status::from(&err), err))
            }
        }
    }
}

impl<'a> OpenApiFromRequest<'a> for RateLimit {
    fn from_request_input(_gen: &mut OpenApiGenerator, _name: String, _required: bool) -> rocket_okapi::Result<RequestHeaderInput> {
        Ok(RequestHeaderInput::None)
    }

    fn get_responses(_gen: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        too_many_requests_response()
    }
}

pub(crate) fn too_many_requests_response() -> rocket_okapi::Result<Responses> {
    let mut responses = Responses::default();
    responses.responses.insert(
        "429".to_string(),
        RefOr::Object(OpenApiResponse {
            description: "Too Many Requests".to_string(),
            ..Default::default()
        }),
    );
    Ok(responses)
}
