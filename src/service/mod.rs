pub mod audit;
pub mod authenticator;
pub mod clock;
pub mod identity;
pub mod session_activity;
pub mod session_store;
pub mod tenant;

use crate::config::Config;
use crate::database::auth_session::AuthSessionRepository;
use crate::database::idempotency::IdempotencyRepository;
use crate::database::postgres_repository::PostgresRepository;
use crate::database::session_activity::SessionActivityRepository;
use crate::database::tenant::TenantDirectory;
use crate::middleware::rate_limit::RateLimiter;
use crate::pipeline::Pipeline;
use crate::pipeline::stages::{self, PipelineSettings};
use authenticator::{AuthSettings, Authenticator};
use clock::{Clock, SystemClock};
use identity::IdentityProvider;
use session_activity::SessionActivityTracker;
use session_store::SessionStore;
use std::sync::Arc;
use tenant::TenantResolver;

/// The storage and provider seams the services are built on.
pub struct Backends {
    pub identity: Arc<dyn IdentityProvider>,
    pub auth_sessions: Arc<dyn AuthSessionRepository>,
    pub activity: Arc<dyn SessionActivityRepository>,
    pub tenants: Arc<dyn TenantDirectory>,
    pub idempotency: Arc<dyn IdempotencyRepository>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    pub fn postgres(repo: PostgresRepository, identity: Arc<dyn IdentityProvider>) -> Self {
        let repo = Arc::new(repo);
        Self {
            identity,
            auth_sessions: repo.clone(),
            activity: repo.clone(),
            tenants: repo.clone(),
            idempotency: repo,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Managed Rocket state shared by guards, fairings and routes.
pub struct AppServices {
    pub authenticator: Arc<Authenticator>,
    pub pipeline: Arc<Pipeline>,
    pub idempotency: Arc<dyn IdempotencyRepository>,
    pub clock: Arc<dyn Clock>,
}

impl AppServices {
    pub fn assemble(config: &Config, backends: Backends, limiter: Option<Arc<RateLimiter>>) -> Self {
        let tenants = Arc::new(TenantResolver::new(backends.tenants));
        let sessions = SessionStore::new(backends.auth_sessions, backends.identity.clone(), tenants.clone(), backends.clock.clone());
        let activity = SessionActivityTracker::new(backends.activity, backends.clock.clone());
        let authenticator = Arc::new(Authenticator::new(
            backends.identity,
            sessions,
            activity,
            tenants,
            AuthSettings::from_config(config),
        ));

        let pipeline = stages::standard(
            authenticator.clone(),
            limiter,
            backends.idempotency.clone(),
            backends.clock.clone(),
            PipelineSettings {
                public_paths: config.session.public_paths.clone(),
                cron_token: config.cron.auth_token.clone(),
                io_timeout: config.session.io_timeout(),
            },
        );

        Self {
            authenticator,
            pipeline: Arc::new(pipeline),
            idempotency: backends.idempotency,
            clock: backends.clock,
        }
    }
}
