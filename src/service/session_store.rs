//! Cookie-flow session store: one live credential pair per opaque session id.

use crate::database::auth_session::AuthSessionRepository;
use crate::error::app_error::AppError;
use crate::models::audit::audit_events;
use crate::models::auth_session::{AuthSession, CreatedSession, NewAuthSession, TokenRotation};
use crate::models::identity::{IdentitySession, TokenPair};
use crate::service::audit::record_security_event;
use crate::service::clock::Clock;
use crate::service::identity::IdentityProvider;
use crate::service::tenant::TenantResolver;
use chrono::{DateTime, Duration, Utc};
use rand::distr::{Alphanumeric, SampleString};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Access tokens expiring within this many seconds are refreshed before use.
pub const REFRESH_WINDOW_SECS: i64 = 60;

const SESSION_ID_LEN: usize = 48;

/// Salted fingerprints of the client that opened a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientFingerprint {
    pub ip_hash: Option<String>,
    pub ua_hash: Option<String>,
}

pub struct SessionStore {
    repo: Arc<dyn AuthSessionRepository>,
    identity: Arc<dyn IdentityProvider>,
    tenants: Arc<TenantResolver>,
    clock: Arc<dyn Clock>,
}

pub(crate) fn generate_session_id() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), SESSION_ID_LEN)
}

fn expiry_from(now: DateTime<Utc>, expires_in: i64) -> DateTime<Utc> {
    now + Duration::seconds(expires_in.max(0))
}

impl SessionStore {
    pub fn new(repo: Arc<dyn AuthSessionRepository>, identity: Arc<dyn IdentityProvider>, tenants: Arc<TenantResolver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            identity,
            tenants,
            clock,
        }
    }

    /// Persists a new session for a verified sign-in.
    ///
    /// Fails with [`AppError::SessionInvalid`] when either token is missing or
    /// no tenant can be resolved for the user.
    pub async fn create(&self, session: &IdentitySession, fingerprint: &ClientFingerprint) -> Result<CreatedSession, AppError> {
        let tokens = &session.tokens;
        if tokens.access_token.trim().is_empty() || tokens.refresh_token.trim().is_empty() {
            warn!(user_id = %session.user.id, "refusing to create session without a complete token pair");
            return Err(AppError::SessionInvalid);
        }

        let claims = crate::auth::credentials::decode_claims_hint(&tokens.access_token);
        let tenant_id = match self.tenants.resolve(&session.user, claims.as_ref()).await {
            Ok(tenant_id) => tenant_id,
            Err(AppError::OwnerNotFound) => {
                warn!(user_id = %session.user.id, "refusing to create session without a tenant");
                return Err(AppError::SessionInvalid);
            }
            Err(err) => return Err(err),
        };

        let now = self.clock.now();
        let record = self
            .repo
            .insert_auth_session(&NewAuthSession {
                session_id: generate_session_id(),
                user_id: session.user.id,
                tenant_id,
                access_token: tokens.access_token.clone(),
                refresh_token: tokens.refresh_token.clone(),
                access_expires_at: expiry_from(now, tokens.expires_in),
                created_at: now,
                ip_hash: fingerprint.ip_hash.clone(),
                ua_hash: fingerprint.ua_hash.clone(),
            })
            .await?;

        record_security_event(Some(&record.user_id), audit_events::SESSION_CREATED, true, Some(&record.session_id), None);

        Ok(CreatedSession {
            session_id: record.session_id.clone(),
            expires_at: record.access_expires_at,
            record,
        })
    }

    /// Newest non-revoked record for the id.
    pub async fn load(&self, session_id: &str) -> Result<Option<AuthSession>, AppError> {
        self.repo.find_current_auth_session(session_id).await
    }

    /// Refreshes the record when its access token is inside the refresh window,
    /// otherwise hands it back untouched.
    pub async fn ensure_fresh(&self, record: AuthSession) -> Result<AuthSession, AppError> {
        let now = self.clock.now();
        if !record.expires_within(now, Duration::seconds(REFRESH_WINDOW_SECS)) {
            return Ok(record);
        }

        debug!(
            session_id = %record.session_id,
            access_expires_at = %record.access_expires_at,
            "access token inside refresh window"
        );
        self.refresh(record).await
    }

    /// Exchanges the stored refresh token for a new pair and rewrites the row in place.
    ///
    /// A rejected refresh token surfaces as [`AppError::SessionExpired`]; the
    /// caller revokes the session.
    pub async fn refresh(&self, record: AuthSession) -> Result<AuthSession, AppError> {
        let tokens = match self.identity.refresh_session(&record.refresh_token).await {
            Ok(tokens) => tokens,
            Err(AppError::SessionExpired | AppError::AuthExpired) => {
                record_security_event(Some(&record.user_id), audit_events::SESSION_REFRESH_FAILED, false, Some(&record.session_id), None);
                return Err(AppError::SessionExpired);
            }
            Err(err) => return Err(err),
        };

        let refreshed = self.rotate(&record, &tokens).await?;
        info!(session_id = %refreshed.session_id, user_id = %refreshed.user_id, "session tokens refreshed");
        Ok(refreshed)
    }

    /// Writes a new token pair over the record, e.g. after a step-up sign-in.
    pub async fn rotate(&self, record: &AuthSession, tokens: &TokenPair) -> Result<AuthSession, AppError> {
        if tokens.access_token.trim().is_empty() || tokens.refresh_token.trim().is_empty() {
            return Err(AppError::SessionExpired);
        }

        let now = self.clock.now();
        let rotation = TokenRotation {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            access_expires_at: expiry_from(now, tokens.expires_in),
            refreshed_at: now,
        };

        // None means the row was revoked while the refresh was in flight.
        self.repo.rotate_auth_session_tokens(&record.id, &rotation).await?.ok_or(AppError::SessionExpired)
    }

    /// Stamps `revoked_at` on every live row for the id. Idempotent.
    pub async fn revoke(&self, session_id: &str) -> Result<(), AppError> {
        let revoked = self.repo.revoke_auth_session(session_id, self.clock.now()).await?;
        if revoked > 0 {
            info!(session_id = %session_id, rows = revoked, "auth session revoked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::identity::IdentityUser;
    use crate::test_utils::{FixedClock, InMemoryStore, ScriptedIdentity, identity_session, tenant_user};
    use uuid::Uuid;

    struct Fixture {
        store: SessionStore,
        repo: Arc<InMemoryStore>,
        identity: Arc<ScriptedIdentity>,
        clock: Arc<FixedClock>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryStore::default());
        let identity = Arc::new(ScriptedIdentity::default());
        let clock = Arc::new(FixedClock::at_epoch());
        let tenants = Arc::new(TenantResolver::new(repo.clone()));
        let store = SessionStore::new(repo.clone(), identity.clone(), tenants, clock.clone());
        Fixture { store, repo, identity, clock }
    }

    async fn created(fx: &Fixture, expires_in: i64) -> AuthSession {
        let tenant = Uuid::new_v4();
        let session = identity_session(tenant_user(tenant), expires_in);
        fx.store.create(&session, &ClientFingerprint::default()).await.expect("created").record
    }

    #[tokio::test]
    async fn create_persists_tokens_tenant_and_expiry() {
        let fx = fixture();
        let tenant = Uuid::new_v4();
        let session = identity_session(tenant_user(tenant), 3600);

        let created = fx.store.create(&session, &ClientFingerprint::default()).await.expect("created");

        assert_eq!(created.session_id.len(), SESSION_ID_LEN);
        assert_eq!(created.record.tenant_id, tenant);
        assert_eq!(created.expires_at, fx.clock.now() + Duration::seconds(3600));
        let loaded = fx.store.load(&created.session_id).await.expect("load");
        assert_eq!(loaded, Some(created.record));
    }

    #[tokio::test]
    async fn create_without_refresh_token_is_invalid() {
        let fx = fixture();
        let mut session = identity_session(tenant_user(Uuid::new_v4()), 3600);
        session.tokens.refresh_token = String::new();

        let result = fx.store.create(&session, &ClientFingerprint::default()).await;
        assert!(matches!(result, Err(AppError::SessionInvalid)));
        assert_eq!(fx.repo.auth_session_count(), 0);
    }

    #[tokio::test]
    async fn create_without_tenant_is_invalid() {
        let fx = fixture();
        let session = identity_session(IdentityUser::new(Uuid::new_v4()), 3600);

        let result = fx.store.create(&session, &ClientFingerprint::default()).await;
        assert!(matches!(result, Err(AppError::SessionInvalid)));
    }

    #[tokio::test]
    async fn ensure_fresh_outside_window_never_refreshes() {
        let fx = fixture();
        let record = created(&fx, 3600).await;

        let first = fx.store.ensure_fresh(record.clone()).await.expect("fresh");
        let second = fx.store.ensure_fresh(first.clone()).await.expect("fresh");

        assert_eq!(fx.identity.refresh_calls(), 0);
        assert_eq!(second, record);
    }

    #[tokio::test]
    async fn ensure_fresh_inside_window_rotates_tokens() {
        let fx = fixture();
        let record = created(&fx, 30).await;
        fx.clock.advance(Duration::seconds(5));

        let refreshed = fx.store.ensure_fresh(record.clone()).await.expect("refreshed");

        assert_eq!(fx.identity.refresh_calls(), 1);
        assert_ne!(refreshed.access_token, record.access_token);
        assert_ne!(refreshed.refresh_token, record.refresh_token);
        assert_eq!(refreshed.last_refresh_at, fx.clock.now());
        assert!(refreshed.access_expires_at > record.access_expires_at);
        assert_eq!(fx.store.load(&record.session_id).await.unwrap(), Some(refreshed));
    }

    #[tokio::test]
    async fn failed_refresh_signals_session_expired() {
        let fx = fixture();
        let record = created(&fx, 30).await;
        fx.identity.reject_refresh();

        let result = fx.store.ensure_fresh(record).await;
        assert!(matches!(result, Err(AppError::SessionExpired)));
    }

    #[tokio::test]
    async fn upstream_outage_during_refresh_is_not_expiry() {
        let fx = fixture();
        let record = created(&fx, 30).await;
        fx.identity.fail_refresh_upstream();

        let result = fx.store.ensure_fresh(record).await;
        assert!(matches!(result, Err(AppError::Upstream { .. })));
    }

    #[tokio::test]
    async fn revoke_is_idempotent_and_keeps_rows() {
        let fx = fixture();
        let record = created(&fx, 3600).await;

        fx.store.revoke(&record.session_id).await.expect("revoke");
        fx.store.revoke(&record.session_id).await.expect("revoke again");
        fx.store.revoke("unknown-session").await.expect("revoke unknown");

        assert_eq!(fx.store.load(&record.session_id).await.unwrap(), None);
        assert_eq!(fx.repo.auth_session_count(), 1);
    }

    #[tokio::test]
    async fn refresh_after_concurrent_revoke_is_expired() {
        let fx = fixture();
        let record = created(&fx, 30).await;
        fx.store.revoke(&record.session_id).await.unwrap();

        let result = fx.store.refresh(record).await;
        assert!(matches!(result, Err(AppError::SessionExpired)));
    }
}
