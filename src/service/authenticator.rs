//! The authentication facade the request pipeline and routes call into.
//!
//! Every store and provider call goes through [`bounded`] so a hung
//! dependency becomes an `UPSTREAM_TIMEOUT` instead of a stuck request.

use crate::auth::credentials::{ClaimsHint, Credential, INTERACTION_HEADER, decode_claims_hint, resolve_bearer_session_id, resolve_credential};
use crate::config::Config;
use crate::error::app_error::AppError;
use crate::models::audit::audit_events;
use crate::models::auth_session::{AuthSession, CreatedSession};
use crate::models::identity::IdentityUser;
use crate::models::session::AuthFlow;
use crate::models::session_activity::{ExpirySweep, SessionActivity};
use crate::pipeline::RequestParts;
use crate::service::audit::record_security_event;
use crate::service::identity::IdentityProvider;
use crate::service::session_activity::{ActivityKey, SessionActivityTracker};
use crate::service::session_store::{ClientFingerprint, SessionStore};
use crate::service::tenant::TenantResolver;
use crate::util::{is_truthy, salted_hash};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Runs one dependency call under the per-call deadline.
pub(crate) async fn bounded<T, F>(stage: &'static str, limit: Duration, call: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(stage, timeout_ms = limit.as_millis() as u64, "dependency call timed out");
            Err(AppError::UpstreamTimeout { stage })
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub anon_key: String,
    pub hash_salt: String,
    pub io_timeout: Duration,
    pub reauth_exempt_paths: Vec<String>,
}

impl AuthSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            anon_key: config.identity.anon_key.clone(),
            hash_salt: config.session.hash_salt.clone(),
            io_timeout: config.session.io_timeout(),
            reauth_exempt_paths: config.session.reauth_exempt_paths.clone(),
        }
    }
}

/// A caller the identity provider vouched for, before any policy checks.
#[derive(Debug, Clone)]
pub struct VerifiedCredential {
    pub user: IdentityUser,
    pub flow: AuthFlow,
    pub session_id: String,
    pub claims: Option<ClaimsHint>,
    /// Present on the cookie flow only.
    pub stored: Option<AuthSession>,
}

/// A caller that passed authentication, activity policy and tenant resolution.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user: IdentityUser,
    pub tenant_id: Uuid,
    pub flow: AuthFlow,
    pub session_id: String,
    pub activity: SessionActivity,
}

pub struct Authenticator {
    identity: Arc<dyn IdentityProvider>,
    sessions: SessionStore,
    activity: SessionActivityTracker,
    tenants: Arc<TenantResolver>,
    settings: AuthSettings,
}

impl Authenticator {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        sessions: SessionStore,
        activity: SessionActivityTracker,
        tenants: Arc<TenantResolver>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            identity,
            sessions,
            activity,
            tenants,
            settings,
        }
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    fn limit(&self) -> Duration {
        self.settings.io_timeout
    }

    /// True for mutating requests outside the step-up exemption list.
    pub fn requires_reauth(&self, parts: &RequestParts) -> bool {
        parts.is_mutating() && !self.settings.reauth_exempt_paths.iter().any(|p| p == &parts.path)
    }

    pub fn fingerprint(&self, parts: &RequestParts) -> ClientFingerprint {
        ClientFingerprint {
            ip_hash: parts.client_ip.as_deref().map(|ip| salted_hash(&self.settings.hash_salt, ip)),
            ua_hash: parts.user_agent().map(|ua| salted_hash(&self.settings.hash_salt, ua)),
        }
    }

    fn activity_key(&self, credential: &VerifiedCredential, parts: &RequestParts) -> ActivityKey {
        let fingerprint = self.fingerprint(parts);
        let tenant_id = credential.stored.as_ref().map(|s| s.tenant_id).or_else(|| {
            credential
                .claims
                .as_ref()
                .and_then(ClaimsHint::tenant_hint)
                .and_then(|raw| Uuid::parse_str(raw).ok())
        });

        ActivityKey {
            user_id: credential.user.id,
            session_id: credential.session_id.clone(),
            tenant_id,
            ip_hash: fingerprint.ip_hash,
            ua_hash: fingerprint.ua_hash,
        }
    }

    async fn drop_cookie_session(&self, record: &AuthSession, event: &str) -> Result<(), AppError> {
        record_security_event(Some(&record.user_id), event, false, Some(&record.session_id), None);
        bounded("session.revoke", self.limit(), self.sessions.revoke(&record.session_id)).await
    }

    /// Establishes who is calling. Performs no activity or tenant checks.
    pub async fn verify_credentials(&self, parts: &RequestParts) -> Result<VerifiedCredential, AppError> {
        match resolve_credential(parts, &self.settings.anon_key) {
            Credential::None => Err(AppError::AuthRequired),
            Credential::Bearer(token) => {
                let user = bounded("identity.verify", self.limit(), self.identity.verify_access_token(&token)).await?;
                let claims = decode_claims_hint(&token);
                let session_id = resolve_bearer_session_id(parts, claims.as_ref(), &token);

                Ok(VerifiedCredential {
                    user,
                    flow: AuthFlow::Bearer,
                    session_id,
                    claims,
                    stored: None,
                })
            }
            Credential::CookieSession(session_id) => {
                let record = bounded("session.load", self.limit(), self.sessions.load(&session_id))
                    .await?
                    .ok_or(AppError::AuthExpired)?;

                let record = match bounded("session.refresh", self.limit(), self.sessions.ensure_fresh(record.clone())).await {
                    Ok(fresh) => fresh,
                    Err(AppError::SessionExpired) => {
                        self.drop_cookie_session(&record, audit_events::SESSION_REFRESH_FAILED).await?;
                        return Err(AppError::AuthExpired);
                    }
                    Err(err) => return Err(err),
                };

                let user = match bounded("identity.verify", self.limit(), self.identity.verify_access_token(&record.access_token)).await {
                    Ok(user) if user.id == record.user_id => user,
                    Ok(user) => {
                        warn!(session_id = %record.session_id, stored_user = %record.user_id, token_user = %user.id, "session token belongs to another user");
                        self.drop_cookie_session(&record, audit_events::SESSION_TOKEN_REJECTED).await?;
                        return Err(AppError::AuthExpired);
                    }
                    Err(AppError::AuthExpired) => {
                        self.drop_cookie_session(&record, audit_events::SESSION_TOKEN_REJECTED).await?;
                        return Err(AppError::AuthExpired);
                    }
                    Err(err) => return Err(err),
                };

                Ok(VerifiedCredential {
                    user,
                    flow: AuthFlow::Cookie,
                    session_id: record.session_id.clone(),
                    claims: decode_claims_hint(&record.access_token),
                    stored: Some(record),
                })
            }
        }
    }

    pub async fn validate_activity(&self, credential: &VerifiedCredential, parts: &RequestParts, require_reauth: bool) -> Result<SessionActivity, AppError> {
        let key = self.activity_key(credential, parts);
        bounded("activity.validate", self.limit(), self.activity.validate(&key, require_reauth)).await
    }

    /// Cookie sessions carry the tenant fixed at login; bearer callers are resolved per request.
    pub async fn resolve_tenant(&self, credential: &VerifiedCredential) -> Result<Uuid, AppError> {
        if let Some(stored) = &credential.stored {
            return Ok(stored.tenant_id);
        }
        bounded("tenant.resolve", self.limit(), self.tenants.resolve(&credential.user, credential.claims.as_ref())).await
    }

    /// Backfills the tenant on activity rows created before it was resolved.
    pub async fn stamp_activity_tenant(&self, activity: &mut SessionActivity, tenant_id: Uuid) -> Result<(), AppError> {
        bounded("activity.tenant", self.limit(), self.activity.assign_tenant(activity, tenant_id)).await
    }

    /// Credential, activity policy and tenant in one call.
    pub async fn authenticate(&self, parts: &RequestParts) -> Result<Principal, AppError> {
        let credential = self.verify_credentials(parts).await?;
        let mut activity = self.validate_activity(&credential, parts, self.requires_reauth(parts)).await?;
        let tenant_id = self.resolve_tenant(&credential).await?;
        self.stamp_activity_tenant(&mut activity, tenant_id).await?;

        Ok(Principal {
            user: credential.user,
            tenant_id,
            flow: credential.flow,
            session_id: credential.session_id,
            activity,
        })
    }

    /// Resets the idle timer. Refused before any lookup unless the client
    /// flags the request as user-initiated.
    pub async fn touch(&self, parts: &RequestParts) -> Result<SessionActivity, AppError> {
        if !parts.header(INTERACTION_HEADER).is_some_and(is_truthy) {
            return Err(AppError::InteractionRequired);
        }

        let credential = self.verify_credentials(parts).await?;
        let key = self.activity_key(&credential, parts);
        bounded("activity.touch", self.limit(), self.activity.touch(&key)).await
    }

    /// Confirms the caller's password with the provider and stamps the step-up.
    pub async fn mark_reauth(&self, parts: &RequestParts, password: &str) -> Result<SessionActivity, AppError> {
        let credential = self.verify_credentials(parts).await?;
        let key = self.activity_key(&credential, parts);
        bounded("activity.validate", self.limit(), self.activity.validate(&key, false)).await?;

        let Some(email) = credential.user.email.as_deref() else {
            return Err(AppError::BadRequest("Account has no password sign-in".to_string()));
        };

        let confirmed = match bounded("identity.sign_in", self.limit(), self.identity.sign_in(email, password)).await {
            Ok(session) if session.user.id == credential.user.id => session,
            Ok(_) | Err(AppError::InvalidCredentials) => {
                record_security_event(Some(&credential.user.id), audit_events::REAUTH_FAILED, false, Some(&credential.session_id), None);
                return Err(AppError::InvalidCredentials);
            }
            Err(err) => return Err(err),
        };

        if let Some(stored) = &credential.stored {
            bounded("session.rotate", self.limit(), self.sessions.rotate(stored, &confirmed.tokens)).await?;
        }

        bounded("activity.reauth", self.limit(), self.activity.mark_reauth(&key)).await
    }

    /// Password grant followed by cookie-session creation.
    pub async fn login(&self, email: &str, password: &str, parts: &RequestParts) -> Result<(CreatedSession, IdentityUser), AppError> {
        let session = match bounded("identity.sign_in", self.limit(), self.identity.sign_in(email, password)).await {
            Ok(session) => session,
            Err(err) => {
                record_security_event(None, audit_events::LOGIN_FAILED, false, None, Some(err.code()));
                return Err(err);
            }
        };

        let created = bounded("session.create", self.limit(), self.sessions.create(&session, &self.fingerprint(parts))).await?;
        record_security_event(Some(&session.user.id), audit_events::LOGIN_SUCCESS, true, Some(&created.session_id), None);
        Ok((created, session.user))
    }

    /// Ends whatever session the request carries. Idempotent; a request with
    /// no usable credential is a no-op.
    pub async fn logout(&self, parts: &RequestParts) -> Result<(), AppError> {
        match resolve_credential(parts, &self.settings.anon_key) {
            Credential::None => Ok(()),
            Credential::CookieSession(session_id) => {
                let stored = bounded("session.load", self.limit(), self.sessions.load(&session_id)).await?;
                self.revoke(&session_id).await?;
                if let Some(stored) = stored {
                    bounded("activity.revoke", self.limit(), self.activity.revoke(&stored.user_id, &session_id)).await?;
                    record_security_event(Some(&stored.user_id), audit_events::LOGOUT, true, Some(&session_id), None);
                }
                Ok(())
            }
            Credential::Bearer(_) => match self.verify_credentials(parts).await {
                Ok(credential) => {
                    bounded("activity.revoke", self.limit(), self.activity.revoke(&credential.user.id, &credential.session_id)).await?;
                    record_security_event(Some(&credential.user.id), audit_events::LOGOUT, true, Some(&credential.session_id), None);
                    Ok(())
                }
                Err(AppError::AuthExpired) => Ok(()),
                Err(err) => Err(err),
            },
        }
    }

    /// Revokes a cookie session by id.
    pub async fn revoke(&self, session_id: &str) -> Result<(), AppError> {
        bounded("session.revoke", self.limit(), self.sessions.revoke(session_id)).await
    }

    /// Asks the provider to send recovery instructions. Provider failures are
    /// logged and swallowed so the response never reveals whether the account exists.
    pub async fn request_password_recovery(&self, email: &str) {
        match bounded("identity.recover", self.limit(), self.identity.reset_password(email)).await {
            Ok(()) => record_security_event(None, audit_events::PASSWORD_RECOVERY_REQUESTED, true, None, None),
            Err(err) => warn!(code = err.code(), error = %err, "password recovery request failed"),
        }
    }

    /// Revokes every idle or timeboxed activity record.
    pub async fn sweep_expired(&self) -> Result<ExpirySweep, AppError> {
        let sweep = self.activity.sweep_expired().await?;
        info!(timebox_revoked = sweep.timebox_revoked, idle_revoked = sweep.idle_revoked, "session expiry sweep finished");
        Ok(sweep)
    }
}
