//! In-memory backends, a scripted identity provider and a controllable clock.

use crate::auth::credentials::encode_test_token;
use crate::config::Config;
use crate::database::auth_session::AuthSessionRepository;
use crate::database::idempotency::{IdempotencyRepository, decide_existing};
use crate::database::session_activity::SessionActivityRepository;
use crate::database::tenant::TenantDirectory;
use crate::error::app_error::AppError;
use crate::models::auth_session::{AuthSession, NewAuthSession, TokenRotation};
use crate::models::idempotency::{IdempotencyDecision, IdempotencyRecord};
use crate::models::identity::{IdentitySession, IdentityUser, TokenPair};
use crate::models::session_activity::{ActivityInsert, ExpirySweep, NewSessionActivity, SessionActivity};
use crate::pipeline::RequestParts;
use crate::service::authenticator::{AuthSettings, Authenticator};
use crate::service::clock::Clock;
use crate::service::identity::IdentityProvider;
use crate::service::{AppServices, Backends};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rocket::http::Method;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const TEST_PASSWORD: &str = "correct horse";
pub const TEST_ANON_KEY: &str = "anon-public-key";
pub const TEST_CRON_TOKEN: &str = "cron-secret";

// ── Clock ─────────────────────────────────────────────────────────────────────

pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn at_epoch() -> Self {
        let start = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().expect("valid start time");
        Self(Mutex::new(start))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.0.lock().unwrap() = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct StoreState {
    auth_sessions: Vec<AuthSession>,
    activity: HashMap<(Uuid, String), SessionActivity>,
    tenant_members: HashMap<Uuid, Uuid>,
    idempotency: HashMap<(Uuid, String), IdempotencyRecord>,
}

/// Every repository trait over one mutex-guarded map set, with read/write counters.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    reads: AtomicUsize,
    activity_writes: AtomicUsize,
    lose_next_activity_insert: AtomicBool,
}

impl InMemoryStore {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn activity_writes(&self) -> usize {
        self.activity_writes.load(Ordering::SeqCst)
    }

    pub fn auth_session_count(&self) -> usize {
        self.state.lock().unwrap().auth_sessions.len()
    }

    pub fn activity_count(&self) -> usize {
        self.state.lock().unwrap().activity.len()
    }

    pub fn current_auth_session(&self, session_id: &str) -> Option<AuthSession> {
        let state = self.state.lock().unwrap();
        current(&state.auth_sessions, session_id).cloned()
    }

    pub fn activity(&self, user_id: &Uuid, session_id: &str) -> Option<SessionActivity> {
        self.state.lock().unwrap().activity.get(&(*user_id, session_id.to_string())).cloned()
    }

    pub fn idempotency_record(&self, tenant_id: &Uuid, key: &str) -> Option<IdempotencyRecord> {
        self.state.lock().unwrap().idempotency.get(&(*tenant_id, key.to_string())).cloned()
    }

    pub fn add_tenant_member(&self, user_id: Uuid, owner_id: Uuid) {
        self.state.lock().unwrap().tenant_members.insert(user_id, owner_id);
    }

    /// Makes the next activity insert behave as if a concurrent request won the race.
    pub fn lose_next_activity_insert(&self) {
        self.lose_next_activity_insert.store(true, Ordering::SeqCst);
    }

    fn read(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn write_activity(&self) {
        self.activity_writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn current<'a>(sessions: &'a [AuthSession], session_id: &str) -> Option<&'a AuthSession> {
    sessions
        .iter()
        .filter(|s| s.session_id == session_id && s.revoked_at.is_none())
        .max_by_key(|s| s.created_at)
}

#[async_trait::async_trait]
impl AuthSessionRepository for InMemoryStore {
    async fn insert_auth_session(&self, session: &NewAuthSession) -> Result<AuthSession, AppError> {
        let record = AuthSession {
            id: Uuid::new_v4(),
            session_id: session.session_id.clone(),
            user_id: session.user_id,
            tenant_id: session.tenant_id,
            access_token: session.access_token.clone(),
            refresh_token: session.refresh_token.clone(),
            access_expires_at: session.access_expires_at,
            last_refresh_at: session.created_at,
            created_at: session.created_at,
            updated_at: session.created_at,
            revoked_at: None,
            ip_hash: session.ip_hash.clone(),
            ua_hash: session.ua_hash.clone(),
        };
        self.state.lock().unwrap().auth_sessions.push(record.clone());
        Ok(record)
    }

    async fn find_current_auth_session(&self, session_id: &str) -> Result<Option<AuthSession>, AppError> {
        self.read();
        Ok(self.current_auth_session(session_id))
    }

    async fn rotate_auth_session_tokens(&self, id: &Uuid, rotation: &TokenRotation) -> Result<Option<AuthSession>, AppError> {
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.auth_sessions.iter_mut().find(|s| s.id == *id && s.revoked_at.is_none()) else {
            return Ok(None);
        };
        record.access_token = rotation.access_token.clone();
        record.refresh_token = rotation.refresh_token.clone();
        record.access_expires_at = rotation.access_expires_at;
        record.last_refresh_at = rotation.refreshed_at;
        record.updated_at = rotation.refreshed_at;
        Ok(Some(record.clone()))
    }

    async fn revoke_auth_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        let mut revoked = 0;
        for record in state.auth_sessions.iter_mut().filter(|s| s.session_id == session_id && s.revoked_at.is_none()) {
            record.revoked_at = Some(at);
            record.updated_at = at;
            revoked += 1;
        }
        Ok(revoked)
    }
}

#[async_trait::async_trait]
impl SessionActivityRepository for InMemoryStore {
    async fn find_session_activity(&self, user_id: &Uuid, session_id: &str) -> Result<Option<SessionActivity>, AppError> {
        self.read();
        Ok(self.activity(user_id, session_id))
    }

    async fn insert_session_activity(&self, activity: &NewSessionActivity) -> Result<ActivityInsert, AppError> {
        self.write_activity();
        let key = (activity.user_id, activity.session_id.clone());
        let mut state = self.state.lock().unwrap();

        if self.lose_next_activity_insert.swap(false, Ordering::SeqCst) {
            state.activity.entry(key).or_insert_with(|| activity.clone().into_record());
            return Ok(ActivityInsert::AlreadyExists);
        }
        if state.activity.contains_key(&key) {
            return Ok(ActivityInsert::AlreadyExists);
        }

        let record = activity.clone().into_record();
        state.activity.insert(key, record.clone());
        Ok(ActivityInsert::Created(record))
    }

    async fn touch_session_activity(
        &self,
        user_id: &Uuid,
        session_id: &str,
        at: DateTime<Utc>,
        ip_hash: Option<&str>,
        ua_hash: Option<&str>,
    ) -> Result<Option<SessionActivity>, AppError> {
        self.write_activity();
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.activity.get_mut(&(*user_id, session_id.to_string())).filter(|r| r.revoked_at.is_none()) else {
            return Ok(None);
        };
        record.last_seen_at = record.last_seen_at.max(at);
        if let Some(ip_hash) = ip_hash {
            record.ip_hash = Some(ip_hash.to_string());
        }
        if let Some(ua_hash) = ua_hash {
            record.ua_hash = Some(ua_hash.to_string());
        }
        Ok(Some(record.clone()))
    }

    async fn mark_session_reauth(&self, user_id: &Uuid, session_id: &str, at: DateTime<Utc>) -> Result<Option<SessionActivity>, AppError> {
        self.write_activity();
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.activity.get_mut(&(*user_id, session_id.to_string())).filter(|r| r.revoked_at.is_none()) else {
            return Ok(None);
        };
        record.last_reauth_at = at;
        record.last_seen_at = at;
        Ok(Some(record.clone()))
    }

    async fn revoke_session_activity(&self, user_id: &Uuid, session_id: &str, at: DateTime<Utc>) -> Result<u64, AppError> {
        self.write_activity();
        let mut state = self.state.lock().unwrap();
        match state.activity.get_mut(&(*user_id, session_id.to_string())).filter(|r| r.revoked_at.is_none()) {
            Some(record) => {
                record.revoked_at = Some(at);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn assign_activity_tenant(&self, user_id: &Uuid, session_id: &str, tenant_id: &Uuid) -> Result<u64, AppError> {
        self.write_activity();
        let mut state = self.state.lock().unwrap();
        match state.activity.get_mut(&(*user_id, session_id.to_string())).filter(|r| r.tenant_id.is_none()) {
            Some(record) => {
                record.tenant_id = Some(*tenant_id);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn revoke_expired_activity(&self, now: DateTime<Utc>, idle_cutoff: DateTime<Utc>) -> Result<ExpirySweep, AppError> {
        let mut state = self.state.lock().unwrap();
        let mut sweep = ExpirySweep::default();
        for record in state.activity.values_mut().filter(|r| r.revoked_at.is_none()) {
            if record.expires_at < now {
                record.revoked_at = Some(now);
                sweep.timebox_revoked += 1;
            } else if record.last_seen_at.max(record.created_at) < idle_cutoff {
                record.revoked_at = Some(now);
                sweep.idle_revoked += 1;
            }
        }
        Ok(sweep)
    }
}

#[async_trait::async_trait]
impl TenantDirectory for InMemoryStore {
    async fn owner_for_user(&self, user_id: &Uuid) -> Result<Option<Uuid>, AppError> {
        self.read();
        Ok(self.state.lock().unwrap().tenant_members.get(user_id).copied())
    }
}

#[async_trait::async_trait]
impl IdempotencyRepository for InMemoryStore {
    async fn begin_idempotent(&self, tenant_id: &Uuid, key: &str, fingerprint: &str, now: DateTime<Utc>) -> Result<IdempotencyDecision, AppError> {
        let mut state = self.state.lock().unwrap();
        let map_key = (*tenant_id, key.to_string());
        if let Some(existing) = state.idempotency.get(&map_key) {
            return Ok(decide_existing(existing, fingerprint));
        }
        state.idempotency.insert(
            map_key,
            IdempotencyRecord {
                tenant_id: *tenant_id,
                key: key.to_string(),
                fingerprint: fingerprint.to_string(),
                status_code: None,
                response_body: None,
                created_at: now,
                completed_at: None,
            },
        );
        Ok(IdempotencyDecision::Fresh)
    }

    async fn complete_idempotent(&self, tenant_id: &Uuid, key: &str, status_code: u16, body: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.idempotency.get_mut(&(*tenant_id, key.to_string())).filter(|r| r.completed_at.is_none()) {
            record.status_code = Some(i32::from(status_code));
            record.response_body = Some(body.to_string());
            record.completed_at = Some(now);
        }
        Ok(())
    }

    async fn release_idempotent(&self, tenant_id: &Uuid, key: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let map_key = (*tenant_id, key.to_string());
        if state.idempotency.get(&map_key).is_some_and(|r| r.completed_at.is_none()) {
            state.idempotency.remove(&map_key);
        }
        Ok(())
    }

    async fn purge_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        let before = state.idempotency.len();
        state.idempotency.retain(|_, r| r.created_at >= cutoff);
        Ok((before - state.idempotency.len()) as u64)
    }
}

// ── Identity provider ─────────────────────────────────────────────────────────

#[derive(Default)]
struct IdentityState {
    users: HashMap<Uuid, IdentityUser>,
    access_tokens: HashMap<String, Uuid>,
    refresh_tokens: HashMap<String, Uuid>,
    spent_refresh_tokens: HashSet<String>,
    issued: u64,
    sign_in_expires_in: Option<i64>,
}

/// Identity provider double: issues opaque-but-decodable tokens and rotates
/// refresh tokens the way the real provider does.
#[derive(Default)]
pub struct ScriptedIdentity {
    state: Mutex<IdentityState>,
    verify_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    reject_refresh: AtomicBool,
    refresh_upstream_failure: AtomicBool,
    hang_verify: AtomicBool,
}

impl ScriptedIdentity {
    pub fn register_user(&self, user: IdentityUser) {
        self.state.lock().unwrap().users.insert(user.id, user);
    }

    pub fn issue_tokens(&self, user_id: Uuid, expires_in: i64) -> TokenPair {
        let mut state = self.state.lock().unwrap();
        state.issued += 1;
        let access_token = encode_test_token(&json!({
            "sub": user_id.to_string(),
            "role": "authenticated",
            "jti": state.issued,
        }));
        let refresh_token = format!("refresh-{}-{}", state.issued, user_id.simple());
        state.access_tokens.insert(access_token.clone(), user_id);
        state.refresh_tokens.insert(refresh_token.clone(), user_id);
        TokenPair {
            access_token,
            refresh_token,
            expires_in,
        }
    }

    pub fn set_sign_in_expiry(&self, expires_in: i64) {
        self.state.lock().unwrap().sign_in_expires_in = Some(expires_in);
    }

    pub fn reject_refresh(&self) {
        self.reject_refresh.store(true, Ordering::SeqCst);
    }

    pub fn fail_refresh_upstream(&self) {
        self.refresh_upstream_failure.store(true, Ordering::SeqCst);
    }

    pub fn revoke_all_access_tokens(&self) {
        self.state.lock().unwrap().access_tokens.clear();
    }

    pub fn hang_verify(&self) {
        self.hang_verify.store(true, Ordering::SeqCst);
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl IdentityProvider for ScriptedIdentity {
    async fn verify_access_token(&self, access_token: &str) -> Result<IdentityUser, AppError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_verify.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }

        let state = self.state.lock().unwrap();
        state
            .access_tokens
            .get(access_token)
            .and_then(|id| state.users.get(id))
            .cloned()
            .ok_or(AppError::AuthExpired)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<TokenPair, AppError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.refresh_upstream_failure.load(Ordering::SeqCst) {
            return Err(AppError::upstream("identity.refresh", Some(503), None, "provider unavailable"));
        }
        if self.reject_refresh.load(Ordering::SeqCst) {
            return Err(AppError::SessionExpired);
        }

        let user_id = {
            let mut state = self.state.lock().unwrap();
            if !state.spent_refresh_tokens.insert(refresh_token.to_string()) {
                return Err(AppError::SessionExpired);
            }
            state.refresh_tokens.get(refresh_token).copied().unwrap_or_else(Uuid::nil)
        };
        Ok(self.issue_tokens(user_id, 3600))
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<IdentitySession, AppError> {
        let (user, expires_in) = {
            let state = self.state.lock().unwrap();
            let user = state.users.values().find(|u| u.email.as_deref() == Some(email)).cloned();
            (user, state.sign_in_expires_in.unwrap_or(3600))
        };
        let Some(user) = user.filter(|_| password == TEST_PASSWORD) else {
            return Err(AppError::InvalidCredentials);
        };

        let tokens = self.issue_tokens(user.id, expires_in);
        Ok(IdentitySession { tokens, user })
    }

    async fn reset_password(&self, _email: &str) -> Result<(), AppError> {
        Ok(())
    }
}

// ── Fixtures ──────────────────────────────────────────────────────────────────

/// A user whose profile metadata names `tenant_id`.
pub fn tenant_user(tenant_id: Uuid) -> IdentityUser {
    let mut user = IdentityUser::new(Uuid::new_v4());
    user.email = Some(format!("{}@example.test", user.id.simple()));
    user.user_metadata = json!({ "owner_id": tenant_id.to_string() });
    user
}

pub fn identity_session(user: IdentityUser, expires_in: i64) -> IdentitySession {
    IdentitySession {
        tokens: TokenPair {
            access_token: encode_test_token(&json!({ "sub": user.id.to_string() })),
            refresh_token: format!("refresh-{}", Uuid::new_v4().simple()),
            expires_in,
        },
        user,
    }
}

pub fn bearer_parts(method: Method, path: &str, token: &str) -> RequestParts {
    RequestParts::new(method, path).with_header("Authorization", format!("Bearer {token}"))
}

pub fn cookie_parts(method: Method, path: &str, session_id: &str) -> RequestParts {
    RequestParts::new(method, path).with_session_cookie(session_id)
}

pub fn test_config() -> Config {
    let mut config = Config {
        environment: "test".to_string(),
        ..Config::default()
    };
    config.api.enable_swagger = false;
    config.identity.anon_key = TEST_ANON_KEY.to_string();
    config.cron.auth_token = TEST_CRON_TOKEN.to_string();
    config.session.hash_salt = "test-salt".to_string();
    config.session.io_timeout_ms = 200;
    config.cors.allowed_origins = vec!["http://localhost:5173".to_string()];
    config
}

/// Authenticator wired to in-memory backends, with handles on every double.
pub struct TestHarness {
    pub config: Config,
    pub authenticator: Arc<Authenticator>,
    pub store: Arc<InMemoryStore>,
    pub identity: Arc<ScriptedIdentity>,
    pub clock: Arc<FixedClock>,
    pub settings: AuthSettings,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(InMemoryStore::default());
        let identity = Arc::new(ScriptedIdentity::default());
        let clock = Arc::new(FixedClock::at_epoch());
        let services = AppServices::assemble(&config, Self::backends(&store, &identity, &clock), None);

        Self {
            settings: AuthSettings::from_config(&config),
            config,
            authenticator: services.authenticator,
            store,
            identity,
            clock,
        }
    }

    fn backends(store: &Arc<InMemoryStore>, identity: &Arc<ScriptedIdentity>, clock: &Arc<FixedClock>) -> Backends {
        Backends {
            identity: identity.clone(),
            auth_sessions: store.clone(),
            activity: store.clone(),
            tenants: store.clone(),
            idempotency: store.clone(),
            clock: clock.clone(),
        }
    }

    /// Fresh services over the same backends, for mounting in a Rocket instance.
    pub fn services(&self, limiter: Option<Arc<crate::middleware::rate_limit::RateLimiter>>) -> AppServices {
        AppServices::assemble(&self.config, Self::backends(&self.store, &self.identity, &self.clock), limiter)
    }

    /// A registered user holding a valid bearer token: `(token, user_id, tenant_id)`.
    pub fn bearer_user(&self) -> (String, Uuid, Uuid) {
        let tenant_id = Uuid::new_v4();
        let user = tenant_user(tenant_id);
        let user_id = user.id;
        self.identity.register_user(user);
        let tokens = self.identity.issue_tokens(user_id, 3600);
        (tokens.access_token, user_id, tenant_id)
    }

    /// A registered user with credentials, returned as `(email, user_id, tenant_id)`.
    pub fn password_user(&self) -> (String, Uuid, Uuid) {
        let tenant_id = Uuid::new_v4();
        let user = tenant_user(tenant_id);
        let (email, user_id) = (user.email.clone().unwrap_or_default(), user.id);
        self.identity.register_user(user);
        (email, user_id, tenant_id)
    }

    pub async fn login(&self) -> (String, Uuid, Uuid) {
        self.login_with_expiry(3600).await
    }

    /// Cookie-flow login whose access token lives `expires_in` seconds:
    /// `(session_id, user_id, tenant_id)`.
    pub async fn login_with_expiry(&self, expires_in: i64) -> (String, Uuid, Uuid) {
        let (email, user_id, tenant_id) = self.password_user();
        self.identity.set_sign_in_expiry(expires_in);

        let parts = RequestParts::new(Method::Post, "/auth/login");
        let (created, _) = self.authenticator.login(&email, TEST_PASSWORD, &parts).await.expect("login");
        (created.session_id, user_id, tenant_id)
    }
}

/// A tracked local client over the full HTTP stack, backed by `harness`.
pub async fn test_client(harness: &TestHarness, limiter: Option<Arc<crate::middleware::rate_limit::RateLimiter>>) -> rocket::local::asynchronous::Client {
    let rocket = crate::build_rocket_with(harness.config.clone(), harness.services(limiter.clone()), limiter);
    rocket::local::asynchronous::Client::tracked(rocket).await.expect("valid rocket instance")
}
