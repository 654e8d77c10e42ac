use rocket::figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use rocket::http::SameSite;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE_PATH: &str = "/api/v1";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Deployment environment name. Anything that is not development-like is
    /// treated as production for cookie hardening.
    pub environment: String,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    pub cors: CorsConfig,
    pub rate_limit: RateLimitConfig,
    pub identity: IdentityConfig,
    pub session: SessionConfig,
    pub cron: CronConfig,
    pub idempotency: IdempotencyConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: u64,
    pub run_migrations: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    pub base_path: String,
    pub additional_base_paths: Vec<String>,
    pub enable_swagger: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    pub read_limit: u32,
    pub mutation_limit: u32,
    pub auth_limit: u32,
    pub window_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub require_client_ip: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IdentityConfig {
    /// Base URL of the GoTrue-compatible identity provider.
    pub url: String,
    /// The deployment's public/anonymous key. Bearer tokens equal to it never authenticate.
    pub anon_key: String,
    pub timeout_ms: u64,
    /// Where password recovery emails send the user back to.
    pub recovery_redirect_url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    pub cookie_name: String,
    /// Explicit override for the cookie `Secure` flag.
    pub cookie_secure: Option<bool>,
    /// `strict`, `lax` or `none`.
    pub cookie_same_site: String,
    /// Salt mixed into ip/user-agent hashes.
    pub hash_salt: String,
    /// Upper bound for any single store or identity-provider call.
    pub io_timeout_ms: u64,
    /// Paths (relative to the API base path) that skip authentication.
    pub public_paths: Vec<String>,
    /// Mutating paths that never demand a recent re-authentication.
    pub reauth_exempt_paths: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CronConfig {
    pub auth_token: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IdempotencyConfig {
    pub retention_hours: i64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/stockline".to_string(),
            max_connections: 16,
            min_connections: 2,
            acquire_timeout: 5,
            run_migrations: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_path: DEFAULT_API_BASE_PATH.to_string(),
            additional_base_paths: Vec::new(),
            enable_swagger: true,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:5173".to_string()],
            allow_credentials: true,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            read_limit: 300,
            mutation_limit: 60,
            auth_limit: 10,
            window_seconds: 60,
            cleanup_interval_seconds: 300,
            require_client_ip: false,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9999".to_string(),
            anon_key: String::new(),
            timeout_ms: 5_000,
            recovery_redirect_url: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "stockline_session".to_string(),
            cookie_secure: None,
            cookie_same_site: "lax".to_string(),
            hash_salt: "change-me".to_string(),
            io_timeout_ms: 5_000,
            public_paths: vec!["/auth/login".to_string(), "/auth/password-recovery".to_string(), "/health".to_string()],
            reauth_exempt_paths: vec![
                "/auth/login".to_string(),
                "/auth/logout".to_string(),
                "/auth/password-recovery".to_string(),
                "/session/touch".to_string(),
                "/session/reauth".to_string(),
            ],
        }
    }
}

impl Default for CronConfig {
    fn default() -> Self {
        Self { auth_token: String::new() }
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { retention_hours: 24 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "production".to_string(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            api: ApiConfig::default(),
            cors: CorsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            identity: IdentityConfig::default(),
            session: SessionConfig::default(),
            cron: CronConfig::default(),
            idempotency: IdempotencyConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources in priority order:
    /// 1. Built-in defaults
    /// 2. Stockline.toml (if present)
    /// 3. Environment variables prefixed with STOCKLINE_ (nested keys split on `__`)
    /// 4. DATABASE_URL, for compatibility with the usual tooling
    pub fn load() -> Result<Self, figment::Error> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("Stockline.toml"))
            .merge(Env::prefixed("STOCKLINE_").split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]).map(|_| "database.url".into()));

        figment.extract()
    }

    pub fn is_development(&self) -> bool {
        matches!(self.environment.to_ascii_lowercase().as_str(), "development" | "dev" | "local" | "test")
    }
}

impl SessionConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms.max(1))
    }

    pub fn same_site(&self) -> SameSite {
        match self.cookie_same_site.to_ascii_lowercase().as_str() {
            "strict" => SameSite::Strict,
            "none" => SameSite::None,
            _ => SameSite::Lax,
        }
    }
}

impl Config {
    /// Cookie `Secure` flag: explicit override, otherwise on outside development.
    pub fn cookie_secure(&self) -> bool {
        self.session.cookie_secure.unwrap_or(!self.is_development())
    }
}
