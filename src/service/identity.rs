//! Identity provider seam.
//!
//! Token issuance, signature checks and password verification all happen at
//! the provider; this crate only asks it questions. [`GoTrueClient`] speaks the
//! GoTrue REST dialect over [`reqwest`].

use crate::config::IdentityConfig;
use crate::error::app_error::AppError;
use crate::models::identity::{IdentitySession, IdentityUser, TokenPair};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verifies an access token. A rejected token is [`AppError::AuthExpired`].
    async fn verify_access_token(&self, access_token: &str) -> Result<IdentityUser, AppError>;

    /// Exchanges a refresh token for a new pair. A rejected refresh token is
    /// [`AppError::SessionExpired`].
    async fn refresh_session(&self, refresh_token: &str) -> Result<TokenPair, AppError>;

    /// Password grant. Wrong credentials are [`AppError::InvalidCredentials`].
    async fn sign_in(&self, email: &str, password: &str) -> Result<IdentitySession, AppError>;

    /// Starts the provider's password recovery flow.
    async fn reset_password(&self, email: &str) -> Result<(), AppError>;
}

pub struct GoTrueClient {
    client: reqwest::Client,
    base_url: String,
    anon_key: String,
    recovery_redirect_url: Option<String>,
}

impl GoTrueClient {
    pub fn new(config: &IdentityConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(Duration::from_millis(config.timeout_ms.max(1))).build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            anon_key: config.anon_key.clone(),
            recovery_redirect_url: config.recovery_redirect_url.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/auth/v1{}", self.base_url, path)
    }

    async fn post_json(&self, stage: &'static str, url: String, body: Value) -> Result<reqwest::Response, AppError> {
        self.client
            .post(url)
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(stage, e))
    }
}

fn transport_error(stage: &'static str, err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::UpstreamTimeout { stage }
    } else {
        AppError::upstream(stage, err.status().map(|s| s.as_u16()), None, err.to_string())
    }
}

/// Pulls `(code, message)` out of the provider's various error body shapes.
fn describe_error_body(body: &str) -> (Option<String>, String) {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let code = ["error_code", "code", "error"]
        .iter()
        .find_map(|k| match parsed.get(*k) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        });
    let message = ["error_description", "msg", "message"]
        .iter()
        .find_map(|k| parsed.get(*k).and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect());
    (code, message)
}

async fn upstream_failure(stage: &'static str, response: reqwest::Response) -> AppError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let (code, message) = describe_error_body(&body);
    AppError::upstream(stage, Some(status.as_u16()), code, message)
}

fn is_credential_rejection(status: StatusCode) -> bool {
    matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND)
}

#[async_trait]
impl IdentityProvider for GoTrueClient {
    async fn verify_access_token(&self, access_token: &str) -> Result<IdentityUser, AppError> {
        const STAGE: &str = "identity.verify";
        let response = self
            .client
            .get(self.url("/user"))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport_error(STAGE, e))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<IdentityUser>().await.map_err(|e| transport_error(STAGE, e));
        }
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            debug!(status = status.as_u16(), "access token rejected by identity provider");
            return Err(AppError::AuthExpired);
        }
        Err(upstream_failure(STAGE, response).await)
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<TokenPair, AppError> {
        const STAGE: &str = "identity.refresh";
        let response = self
            .post_json(STAGE, self.url("/token?grant_type=refresh_token"), json!({ "refresh_token": refresh_token }))
            .await?;

        let status = response.status();
        if status.is_success() {
            return response.json::<TokenPair>().await.map_err(|e| transport_error(STAGE, e));
        }
        if is_credential_rejection(status) {
            debug!(status = status.as_u16(), "refresh token rejected by identity provider");
            return Err(AppError::SessionExpired);
        }
        Err(upstream_failure(STAGE, response).await)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<IdentitySession, AppError> {
        const STAGE: &str = "identity.sign_in";
        let response = self
            .post_json(STAGE, self.url("/token?grant_type=password"), json!({ "email": email, "password": password }))
            .await?;

        let status = response.status();
        if status.is_success() {
            return response.json::<IdentitySession>().await.map_err(|e| transport_error(STAGE, e));
        }
        if is_credential_rejection(status) {
            return Err(AppError::InvalidCredentials);
        }
        Err(upstream_failure(STAGE, response).await)
    }

    async fn reset_password(&self, email: &str) -> Result<(), AppError> {
        const STAGE: &str = "identity.recover";
        let url = match &self.recovery_redirect_url {
            Some(redirect) => self.url(&format!("/recover?redirect_to={}", urlencoding::encode(redirect))),
            None => self.url("/recover"),
        };
        let response = self.post_json(STAGE, url, json!({ "email": email })).await?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(upstream_failure(STAGE, response).await)
    }
}
