use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A user as vouched for by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityUser {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub user_metadata: Value,
    #[serde(default)]
    pub app_metadata: Value,
}

/// Token pair returned by a password grant or refresh.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of `access_token` in seconds.
    pub expires_in: i64,
}

/// Result of `sign_in`: the token pair plus the user it belongs to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdentitySession {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub user: IdentityUser,
}

impl IdentityUser {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            email: None,
            role: None,
            user_metadata: Value::Null,
            app_metadata: Value::Null,
        }
    }
}
