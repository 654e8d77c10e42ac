use crate::auth::credentials::{ClaimsHint, tenant_field};
use crate::database::tenant::TenantDirectory;
use crate::error::app_error::AppError;
use crate::models::identity::IdentityUser;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const BODY_TENANT_KEYS: [&str; 2] = ["owner_id", "tenant_id"];

/// Maps a verified user to the tenant every downstream read and write is scoped to.
pub struct TenantResolver {
    directory: Arc<dyn TenantDirectory>,
}

fn parse_tenant(source: &str, raw: &str, user_id: &Uuid) -> Option<Uuid> {
    match Uuid::parse_str(raw) {
        Ok(tenant_id) => Some(tenant_id),
        Err(_) => {
            warn!(user_id = %user_id, source, "ignoring malformed tenant id");
            None
        }
    }
}

impl TenantResolver {
    pub fn new(directory: Arc<dyn TenantDirectory>) -> Self {
        Self { directory }
    }

    /// Profile metadata first, then the token's claims, then the directory.
    pub async fn resolve(&self, user: &IdentityUser, claims: Option<&ClaimsHint>) -> Result<Uuid, AppError> {
        let from_profile = [("user_metadata", &user.user_metadata), ("app_metadata", &user.app_metadata)]
            .into_iter()
            .filter_map(|(source, value)| value.as_object().and_then(tenant_field).map(|raw| (source, raw)))
            .find_map(|(source, raw)| parse_tenant(source, raw, &user.id));
        if let Some(tenant_id) = from_profile {
            return Ok(tenant_id);
        }

        if let Some(tenant_id) = claims.and_then(ClaimsHint::tenant_hint).and_then(|raw| parse_tenant("claims", raw, &user.id)) {
            return Ok(tenant_id);
        }

        match self.directory.owner_for_user(&user.id).await? {
            Some(tenant_id) => {
                debug!(user_id = %user.id, tenant_id = %tenant_id, "tenant resolved from directory");
                Ok(tenant_id)
            }
            None => {
                warn!(user_id = %user.id, "no tenant found for user");
                Err(AppError::OwnerNotFound)
            }
        }
    }
}

fn check_object(object: &serde_json::Map<String, Value>, tenant_id: &Uuid) -> Result<(), AppError> {
    for key in BODY_TENANT_KEYS {
        match object.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::String(raw)) if Uuid::parse_str(raw.trim()).is_ok_and(|claimed| claimed == *tenant_id) => {}
            Some(_) => return Err(AppError::RlsDenied),
        }
    }
    Ok(())
}

/// Rejects a request body that names a tenant other than the caller's.
///
/// Checks the top-level object, or each element of a top-level array. Bodies
/// that name no tenant pass.
pub fn ensure_body_tenant(body: Option<&Value>, tenant_id: &Uuid) -> Result<(), AppError> {
    match body {
        Some(Value::Object(object)) => check_object(object, tenant_id),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_object)
            .try_for_each(|object| check_object(object, tenant_id)),
        _ => Ok(()),
    }
}
