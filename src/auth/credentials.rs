//! Credential extraction and best-effort token inspection.
//!
//! Nothing decoded here is trusted for authorization. Claims read from a token
//! payload are hints: they pick a session id, spot the anonymous role, or
//! suggest a tenant for a user the identity provider already verified.

use crate::pipeline::RequestParts;
use crate::util::sha256_hex;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use serde_json::{Map, Value};

pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const INTERACTION_HEADER: &str = "x-user-interaction";

const MAX_SESSION_ID_LEN: usize = 128;
const ANON_ROLE: &str = "anon";

/// What a request presented to identify its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    CookieSession(String),
    None,
}

/// Unverified claims read from a token's payload segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimsHint(Map<String, Value>);

impl ClaimsHint {
    fn str_claim(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn role(&self) -> Option<&str> {
        self.str_claim("role")
    }

    pub fn session_id(&self) -> Option<&str> {
        self.str_claim("session_id")
    }

    pub fn subject(&self) -> Option<&str> {
        self.str_claim("sub")
    }

    pub fn is_anonymous(&self) -> bool {
        self.role() == Some(ANON_ROLE)
    }

    /// Tenant id carried in the claims, top-level or inside `app_metadata`/`user_metadata`.
    pub fn tenant_hint(&self) -> Option<&str> {
        tenant_field(&self.0).or_else(|| {
            ["app_metadata", "user_metadata"]
                .iter()
                .filter_map(|k| self.0.get(*k).and_then(Value::as_object))
                .find_map(tenant_field)
        })
    }
}

/// Reads `owner_id` (preferred) or `tenant_id` from a JSON object.
pub(crate) fn tenant_field(map: &Map<String, Value>) -> Option<&str> {
    ["owner_id", "tenant_id"]
        .iter()
        .filter_map(|k| map.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Decodes the middle segment of a `header.payload.signature` token.
///
/// Returns `None` on any structural problem; never errors.
pub fn decode_claims_hint(token: &str) -> Option<ClaimsHint> {
    let mut segments = token.trim().split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;
    if payload.is_empty() {
        return None;
    }

    let payload = payload.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD.decode(payload).or_else(|_| STANDARD_NO_PAD.decode(payload)).ok()?;

    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(map) => Some(ClaimsHint(map)),
        _ => None,
    }
}

/// True for the deployment's public key or any token claiming the anonymous role.
pub fn is_anonymous_token(token: &str, anon_key: &str) -> bool {
    if !anon_key.is_empty() && token == anon_key {
        return true;
    }

    decode_claims_hint(token).is_some_and(|claims| claims.is_anonymous())
}

fn bearer_from_header(value: &str) -> Option<&str> {
    let value = value.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Picks the credential a request authenticates with.
///
/// A usable bearer token wins; anonymous/public tokens count as absent, and the
/// cookie-carried session id is the fallback.
pub fn resolve_credential(parts: &RequestParts, anon_key: &str) -> Credential {
    if let Some(token) = parts.header("authorization").and_then(bearer_from_header)
        && !is_anonymous_token(token, anon_key)
    {
        return Credential::Bearer(token.to_string());
    }

    match parts.session_cookie.as_deref().map(str::trim) {
        Some(session_id) if !session_id.is_empty() => Credential::CookieSession(session_id.to_string()),
        _ => Credential::None,
    }
}

/// Session id for the activity ledger on the bearer path:
/// `X-Session-Id` header, then the token's `session_id` claim, then a hash of the token.
///
/// The token-hash fallback changes whenever the token is refreshed, so bearer
/// clients that send neither header nor claim start a fresh activity record
/// after every refresh.
pub fn resolve_bearer_session_id(parts: &RequestParts, claims: Option<&ClaimsHint>, token: &str) -> String {
    if let Some(header) = parts.header(SESSION_ID_HEADER).map(str::trim)
        && !header.is_empty()
        && header.len() <= MAX_SESSION_ID_LEN
    {
        return header.to_string();
    }

    if let Some(claim) = claims.and_then(ClaimsHint::session_id) {
        return claim.to_string();
    }

    format!("tok_{}", &sha256_hex(token)[..32])
}

#[cfg(test)]
pub(crate) fn encode_test_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rocket::http::Method;
    use serde_json::json;

    fn parts_with(headers: &[(&str, &str)], cookie: Option<&str>) -> RequestParts {
        let mut parts = RequestParts::new(Method::Get, "/session");
        for (name, value) in headers {
            parts = parts.with_header(*name, *value);
        }
        parts.session_cookie = cookie.map(str::to_string);
        parts
    }

    #[test]
    fn decodes_payload_claims() {
        let token = encode_test_token(&json!({"sub": "u1", "role": "authenticated", "session_id": "s-1"}));
        let claims = decode_claims_hint(&token).expect("claims");
        assert_eq!(claims.subject(), Some("u1"));
        assert_eq!(claims.session_id(), Some("s-1"));
        assert!(!claims.is_anonymous());
    }

    #[test]
    fn decode_failures_yield_none() {
        assert!(decode_claims_hint("").is_none());
        assert!(decode_claims_hint("opaque-token").is_none());
        assert!(decode_claims_hint("a.!!!.c").is_none());
        let not_object = format!("h.{}.s", URL_SAFE_NO_PAD.encode("[1,2]"));
        assert!(decode_claims_hint(&not_object).is_none());
    }

    #[test]
    fn tenant_hint_prefers_top_level_then_metadata() {
        let token = encode_test_token(&json!({"app_metadata": {"owner_id": "t-app"}, "user_metadata": {"tenant_id": "t-user"}}));
        assert_eq!(decode_claims_hint(&token).unwrap().tenant_hint(), Some("t-app"));

        let token = encode_test_token(&json!({"owner_id": "t-top", "app_metadata": {"owner_id": "t-app"}}));
        assert_eq!(decode_claims_hint(&token).unwrap().tenant_hint(), Some("t-top"));
    }

    #[test]
    fn anonymous_key_is_treated_as_absent() {
        let anon = encode_test_token(&json!({"role": "anon", "iss": "idp"}));
        let parts = parts_with(&[("Authorization", &format!("Bearer {anon}"))], None);
        assert_eq!(resolve_credential(&parts, &anon), Credential::None);
    }

    #[test]
    fn anon_role_claim_is_rejected_even_with_other_key_configured() {
        let anon = encode_test_token(&json!({"role": "anon"}));
        let parts = parts_with(&[("authorization", &format!("Bearer {anon}"))], Some("sid-1"));
        assert_eq!(resolve_credential(&parts, "some-other-key"), Credential::CookieSession("sid-1".to_string()));
    }

    #[test]
    fn bearer_wins_over_cookie() {
        let token = encode_test_token(&json!({"role": "authenticated"}));
        let parts = parts_with(&[("Authorization", &format!("bearer  {token} "))], Some("sid-1"));
        assert_eq!(resolve_credential(&parts, ""), Credential::Bearer(token));
    }

    #[test]
    fn non_bearer_scheme_falls_back_to_cookie() {
        let parts = parts_with(&[("Authorization", "Basic dXNlcjpwYXNz")], Some("sid-2"));
        assert_eq!(resolve_credential(&parts, ""), Credential::CookieSession("sid-2".to_string()));
        let parts = parts_with(&[], Some("  "));
        assert_eq!(resolve_credential(&parts, ""), Credential::None);
    }

    #[test]
    fn bearer_session_id_precedence() {
        let token = encode_test_token(&json!({"session_id": "claim-sid"}));
        let claims = decode_claims_hint(&token);

        let parts = parts_with(&[("X-Session-Id", "header-sid")], None);
        assert_eq!(resolve_bearer_session_id(&parts, claims.as_ref(), &token), "header-sid");

        let parts = parts_with(&[], None);
        assert_eq!(resolve_bearer_session_id(&parts, claims.as_ref(), &token), "claim-sid");

        let derived = resolve_bearer_session_id(&parts, None, "opaque");
        assert!(derived.starts_with("tok_"));
        assert_eq!(derived, resolve_bearer_session_id(&parts, None, "opaque"));
        assert_ne!(derived, resolve_bearer_session_id(&parts, None, "opaque-rotated"));
    }

    proptest! {
        #[test]
        fn decode_never_panics(token in ".{0,200}") {
            let _ = decode_claims_hint(&token);
        }

        #[test]
        fn decode_roundtrips_string_claims(sub in "[a-zA-Z0-9-]{1,40}") {
            let token = encode_test_token(&json!({"sub": sub.clone()}));
            let claims = decode_claims_hint(&token).expect("claims");
            prop_assert_eq!(claims.subject(), Some(sub.as_str()));
        }
    }
}
