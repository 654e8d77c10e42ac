use uuid::Uuid;

/// Emits a security audit event on the `audit` tracing category.
pub fn record_security_event(user_id: Option<&Uuid>, event_type: &str, success: bool, session_id: Option<&str>, detail: Option<&str>) {
    let uid_str = user_id.map(|u| u.to_string());
    if success {
        tracing::info!(
            category = "audit",
            event_type = event_type,
            success = success,
            user_id = uid_str.as_deref().unwrap_or("-"),
            session_id = session_id.unwrap_or("-"),
            detail = detail.unwrap_or("-"),
            "security audit event"
        );
    } else {
        tracing::warn!(
            category = "audit",
            event_type = event_type,
            success = success,
            user_id = uid_str.as_deref().unwrap_or("-"),
            session_id = session_id.unwrap_or("-"),
            detail = detail.unwrap_or("-"),
            "security audit event (failure)"
        );
    }
}
