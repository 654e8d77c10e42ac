/// Event types for the security audit trail
pub mod audit_events {
    // Authentication events
    pub const LOGIN_SUCCESS: &str = "login_success";
    pub const LOGIN_FAILED: &str = "login_failed";
    pub const LOGOUT: &str = "logout";

    // Session lifecycle events
    pub const SESSION_CREATED: &str = "session_created";
    pub const SESSION_REFRESHED: &str = "session_refreshed";
    pub const SESSION_REFRESH_FAILED: &str = "session_refresh_failed";
    pub const SESSION_TOKEN_REJECTED: &str = "session_token_rejected";
    pub const SESSION_IDLE_EXPIRED: &str = "session_idle_expired";
    pub const SESSION_TIMEBOX_EXPIRED: &str = "session_timebox_expired";
    pub const REAUTH_CONFIRMED: &str = "reauth_confirmed";
    pub const REAUTH_FAILED: &str = "reauth_failed";

    // Password recovery
    pub const PASSWORD_RECOVERY_REQUESTED: &str = "password_recovery_requested";
}
