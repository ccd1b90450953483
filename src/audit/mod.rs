//! Audit trail of security-relevant events.
pub mod repo;
pub mod repo_types;

pub use repo::{AuditStore, PgAuditStore};
pub use repo_types::{AuditEntry, NewAuditEntry};

/// Event type names written by the auth service.
pub mod events {
    pub const LOGIN: &str = "login";
    pub const LOGIN_FAILED: &str = "login_failed";
    pub const ACCOUNT_LOCKED: &str = "account_locked";
    pub const LOGOUT: &str = "logout";
    pub const REGISTER: &str = "register";
    pub const EMAIL_VERIFIED: &str = "email_verified";
    pub const PASSWORD_RESET_REQUESTED: &str = "password_reset_requested";
    pub const PASSWORD_RESET: &str = "password_reset";
    pub const PASSWORD_CHANGED: &str = "password_changed";
    pub const SESSIONS_REVOKED: &str = "sessions_revoked";
}
