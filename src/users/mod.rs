//! Credential store: user records, password hashing and lockout bookkeeping.
pub mod bootstrap;
pub mod password;
pub mod repo;
pub mod repo_types;

pub use repo::{PgUserStore, UserStore};
pub use repo_types::{NewUser, User};

/// Consecutive failed logins after which the account is locked.
pub const MAX_FAILED_LOGIN_ATTEMPTS: i32 = 5;

/// How long an account stays locked once the threshold is reached.
pub const LOCKOUT_DURATION: time::Duration = time::Duration::minutes(30);
