//! Session store and the background expiry sweep.
pub mod cleanup;
pub mod repo;
pub mod repo_types;

pub use cleanup::{run_cleanup_tick, spawn_session_cleanup, CleanupReport};
pub use repo::{PgSessionStore, SessionStore};
pub use repo_types::{NewSession, Session};
