use std::sync::Arc;

use crate::audit::{AuditStore, PgAuditStore};
use crate::auth::{AuthService, LogNotifier, Notifier};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::db::Database;
use crate::memory::MemoryDb;
use crate::sessions::{PgSessionStore, SessionStore};
use crate::users::{PgUserStore, UserStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthService>,
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub audit: Arc<dyn AuditStore>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Connects to PostgreSQL, applies migrations and wires the stores.
    pub async fn init(config: AppConfig) -> anyhow::Result<(Self, Database)> {
        let db = Database::connect(&config.database).await?;
        db.migrate().await?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = Self::from_parts(
            config,
            Arc::new(PgUserStore::new(db.clone(), clock.clone())),
            Arc::new(PgSessionStore::new(db.clone(), clock.clone())),
            Arc::new(PgAuditStore::new(db.clone(), clock.clone())),
            Arc::new(LogNotifier),
            clock,
        );
        Ok((state, db))
    }

    pub fn from_parts(
        config: AppConfig,
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        audit: Arc<dyn AuditStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let auth = Arc::new(AuthService::new(
            users.clone(),
            sessions.clone(),
            audit.clone(),
            clock.clone(),
            config.auth.clone(),
        ));
        Self {
            config: Arc::new(config),
            auth,
            users,
            sessions,
            audit,
            notifier,
            clock,
        }
    }

    /// In-memory state for tests and local experiments; no database needed.
    pub fn fake() -> Self {
        let db = MemoryDb::new();
        Self::from_parts(
            AppConfig::for_tests(),
            Arc::new(db.user_store()),
            Arc::new(db.session_store()),
            Arc::new(db.audit_store()),
            Arc::new(LogNotifier),
            Arc::new(SystemClock),
        )
    }
}
