use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::repo_types::{NewSession, Session};
use crate::clock::Clock;
use crate::db::Database;
use crate::error::StoreResult;

/// Session store: persisted authentication grants.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: NewSession) -> StoreResult<Session>;

    async fn get_by_id(&self, session_id: Uuid) -> StoreResult<Option<Session>>;

    async fn get_by_token(&self, token: &str) -> StoreResult<Option<Session>>;

    /// All sessions of a user, newest first.
    async fn get_all_by_user_id(&self, user_id: Uuid) -> StoreResult<Vec<Session>>;

    /// Idempotent; unknown or already invalid tokens are not an error.
    async fn invalidate(&self, token: &str) -> StoreResult<()>;

    async fn invalidate_all_for_user(&self, user_id: Uuid) -> StoreResult<u64>;

    async fn update_last_active_at(&self, session_id: Uuid) -> StoreResult<()>;

    /// Deletes every session whose `expires_at` is in the past.
    async fn delete_expired_sessions(&self) -> StoreResult<u64>;

    async fn delete_by_id(&self, session_id: Uuid) -> StoreResult<()>;
}

const SELECT_SESSION: &str = r#"
    SELECT session_id, user_id, token, ip_address, user_agent,
           expires_at, created_at, last_active_at, is_valid
      FROM sessions
"#;

/// PostgreSQL-backed session store.
#[derive(Clone)]
pub struct PgSessionStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl PgSessionStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: NewSession) -> StoreResult<Session> {
        let row = sqlx::query_as::<_, Session>(
            r#"
            INSERT INTO sessions (
                session_id, user_id, token, ip_address, user_agent,
                expires_at, created_at, last_active_at, is_valid
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, TRUE)
            RETURNING session_id, user_id, token, ip_address, user_agent,
                      expires_at, created_at, last_active_at, is_valid
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session.user_id)
        .bind(&session.token)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(session.expires_at)
        .bind(self.clock.now())
        .fetch_one(self.db.pool())
        .await?;
        Ok(row)
    }

    async fn get_by_id(&self, session_id: Uuid) -> StoreResult<Option<Session>> {
        let sql = format!("{SELECT_SESSION} WHERE session_id = $1");
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(session_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(session)
    }

    async fn get_by_token(&self, token: &str) -> StoreResult<Option<Session>> {
        let sql = format!("{SELECT_SESSION} WHERE token = $1");
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(token)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(session)
    }

    async fn get_all_by_user_id(&self, user_id: Uuid) -> StoreResult<Vec<Session>> {
        let sql = format!("{SELECT_SESSION} WHERE user_id = $1 ORDER BY created_at DESC");
        let sessions = sqlx::query_as::<_, Session>(&sql)
            .bind(user_id)
            .fetch_all(self.db.pool())
            .await?;
        Ok(sessions)
    }

    async fn invalidate(&self, token: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE sessions SET is_valid = FALSE, last_active_at = $2 WHERE token = $1",
        )
        .bind(token)
        .bind(self.clock.now())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn invalidate_all_for_user(&self, user_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET is_valid = FALSE, last_active_at = $2
            WHERE user_id = $1 AND is_valid
            "#,
        )
        .bind(user_id)
        .bind(self.clock.now())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn update_last_active_at(&self, session_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET last_active_at = $2 WHERE session_id = $1")
            .bind(session_id)
            .bind(self.clock.now())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn delete_expired_sessions(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < $1")
            .bind(self.clock.now())
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_id(&self, session_id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}
