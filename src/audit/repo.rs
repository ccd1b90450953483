use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use super::repo_types::{AuditEntry, NewAuditEntry};
use crate::clock::Clock;
use crate::db::Database;
use crate::error::StoreResult;

/// Append-only store of security events. Every listing is newest first.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn create(&self, entry: NewAuditEntry) -> StoreResult<AuditEntry>;

    async fn get_by_id(&self, log_id: Uuid) -> StoreResult<Option<AuditEntry>>;

    async fn get_by_user_id(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<AuditEntry>>;

    async fn get_by_event_type(
        &self,
        event_type: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<AuditEntry>>;

    async fn list(&self, limit: i64, offset: i64) -> StoreResult<Vec<AuditEntry>>;

    async fn count(&self) -> StoreResult<i64>;

    /// Retention purge; returns the number of entries removed.
    async fn delete_older_than(&self, threshold: OffsetDateTime) -> StoreResult<u64>;
}

const SELECT_ENTRY: &str = r#"
    SELECT log_id, user_id, event_type, ip_address, user_agent, details, created_at
      FROM audit_log
"#;

#[derive(Clone)]
pub struct PgAuditStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl PgAuditStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn create(&self, entry: NewAuditEntry) -> StoreResult<AuditEntry> {
        let row = sqlx::query_as::<_, AuditEntry>(
            r#"
            INSERT INTO audit_log (log_id, user_id, event_type, ip_address, user_agent, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING log_id, user_id, event_type, ip_address, user_agent, details, created_at
            "#,
        )
        .bind(entry.log_id.unwrap_or_else(Uuid::new_v4))
        .bind(entry.user_id)
        .bind(&entry.event_type)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(Value::Object(entry.details))
        .bind(entry.created_at.unwrap_or_else(|| self.clock.now()))
        .fetch_one(self.db.pool())
        .await?;
        Ok(row)
    }

    async fn get_by_id(&self, log_id: Uuid) -> StoreResult<Option<AuditEntry>> {
        let sql = format!("{SELECT_ENTRY} WHERE log_id = $1");
        let entry = sqlx::query_as::<_, AuditEntry>(&sql)
            .bind(log_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(entry)
    }

    async fn get_by_user_id(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<AuditEntry>> {
        let sql = format!(
            "{SELECT_ENTRY} WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        );
        let entries = sqlx::query_as::<_, AuditEntry>(&sql)
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.db.pool())
            .await?;
        Ok(entries)
    }

    async fn get_by_event_type(
        &self,
        event_type: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<AuditEntry>> {
        let sql = format!(
            "{SELECT_ENTRY} WHERE event_type = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        );
        let entries = sqlx::query_as::<_, AuditEntry>(&sql)
            .bind(event_type)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.db.pool())
            .await?;
        Ok(entries)
    }

    async fn list(&self, limit: i64, offset: i64) -> StoreResult<Vec<AuditEntry>> {
        let sql = format!("{SELECT_ENTRY} ORDER BY created_at DESC LIMIT $1 OFFSET $2");
        let entries = sqlx::query_as::<_, AuditEntry>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.db.pool())
            .await?;
        Ok(entries)
    }

    async fn count(&self) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM audit_log")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    async fn delete_older_than(&self, threshold: OffsetDateTime) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM audit_log WHERE created_at < $1")
            .bind(threshold)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
