//! PostgreSQL persistence gateway shared by every store.
use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::StoreResult;

/// Pooled, transactional executor handed to each store's constructor.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .max_lifetime(std::time::Duration::from_secs(60 * 60))
            .connect_with(config.connect_options()?)
            .await
            .context("connect to database")?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("ping database")?;

        info!(max_connections = config.max_connections, "database pool ready");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Starts a transaction; it rolls back on drop unless committed.
    pub async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("run migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
