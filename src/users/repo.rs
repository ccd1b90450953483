use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::password::{hash_password_blocking, verify_password_blocking};
use super::repo_types::{NewUser, User};
use super::{LOCKOUT_DURATION, MAX_FAILED_LOGIN_ATTEMPTS};
use crate::clock::Clock;
use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Credential store: user records, password hashes and lockout bookkeeping.
///
/// Lookups return `Ok(None)` when no row matches so callers can tell a missing
/// identity apart from an infrastructure failure.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Hashes `password` and inserts the user. Duplicate username or email
    /// yields `StoreError::ConstraintViolation`.
    async fn create(&self, user: NewUser, password: &str) -> StoreResult<User>;

    async fn get_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>>;

    async fn get_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn get_by_username(&self, username: &str) -> StoreResult<Option<User>>;

    /// Writes every mutable column except the password hash and returns the
    /// stored row with a fresh `updated_at`.
    async fn update(&self, user: &User) -> StoreResult<User>;

    /// Rehashes the password and clears any pending reset token.
    async fn update_password(&self, user_id: Uuid, new_password: &str) -> StoreResult<()>;

    async fn verify_password(&self, user: &User, candidate: &str) -> StoreResult<bool> {
        verify_password_blocking(candidate.to_owned(), user.password_hash.clone()).await
    }

    /// Resets the failed-attempt counter, clears the lock and stamps `last_login_at`.
    async fn record_login(&self, user_id: Uuid) -> StoreResult<()>;

    /// Atomically bumps the failed-attempt counter and returns the new value.
    /// Reaching `MAX_FAILED_LOGIN_ATTEMPTS` sets `locked_until` in the same write.
    async fn increment_failed_login_attempts(&self, user_id: Uuid) -> StoreResult<i32>;

    async fn unlock(&self, user_id: Uuid) -> StoreResult<()>;

    async fn set_password_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> StoreResult<()>;

    /// Consumes an unexpired reset token: sets the new password, clears the
    /// token and any lock. Returns the owner, or `None` if the token is unknown
    /// or expired.
    async fn reset_password(&self, token: &str, new_password: &str) -> StoreResult<Option<Uuid>>;

    /// Marks the unverified user holding `token` as verified and clears the token.
    async fn verify_email(&self, token: &str) -> StoreResult<Option<Uuid>>;

    async fn list(&self, offset: i64, limit: i64) -> StoreResult<Vec<User>>;

    async fn count(&self) -> StoreResult<i64>;

    async fn delete(&self, user_id: Uuid) -> StoreResult<()>;
}

const SELECT_USER: &str = r#"
    SELECT user_id, username, email, password_hash, first_name, last_name,
           is_email_verified, email_verification_token, email_verification_sent_at,
           password_reset_token, password_reset_expires_at, failed_login_attempts,
           locked_until, last_login_at, created_at, updated_at, is_active
      FROM users
"#;

/// PostgreSQL-backed credential store.
#[derive(Clone)]
pub struct PgUserStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl PgUserStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    async fn fetch_one_where(&self, predicate: &str, value: &str) -> StoreResult<Option<User>> {
        let sql = format!("{SELECT_USER} WHERE {predicate} = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(value)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(user)
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create(&self, user: NewUser, password: &str) -> StoreResult<User> {
        let hash = hash_password_blocking(password.to_owned()).await?;
        let now = self.clock.now();
        let row = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (
                user_id, username, email, password_hash, first_name, last_name,
                is_email_verified, email_verification_token, email_verification_sent_at,
                is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
            RETURNING user_id, username, email, password_hash, first_name, last_name,
                      is_email_verified, email_verification_token, email_verification_sent_at,
                      password_reset_token, password_reset_expires_at, failed_login_attempts,
                      locked_until, last_login_at, created_at, updated_at, is_active
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&user.username)
        .bind(&user.email)
        .bind(&hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.is_email_verified)
        .bind(&user.email_verification_token)
        .bind(user.email_verification_sent_at)
        .bind(user.is_active)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;
        Ok(row)
    }

    async fn get_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        let sql = format!("{SELECT_USER} WHERE user_id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(user_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(user)
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        self.fetch_one_where("email", email).await
    }

    async fn get_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        self.fetch_one_where("username", username).await
    }

    async fn update(&self, user: &User) -> StoreResult<User> {
        let row = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET
                username = $2,
                email = $3,
                first_name = $4,
                last_name = $5,
                is_email_verified = $6,
                email_verification_token = $7,
                email_verification_sent_at = $8,
                password_reset_token = $9,
                password_reset_expires_at = $10,
                failed_login_attempts = $11,
                locked_until = $12,
                last_login_at = $13,
                is_active = $14,
                updated_at = $15
            WHERE user_id = $1
            RETURNING user_id, username, email, password_hash, first_name, last_name,
                      is_email_verified, email_verification_token, email_verification_sent_at,
                      password_reset_token, password_reset_expires_at, failed_login_attempts,
                      locked_until, last_login_at, created_at, updated_at, is_active
            "#,
        )
        .bind(user.user_id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.is_email_verified)
        .bind(&user.email_verification_token)
        .bind(user.email_verification_sent_at)
        .bind(&user.password_reset_token)
        .bind(user.password_reset_expires_at)
        .bind(user.failed_login_attempts)
        .bind(user.locked_until)
        .bind(user.last_login_at)
        .bind(user.is_active)
        .bind(self.clock.now())
        .fetch_optional(self.db.pool())
        .await?;
        row.ok_or(StoreError::NotFound)
    }

    async fn update_password(&self, user_id: Uuid, new_password: &str) -> StoreResult<()> {
        let hash = hash_password_blocking(new_password.to_owned()).await?;
        let result = sqlx::query(
            r#"
            UPDATE users SET
                password_hash = $2,
                password_reset_token = NULL,
                password_reset_expires_at = NULL,
                updated_at = $3
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(&hash)
        .bind(self.clock.now())
        .execute(self.db.pool())
        .await?;
        expect_row(result.rows_affected())
    }

    async fn record_login(&self, user_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                last_login_at = $2,
                failed_login_attempts = 0,
                locked_until = NULL,
                updated_at = $2
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(self.clock.now())
        .execute(self.db.pool())
        .await?;
        expect_row(result.rows_affected())
    }

    async fn increment_failed_login_attempts(&self, user_id: Uuid) -> StoreResult<i32> {
        let now = self.clock.now();
        // Right-hand sides see the pre-update row, so `failed_login_attempts + 1`
        // in the CASE is the value being written.
        let attempts = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE users SET
                failed_login_attempts = failed_login_attempts + 1,
                locked_until = CASE
                    WHEN failed_login_attempts + 1 >= $2 THEN $3
                    ELSE locked_until
                END,
                updated_at = $4
            WHERE user_id = $1
            RETURNING failed_login_attempts
            "#,
        )
        .bind(user_id)
        .bind(MAX_FAILED_LOGIN_ATTEMPTS)
        .bind(now + LOCKOUT_DURATION)
        .bind(now)
        .fetch_optional(self.db.pool())
        .await?;
        attempts.ok_or(StoreError::NotFound)
    }

    async fn unlock(&self, user_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                failed_login_attempts = 0,
                locked_until = NULL,
                updated_at = $2
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(self.clock.now())
        .execute(self.db.pool())
        .await?;
        expect_row(result.rows_affected())
    }

    async fn set_password_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                password_reset_token = $2,
                password_reset_expires_at = $3,
                updated_at = $4
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(token)
        .bind(expires_at)
        .bind(self.clock.now())
        .execute(self.db.pool())
        .await?;
        expect_row(result.rows_affected())
    }

    async fn reset_password(&self, token: &str, new_password: &str) -> StoreResult<Option<Uuid>> {
        let hash = hash_password_blocking(new_password.to_owned()).await?;
        let user_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE users SET
                password_hash = $2,
                password_reset_token = NULL,
                password_reset_expires_at = NULL,
                locked_until = NULL,
                updated_at = $3
            WHERE password_reset_token = $1
              AND password_reset_expires_at > $3
            RETURNING user_id
            "#,
        )
        .bind(token)
        .bind(&hash)
        .bind(self.clock.now())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(user_id)
    }

    async fn verify_email(&self, token: &str) -> StoreResult<Option<Uuid>> {
        let user_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE users SET
                is_email_verified = TRUE,
                email_verification_token = NULL,
                updated_at = $2
            WHERE email_verification_token = $1
              AND is_email_verified = FALSE
            RETURNING user_id
            "#,
        )
        .bind(token)
        .bind(self.clock.now())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(user_id)
    }

    async fn list(&self, offset: i64, limit: i64) -> StoreResult<Vec<User>> {
        let sql = format!("{SELECT_USER} ORDER BY created_at DESC LIMIT $1 OFFSET $2");
        let users = sqlx::query_as::<_, User>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.db.pool())
            .await?;
        Ok(users)
    }

    async fn count(&self) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    async fn delete(&self, user_id: Uuid) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM users WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        expect_row(result.rows_affected())?;
        tx.commit().await?;
        Ok(())
    }
}

fn expect_row(rows_affected: u64) -> StoreResult<()> {
    if rows_affected == 0 {
        Err(StoreError::NotFound)
    } else {
        Ok(())
    }
}
