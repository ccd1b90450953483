//! In-memory persistence gateway implementing every store trait.
//!
//! All tables sit behind one mutex, so each store operation is atomic the same
//! way a single SQL statement is. Used by `AppState::fake` and the unit tests.
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditStore, NewAuditEntry};
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::sessions::{NewSession, Session, SessionStore};
use crate::users::password::hash_password_blocking;
use crate::users::{NewUser, User, UserStore, LOCKOUT_DURATION, MAX_FAILED_LOGIN_ATTEMPTS};

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    sessions: Vec<Session>,
    audit: Vec<AuditEntry>,
}

/// Shared handle to the in-memory tables; cheap to clone.
#[derive(Clone)]
pub struct MemoryDb {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            clock,
        }
    }

    pub fn user_store(&self) -> MemoryUserStore {
        MemoryUserStore::new(self.clone())
    }

    pub fn session_store(&self) -> MemorySessionStore {
        MemorySessionStore::new(self.clone())
    }

    pub fn audit_store(&self) -> MemoryAuditStore {
        MemoryAuditStore::new(self.clone())
    }

    fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }
}

/// Newest first; among equal timestamps the later insert wins.
fn newest_first<T: Clone>(
    rows: impl DoubleEndedIterator<Item = T>,
    created_at: impl Fn(&T) -> OffsetDateTime,
) -> Vec<T> {
    let mut rows: Vec<T> = rows.rev().collect();
    rows.sort_by_key(|row| std::cmp::Reverse(created_at(row)));
    rows
}

fn page<T>(rows: Vec<T>, offset: i64, limit: i64) -> Vec<T> {
    rows.into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

#[derive(Clone)]
pub struct MemoryUserStore {
    db: MemoryDb,
}

impl MemoryUserStore {
    pub fn new(db: MemoryDb) -> Self {
        Self { db }
    }

    fn with_user<T>(&self, user_id: Uuid, f: impl FnOnce(&mut User) -> T) -> StoreResult<T> {
        let mut tables = self.db.tables.lock();
        let user = tables
            .users
            .iter_mut()
            .find(|u| u.user_id == user_id)
            .ok_or(StoreError::NotFound)?;
        Ok(f(user))
    }

    fn find(&self, pred: impl Fn(&User) -> bool) -> Option<User> {
        self.db.tables.lock().users.iter().find(|u| pred(u)).cloned()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, user: NewUser, password: &str) -> StoreResult<User> {
        let password_hash = hash_password_blocking(password.to_owned()).await?;
        let now = self.db.now();
        let mut tables = self.db.tables.lock();
        if tables.users.iter().any(|u| u.email == user.email) {
            return Err(StoreError::ConstraintViolation {
                constraint: "users_email_key".into(),
            });
        }
        if tables.users.iter().any(|u| u.username == user.username) {
            return Err(StoreError::ConstraintViolation {
                constraint: "users_username_key".into(),
            });
        }
        let row = User {
            user_id: Uuid::new_v4(),
            username: user.username,
            email: user.email,
            password_hash,
            first_name: user.first_name,
            last_name: user.last_name,
            is_email_verified: user.is_email_verified,
            email_verification_token: user.email_verification_token,
            email_verification_sent_at: user.email_verification_sent_at,
            password_reset_token: None,
            password_reset_expires_at: None,
            failed_login_attempts: 0,
            locked_until: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
            is_active: user.is_active,
        };
        tables.users.push(row.clone());
        Ok(row)
    }

    async fn get_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.find(|u| u.user_id == user_id))
    }

    async fn get_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self.find(|u| u.email == email))
    }

    async fn get_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        Ok(self.find(|u| u.username == username))
    }

    async fn update(&self, user: &User) -> StoreResult<User> {
        let now = self.db.now();
        let mut tables = self.db.tables.lock();
        let clash = |other: &User| {
            other.user_id != user.user_id
                && (other.username == user.username || other.email == user.email)
        };
        if let Some(other) = tables.users.iter().find(|&u| clash(u)) {
            let constraint = if other.username == user.username {
                "users_username_key"
            } else {
                "users_email_key"
            };
            return Err(StoreError::ConstraintViolation {
                constraint: constraint.into(),
            });
        }
        let stored = tables
            .users
            .iter_mut()
            .find(|u| u.user_id == user.user_id)
            .ok_or(StoreError::NotFound)?;
        *stored = User {
            password_hash: stored.password_hash.clone(),
            created_at: stored.created_at,
            updated_at: now,
            ..user.clone()
        };
        Ok(stored.clone())
    }

    async fn update_password(&self, user_id: Uuid, new_password: &str) -> StoreResult<()> {
        let hash = hash_password_blocking(new_password.to_owned()).await?;
        let now = self.db.now();
        self.with_user(user_id, |u| {
            u.password_hash = hash;
            u.password_reset_token = None;
            u.password_reset_expires_at = None;
            u.updated_at = now;
        })
    }

    async fn record_login(&self, user_id: Uuid) -> StoreResult<()> {
        let now = self.db.now();
        self.with_user(user_id, |u| {
            u.last_login_at = Some(now);
            u.failed_login_attempts = 0;
            u.locked_until = None;
            u.updated_at = now;
        })
    }

    async fn increment_failed_login_attempts(&self, user_id: Uuid) -> StoreResult<i32> {
        let now = self.db.now();
        self.with_user(user_id, |u| {
            u.failed_login_attempts += 1;
            if u.failed_login_attempts >= MAX_FAILED_LOGIN_ATTEMPTS {
                u.locked_until = Some(now + LOCKOUT_DURATION);
            }
            u.updated_at = now;
            u.failed_login_attempts
        })
    }

    async fn unlock(&self, user_id: Uuid) -> StoreResult<()> {
        let now = self.db.now();
        self.with_user(user_id, |u| {
            u.failed_login_attempts = 0;
            u.locked_until = None;
            u.updated_at = now;
        })
    }

    async fn set_password_reset_token(
        &self,
        user_id: Uuid,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> StoreResult<()> {
        let now = self.db.now();
        self.with_user(user_id, |u| {
            u.password_reset_token = Some(token.to_owned());
            u.password_reset_expires_at = Some(expires_at);
            u.updated_at = now;
        })
    }

    async fn reset_password(&self, token: &str, new_password: &str) -> StoreResult<Option<Uuid>> {
        let hash = hash_password_blocking(new_password.to_owned()).await?;
        let now = self.db.now();
        let mut tables = self.db.tables.lock();
        let user = tables.users.iter_mut().find(|u| {
            u.password_reset_token.as_deref() == Some(token)
                && u.password_reset_expires_at.is_some_and(|exp| exp > now)
        });
        Ok(user.map(|u| {
            u.password_hash = hash;
            u.password_reset_token = None;
            u.password_reset_expires_at = None;
            u.locked_until = None;
            u.updated_at = now;
            u.user_id
        }))
    }

    async fn verify_email(&self, token: &str) -> StoreResult<Option<Uuid>> {
        let now = self.db.now();
        let mut tables = self.db.tables.lock();
        let user = tables.users.iter_mut().find(|u| {
            !u.is_email_verified && u.email_verification_token.as_deref() == Some(token)
        });
        Ok(user.map(|u| {
            u.is_email_verified = true;
            u.email_verification_token = None;
            u.updated_at = now;
            u.user_id
        }))
    }

    async fn list(&self, offset: i64, limit: i64) -> StoreResult<Vec<User>> {
        let tables = self.db.tables.lock();
        let users = newest_first(tables.users.iter().cloned(), |u: &User| u.created_at);
        Ok(page(users, offset, limit))
    }

    async fn count(&self) -> StoreResult<i64> {
        Ok(self.db.tables.lock().users.len() as i64)
    }

    async fn delete(&self, user_id: Uuid) -> StoreResult<()> {
        let mut tables = self.db.tables.lock();
        let before = tables.users.len();
        tables.users.retain(|u| u.user_id != user_id);
        if tables.users.len() == before {
            return Err(StoreError::NotFound);
        }
        tables.sessions.retain(|s| s.user_id != user_id);
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemorySessionStore {
    db: MemoryDb,
}

impl MemorySessionStore {
    pub fn new(db: MemoryDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: NewSession) -> StoreResult<Session> {
        let now = self.db.now();
        let mut tables = self.db.tables.lock();
        if tables.sessions.iter().any(|s| s.token == session.token) {
            return Err(StoreError::ConstraintViolation {
                constraint: "sessions_token_key".into(),
            });
        }
        if !tables.users.iter().any(|u| u.user_id == session.user_id) {
            return Err(StoreError::NotFound);
        }
        let row = Session {
            session_id: Uuid::new_v4(),
            user_id: session.user_id,
            token: session.token,
            ip_address: session.ip_address,
            user_agent: session.user_agent,
            expires_at: session.expires_at,
            created_at: now,
            last_active_at: now,
            is_valid: true,
        };
        tables.sessions.push(row.clone());
        Ok(row)
    }

    async fn get_by_id(&self, session_id: Uuid) -> StoreResult<Option<Session>> {
        let tables = self.db.tables.lock();
        Ok(tables
            .sessions
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned())
    }

    async fn get_by_token(&self, token: &str) -> StoreResult<Option<Session>> {
        let tables = self.db.tables.lock();
        Ok(tables.sessions.iter().find(|s| s.token == token).cloned())
    }

    async fn get_all_by_user_id(&self, user_id: Uuid) -> StoreResult<Vec<Session>> {
        let tables = self.db.tables.lock();
        let owned = tables
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        Ok(newest_first(owned.into_iter(), |s: &Session| s.created_at))
    }

    async fn invalidate(&self, token: &str) -> StoreResult<()> {
        let now = self.db.now();
        let mut tables = self.db.tables.lock();
        if let Some(session) = tables.sessions.iter_mut().find(|s| s.token == token) {
            session.is_valid = false;
            session.last_active_at = now;
        }
        Ok(())
    }

    async fn invalidate_all_for_user(&self, user_id: Uuid) -> StoreResult<u64> {
        let now = self.db.now();
        let mut tables = self.db.tables.lock();
        let mut count = 0;
        for session in tables
            .sessions
            .iter_mut()
            .filter(|s| s.user_id == user_id && s.is_valid)
        {
            session.is_valid = false;
            session.last_active_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn update_last_active_at(&self, session_id: Uuid) -> StoreResult<()> {
        let now = self.db.now();
        let mut tables = self.db.tables.lock();
        if let Some(session) = tables
            .sessions
            .iter_mut()
            .find(|s| s.session_id == session_id)
        {
            session.last_active_at = now;
        }
        Ok(())
    }

    async fn delete_expired_sessions(&self) -> StoreResult<u64> {
        let now = self.db.now();
        let mut tables = self.db.tables.lock();
        let before = tables.sessions.len();
        tables.sessions.retain(|s| s.expires_at >= now);
        Ok((before - tables.sessions.len()) as u64)
    }

    async fn delete_by_id(&self, session_id: Uuid) -> StoreResult<()> {
        let mut tables = self.db.tables.lock();
        tables.sessions.retain(|s| s.session_id != session_id);
        Ok(())
    }
}

#[derive(Clone)]
pub struct MemoryAuditStore {
    db: MemoryDb,
}

impl MemoryAuditStore {
    pub fn new(db: MemoryDb) -> Self {
        Self { db }
    }

    fn filtered(&self, pred: impl Fn(&AuditEntry) -> bool, limit: i64, offset: i64) -> Vec<AuditEntry> {
        let tables = self.db.tables.lock();
        let rows = tables
            .audit
            .iter()
            .filter(|e| pred(e))
            .cloned()
            .collect::<Vec<_>>();
        page(newest_first(rows.into_iter(), |e: &AuditEntry| e.created_at), offset, limit)
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn create(&self, entry: NewAuditEntry) -> StoreResult<AuditEntry> {
        let row = AuditEntry {
            log_id: entry.log_id.unwrap_or_else(Uuid::new_v4),
            user_id: entry.user_id,
            event_type: entry.event_type,
            ip_address: entry.ip_address,
            user_agent: entry.user_agent,
            details: Value::Object(entry.details),
            created_at: entry.created_at.unwrap_or_else(|| self.db.now()),
        };
        let mut tables = self.db.tables.lock();
        if tables.audit.iter().any(|e| e.log_id == row.log_id) {
            return Err(StoreError::ConstraintViolation {
                constraint: "audit_log_pkey".into(),
            });
        }
        tables.audit.push(row.clone());
        Ok(row)
    }

    async fn get_by_id(&self, log_id: Uuid) -> StoreResult<Option<AuditEntry>> {
        let tables = self.db.tables.lock();
        Ok(tables.audit.iter().find(|e| e.log_id == log_id).cloned())
    }

    async fn get_by_user_id(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<AuditEntry>> {
        Ok(self.filtered(|e| e.user_id == Some(user_id), limit, offset))
    }

    async fn get_by_event_type(
        &self,
        event_type: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<AuditEntry>> {
        Ok(self.filtered(|e| e.event_type == event_type, limit, offset))
    }

    async fn list(&self, limit: i64, offset: i64) -> StoreResult<Vec<AuditEntry>> {
        Ok(self.filtered(|_| true, limit, offset))
    }

    async fn count(&self) -> StoreResult<i64> {
        Ok(self.db.tables.lock().audit.len() as i64)
    }

    async fn delete_older_than(&self, threshold: OffsetDateTime) -> StoreResult<u64> {
        let mut tables = self.db.tables.lock();
        let before = tables.audit.len();
        tables.audit.retain(|e| e.created_at >= threshold);
        Ok((before - tables.audit.len()) as u64)
    }
}
