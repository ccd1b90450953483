use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // Argon2 PHC string, never exposed
    pub first_name: String,
    pub last_name: String,
    pub is_email_verified: bool,
    #[serde(skip_serializing)]
    pub email_verification_token: Option<String>,
    #[serde(skip_serializing)]
    pub email_verification_sent_at: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub password_reset_token: Option<String>,
    #[serde(skip_serializing)]
    pub password_reset_expires_at: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub failed_login_attempts: i32,
    #[serde(skip_serializing)]
    pub locked_until: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub is_active: bool,
}

impl User {
    pub fn is_locked(&self, now: OffsetDateTime) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

/// Input for `UserStore::create`; the store assigns id, hash and timestamps.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub is_email_verified: bool,
    pub is_active: bool,
    pub email_verification_token: Option<String>,
    pub email_verification_sent_at: Option<OffsetDateTime>,
}

impl NewUser {
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            first_name: String::new(),
            last_name: String::new(),
            is_email_verified: false,
            is_active: true,
            email_verification_token: None,
            email_verification_sent_at: None,
        }
    }

    pub fn named(mut self, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        self.first_name = first_name.into();
        self.last_name = last_name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample() -> User {
        let now = datetime!(2024-05-01 12:00 UTC);
        User {
            user_id: Uuid::new_v4(),
            username: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$ZGlnZXN0".into(),
            first_name: "Alice".into(),
            last_name: "Liddell".into(),
            is_email_verified: false,
            email_verification_token: Some("verify-me".into()),
            email_verification_sent_at: Some(now),
            password_reset_token: Some("reset-me".into()),
            password_reset_expires_at: Some(now),
            failed_login_attempts: 2,
            locked_until: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
            is_active: true,
        }
    }

    #[test]
    fn secrets_are_not_serialized() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("alice@example.com"));
        assert!(json.contains("2024-05-01T12:00:00Z"));
        assert!(!json.contains("argon2"));
        assert!(!json.contains("verify-me"));
        assert!(!json.contains("reset-me"));
        assert!(!json.contains("failed_login_attempts"));
    }

    #[test]
    fn lock_expires_at_boundary() {
        let mut user = sample();
        let until = datetime!(2024-05-01 12:30 UTC);
        user.locked_until = Some(until);
        assert!(user.is_locked(until - time::Duration::seconds(1)));
        assert!(!user.is_locked(until));
        user.locked_until = None;
        assert!(!user.is_locked(until));
    }
}
