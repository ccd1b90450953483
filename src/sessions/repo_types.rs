use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Session record in the database.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
    pub is_valid: bool,
}

impl Session {
    /// Usable only while still flagged valid and strictly before `expires_at`.
    pub fn is_usable(&self, now: OffsetDateTime) -> bool {
        self.is_valid && now < self.expires_at
    }
}

/// Input for `SessionStore::create`. The token is generated by the caller.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub token: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn usable_until_expiry_exclusive() {
        let expires_at = datetime!(2024-05-01 13:00 UTC);
        let mut session = Session {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token: "tok".into(),
            ip_address: None,
            user_agent: None,
            expires_at,
            created_at: datetime!(2024-05-01 12:00 UTC),
            last_active_at: datetime!(2024-05-01 12:00 UTC),
            is_valid: true,
        };
        assert!(session.is_usable(expires_at - time::Duration::seconds(1)));
        assert!(!session.is_usable(expires_at));
        assert!(!session.is_usable(expires_at + time::Duration::seconds(1)));

        session.is_valid = false;
        assert!(!session.is_usable(expires_at - time::Duration::minutes(30)));
    }
}
