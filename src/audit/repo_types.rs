use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Audit log entry; immutable once written.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditEntry {
    pub log_id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Entry to append. `log_id` and `created_at` are filled in by the store when absent.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub log_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: Map<String, Value>,
    pub created_at: Option<OffsetDateTime>,
}

impl NewAuditEntry {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            log_id: None,
            user_id: None,
            event_type: event_type.into(),
            ip_address: None,
            user_agent: None,
            details: Map::new(),
            created_at: None,
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn client(mut self, ip_address: Option<&str>, user_agent: Option<&str>) -> Self {
        self.ip_address = ip_address.map(str::to_owned);
        self.user_agent = user_agent.map(str::to_owned);
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_owned(), value.into());
        self
    }

    pub fn at(mut self, created_at: OffsetDateTime) -> Self {
        self.created_at = Some(created_at);
        self
    }
}
