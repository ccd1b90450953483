use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::token::generate_secure_token;
use crate::audit::{events, AuditEntry, AuditStore, NewAuditEntry};
use crate::clock::Clock;
use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult, StoreError};
use crate::sessions::{NewSession, Session, SessionStore};
use crate::users::password::{verify_password_blocking, DUMMY_PASSWORD_HASH};
use crate::users::{NewUser, User, UserStore, MAX_FAILED_LOGIN_ATTEMPTS};

/// Lifetime of a password reset token.
pub const PASSWORD_RESET_TTL: time::Duration = time::Duration::hours(24);

/// Where a request came from; recorded on sessions and audit entries.
#[derive(Debug, Default, Clone)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    fn tag(&self, entry: NewAuditEntry) -> NewAuditEntry {
        entry.client(self.ip_address.as_deref(), self.user_agent.as_deref())
    }
}

/// Input for `AuthService::register`.
#[derive(Debug, Clone)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

/// Issued by `forgot_password`; the token goes out through the notifier.
#[derive(Debug, Clone)]
pub struct PasswordResetTicket {
    pub user: User,
    pub token: String,
}

/// Orchestrates the stores into login, registration, session validation and
/// password recovery. Holds no per-request state.
pub struct AuthService {
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    audit: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        audit: Arc<dyn AuditStore>,
        clock: Arc<dyn Clock>,
        config: AuthConfig,
    ) -> Self {
        Self {
            users,
            sessions,
            audit,
            clock,
            config,
        }
    }

    fn session_expiry(&self) -> Result<OffsetDateTime, StoreError> {
        self.config
            .session_ttl_minutes
            .checked_mul(60)
            .map(time::Duration::seconds)
            .and_then(|ttl| self.clock.now().checked_add(ttl))
            .ok_or(StoreError::TimeOverflow("session expiry"))
    }

    /// Appends an audit entry; failures are logged and dropped.
    async fn record(&self, entry: NewAuditEntry) {
        let event_type = entry.event_type.clone();
        if let Err(e) = self.audit.create(entry).await {
            warn!(error = %e, event_type = %event_type, "audit write failed");
        }
    }

    /// Email match wins over a username match for the same identifier.
    async fn find_by_identifier(&self, identifier: &str) -> AuthResult<Option<User>> {
        let op = AuthError::infrastructure("look up user");
        if let Some(user) = self.users.get_by_email(identifier).await.map_err(op)? {
            return Ok(Some(user));
        }
        self.users
            .get_by_username(identifier)
            .await
            .map_err(AuthError::infrastructure("look up user"))
    }

    #[instrument(skip(self, password, client))]
    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        client: &ClientInfo,
    ) -> AuthResult<Session> {
        let user = match self.find_by_identifier(identifier).await? {
            Some(user) if user.is_active => user,
            _ => {
                warn!("login for unknown identifier");
                // Same Argon2 cost as a wrong password for a real account.
                let _ =
                    verify_password_blocking(password.to_owned(), DUMMY_PASSWORD_HASH.to_owned())
                        .await;
                self.record(
                    client.tag(NewAuditEntry::new(events::LOGIN_FAILED))
                        .detail("reason", "unknown_user"),
                )
                .await;
                return Err(AuthError::InvalidCredentials);
            }
        };

        if user.is_locked(self.clock.now()) {
            warn!(user_id = %user.user_id, "login for locked account");
            self.record(
                client.tag(NewAuditEntry::new(events::LOGIN_FAILED).user(user.user_id))
                    .detail("reason", "locked"),
            )
            .await;
            return Err(AuthError::UserLocked);
        }

        let matches = self
            .users
            .verify_password(&user, password)
            .await
            .map_err(AuthError::infrastructure("verify password"))?;
        if !matches {
            self.register_failed_attempt(&user, client).await?;
            return Err(AuthError::InvalidCredentials);
        }

        let expires_at = self
            .session_expiry()
            .map_err(AuthError::infrastructure("create session"))?;
        let session = self
            .sessions
            .create(NewSession {
                user_id: user.user_id,
                token: generate_secure_token(),
                ip_address: client.ip_address.clone(),
                user_agent: client.user_agent.clone(),
                expires_at,
            })
            .await
            .map_err(AuthError::infrastructure("create session"))?;

        self.users
            .record_login(user.user_id)
            .await
            .map_err(AuthError::infrastructure("record login"))?;

        self.record(
            client
                .tag(NewAuditEntry::new(events::LOGIN).user(user.user_id))
                .detail("successful", true)
                .detail("session_id", session.session_id.to_string()),
        )
        .await;

        info!(user_id = %user.user_id, session_id = %session.session_id, "user logged in");
        Ok(session)
    }

    async fn register_failed_attempt(&self, user: &User, client: &ClientInfo) -> AuthResult<()> {
        let attempts = self
            .users
            .increment_failed_login_attempts(user.user_id)
            .await
            .map_err(AuthError::infrastructure("record failed login"))?;
        warn!(user_id = %user.user_id, attempts, "login with wrong password");
        self.record(
            client
                .tag(NewAuditEntry::new(events::LOGIN_FAILED).user(user.user_id))
                .detail("reason", "bad_password")
                .detail("failed_attempts", attempts),
        )
        .await;

        if attempts >= MAX_FAILED_LOGIN_ATTEMPTS {
            let revoked = self
                .sessions
                .invalidate_all_for_user(user.user_id)
                .await
                .map_err(AuthError::infrastructure("revoke sessions"))?;
            warn!(user_id = %user.user_id, revoked, "account locked");
            self.record(
                client
                    .tag(NewAuditEntry::new(events::ACCOUNT_LOCKED).user(user.user_id))
                    .detail("failed_attempts", attempts)
                    .detail("revoked_sessions", revoked),
            )
            .await;
        }
        Ok(())
    }

    /// Creates an active, unverified user carrying a fresh verification token.
    #[instrument(skip(self, registration, client), fields(username = %registration.username))]
    pub async fn register(&self, registration: Registration, client: &ClientInfo) -> AuthResult<User> {
        let op = "register user";
        if self
            .users
            .get_by_email(&registration.email)
            .await
            .map_err(AuthError::infrastructure(op))?
            .is_some()
        {
            return Err(AuthError::EmailAlreadyExists);
        }
        if self
            .users
            .get_by_username(&registration.username)
            .await
            .map_err(AuthError::infrastructure(op))?
            .is_some()
        {
            return Err(AuthError::UsernameAlreadyExists);
        }

        let mut new_user = NewUser::new(registration.username, registration.email)
            .named(registration.first_name, registration.last_name);
        new_user.email_verification_token = Some(generate_secure_token());
        new_user.email_verification_sent_at = Some(self.clock.now());

        // Lost race with a concurrent registration.
        let user = match self.users.create(new_user, &registration.password).await {
            Ok(user) => user,
            Err(StoreError::ConstraintViolation { constraint }) if constraint.contains("email") => {
                return Err(AuthError::EmailAlreadyExists)
            }
            Err(StoreError::ConstraintViolation { .. }) => {
                return Err(AuthError::UsernameAlreadyExists)
            }
            Err(e) => return Err(AuthError::infrastructure(op)(e)),
        };

        self.record(client.tag(NewAuditEntry::new(events::REGISTER).user(user.user_id)))
            .await;
        info!(user_id = %user.user_id, "user registered");
        Ok(user)
    }

    /// Invalidates the session holding `token`. Unknown or already invalid
    /// tokens succeed silently.
    #[instrument(skip_all)]
    pub async fn logout(&self, token: &str, client: &ClientInfo) -> AuthResult<()> {
        let op = "logout";
        let session = self
            .sessions
            .get_by_token(token)
            .await
            .map_err(AuthError::infrastructure(op))?;
        self.sessions
            .invalidate(token)
            .await
            .map_err(AuthError::infrastructure(op))?;

        if let Some(session) = session.filter(|s| s.is_valid) {
            self.record(
                client
                    .tag(NewAuditEntry::new(events::LOGOUT).user(session.user_id))
                    .detail("session_id", session.session_id.to_string()),
            )
            .await;
            info!(user_id = %session.user_id, session_id = %session.session_id, "user logged out");
        }
        Ok(())
    }

    /// Resolves a bearer token to its session and owner.
    #[instrument(skip_all)]
    pub async fn validate_session(&self, token: &str) -> AuthResult<(Session, User)> {
        let session = self
            .sessions
            .get_by_token(token)
            .await
            .map_err(AuthError::infrastructure("look up session"))?
            .filter(|s| s.is_usable(self.clock.now()))
            .ok_or(AuthError::InvalidToken)?;

        let user = self
            .users
            .get_by_id(session.user_id)
            .await
            .map_err(AuthError::infrastructure("look up session owner"))?
            .filter(|u| u.is_active)
            .ok_or(AuthError::UserNotFound)?;

        if let Err(e) = self.sessions.update_last_active_at(session.session_id).await {
            warn!(error = %e, session_id = %session.session_id, "failed to touch session");
        }
        Ok((session, user))
    }

    #[instrument(skip_all)]
    pub async fn verify_email(&self, token: &str, client: &ClientInfo) -> AuthResult<Uuid> {
        let user_id = self
            .users
            .verify_email(token)
            .await
            .map_err(AuthError::infrastructure("verify email"))?
            .ok_or(AuthError::InvalidToken)?;

        self.record(client.tag(NewAuditEntry::new(events::EMAIL_VERIFIED).user(user_id)))
            .await;
        info!(user_id = %user_id, "email verified");
        Ok(user_id)
    }

    /// Issues a reset token valid for 24 hours. Unknown emails yield `None`
    /// so callers can answer identically either way.
    #[instrument(skip(self, client))]
    pub async fn forgot_password(
        &self,
        email: &str,
        client: &ClientInfo,
    ) -> AuthResult<Option<PasswordResetTicket>> {
        let op = "request password reset";
        let Some(user) = self
            .users
            .get_by_email(email)
            .await
            .map_err(AuthError::infrastructure(op))?
        else {
            return Ok(None);
        };

        let token = generate_secure_token();
        self.users
            .set_password_reset_token(user.user_id, &token, self.clock.now() + PASSWORD_RESET_TTL)
            .await
            .map_err(AuthError::infrastructure(op))?;

        self.record(
            client.tag(NewAuditEntry::new(events::PASSWORD_RESET_REQUESTED).user(user.user_id)),
        )
        .await;
        Ok(Some(PasswordResetTicket { user, token }))
    }

    /// Consumes a reset token, sets the new password and revokes every
    /// standing session of the owner.
    #[instrument(skip_all)]
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
        client: &ClientInfo,
    ) -> AuthResult<()> {
        let user_id = self
            .users
            .reset_password(token, new_password)
            .await
            .map_err(AuthError::infrastructure("reset password"))?
            .ok_or(AuthError::InvalidToken)?;

        let revoked = self
            .sessions
            .invalidate_all_for_user(user_id)
            .await
            .map_err(AuthError::infrastructure("revoke sessions"))?;

        self.record(
            client
                .tag(NewAuditEntry::new(events::PASSWORD_RESET).user(user_id))
                .detail("revoked_sessions", revoked),
        )
        .await;
        info!(user_id = %user_id, revoked, "password reset");
        Ok(())
    }

    #[instrument(skip(self, current_password, new_password, client))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
        client: &ClientInfo,
    ) -> AuthResult<()> {
        let op = "change password";
        let user = self
            .users
            .get_by_id(user_id)
            .await
            .map_err(AuthError::infrastructure(op))?
            .ok_or(AuthError::UserNotFound)?;

        let matches = self
            .users
            .verify_password(&user, current_password)
            .await
            .map_err(AuthError::infrastructure(op))?;
        if !matches {
            return Err(AuthError::InvalidCredentials);
        }

        self.users
            .update_password(user_id, new_password)
            .await
            .map_err(AuthError::infrastructure(op))?;
        let revoked = self
            .sessions
            .invalidate_all_for_user(user_id)
            .await
            .map_err(AuthError::infrastructure("revoke sessions"))?;

        self.record(
            client
                .tag(NewAuditEntry::new(events::PASSWORD_CHANGED).user(user_id))
                .detail("revoked_sessions", revoked),
        )
        .await;
        info!(user_id = %user_id, revoked, "password changed");
        Ok(())
    }

    /// Sessions of `user_id`, newest first, including invalidated ones.
    pub async fn list_sessions(&self, user_id: Uuid) -> AuthResult<Vec<Session>> {
        self.sessions
            .get_all_by_user_id(user_id)
            .await
            .map_err(AuthError::infrastructure("list sessions"))
    }

    /// "Log out everywhere". Returns how many sessions were still valid.
    #[instrument(skip(self, client))]
    pub async fn revoke_all_sessions(&self, user_id: Uuid, client: &ClientInfo) -> AuthResult<u64> {
        let revoked = self
            .sessions
            .invalidate_all_for_user(user_id)
            .await
            .map_err(AuthError::infrastructure("revoke sessions"))?;
        self.record(
            client
                .tag(NewAuditEntry::new(events::SESSIONS_REVOKED).user(user_id))
                .detail("revoked_sessions", revoked),
        )
        .await;
        Ok(revoked)
    }

    pub async fn audit_trail(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> AuthResult<Vec<AuditEntry>> {
        self.audit
            .get_by_user_id(user_id, limit, offset)
            .await
            .map_err(AuthError::infrastructure("read audit trail"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AppConfig;
    use crate::memory::{MemoryDb, MemorySessionStore};
    use crate::users::LOCKOUT_DURATION;
    use async_trait::async_trait;
    use time::macros::datetime;
    use time::OffsetDateTime;

    struct Harness {
        clock: Arc<ManualClock>,
        db: MemoryDb,
        service: AuthService,
    }

    fn harness() -> Harness {
        let db_clock = Arc::new(ManualClock::new(datetime!(2024-05-01 12:00 UTC)));
        let db = MemoryDb::with_clock(db_clock.clone());
        let service = AuthService::new(
            Arc::new(db.user_store()),
            Arc::new(db.session_store()),
            Arc::new(db.audit_store()),
            db_clock.clone(),
            AppConfig::for_tests().auth,
        );
        Harness {
            clock: db_clock,
            db,
            service,
        }
    }

    fn alice() -> Registration {
        Registration {
            username: "alice".into(),
            email: "alice@example.com".into(),
            password: "Secret123!".into(),
            first_name: "Alice".into(),
            last_name: "Liddell".into(),
        }
    }

    fn client() -> ClientInfo {
        ClientInfo {
            ip_address: Some("10.0.0.7".into()),
            user_agent: Some("tests/1.0".into()),
        }
    }

    async fn audit_events(h: &Harness, user_id: Uuid) -> Vec<String> {
        h.db.audit_store()
            .get_by_user_id(user_id, 100, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn alice_lockout_scenario() {
        let h = harness();
        let user = h.service.register(alice(), &client()).await.unwrap();
        assert!(user.is_active);
        assert!(!user.is_email_verified);
        assert!(user.email_verification_token.is_some());
        assert_eq!(user.email_verification_sent_at, Some(h.clock.now()));

        for _ in 0..MAX_FAILED_LOGIN_ATTEMPTS {
            let err = h
                .service
                .login("alice", "WrongPassword", &client())
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials));
        }
        let locked_at = h.clock.now();

        let err = h.service.login("alice", "Secret123!", &client()).await.unwrap_err();
        assert!(matches!(err, AuthError::UserLocked));

        h.clock.set(locked_at + LOCKOUT_DURATION - time::Duration::seconds(1));
        let err = h.service.login("alice", "Secret123!", &client()).await.unwrap_err();
        assert!(matches!(err, AuthError::UserLocked));

        h.clock.set(locked_at + time::Duration::minutes(31));
        let session = h.service.login("alice", "Secret123!", &client()).await.unwrap();
        assert_eq!(session.user_id, user.user_id);
        assert_eq!(session.expires_at, h.clock.now() + time::Duration::minutes(60));
        assert_eq!(session.ip_address.as_deref(), Some("10.0.0.7"));
        assert_eq!(session.user_agent.as_deref(), Some("tests/1.0"));

        let stored = h.db.user_store().get_by_id(user.user_id).await.unwrap().unwrap();
        assert_eq!(stored.failed_login_attempts, 0);
        assert!(stored.locked_until.is_none());
        assert_eq!(stored.last_login_at, Some(h.clock.now()));

        let trail = audit_events(&h, user.user_id).await;
        assert_eq!(trail[0], events::LOGIN);
        assert!(trail.iter().any(|e| e == events::ACCOUNT_LOCKED));
        assert_eq!(
            trail.iter().filter(|e| *e == events::LOGIN_FAILED).count(),
            MAX_FAILED_LOGIN_ATTEMPTS as usize + 2
        );
    }

    #[tokio::test]
    async fn successful_login_audits_with_client_details() {
        let h = harness();
        let user = h.service.register(alice(), &client()).await.unwrap();
        let session = h
            .service
            .login("alice@example.com", "Secret123!", &client())
            .await
            .unwrap();

        let entries = h.service.audit_trail(user.user_id, 10, 0).await.unwrap();
        let login = &entries[0];
        assert_eq!(login.event_type, events::LOGIN);
        assert_eq!(login.details["successful"], serde_json::Value::Bool(true));
        assert_eq!(login.details["session_id"], session.session_id.to_string());
        assert_eq!(login.ip_address.as_deref(), Some("10.0.0.7"));
    }

    #[tokio::test]
    async fn unknown_identifier_is_invalid_credentials() {
        let h = harness();
        let err = h.service.login("nobody", "whatever", &client()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn inactive_user_cannot_log_in() {
        let h = harness();
        let user = h.service.register(alice(), &client()).await.unwrap();
        let mut disabled = user.clone();
        disabled.is_active = false;
        h.db.user_store().update(&disabled).await.unwrap();

        let err = h.service.login("alice", "Secret123!", &client()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn email_match_takes_precedence_over_username() {
        let h = harness();
        let users = h.db.user_store();
        // A username that looks like someone else's email.
        users
            .create(NewUser::new("bob@example.com", "mallory@example.com"), "MalloryPass1")
            .await
            .unwrap();
        let bob = users
            .create(NewUser::new("bob", "bob@example.com"), "BobPass123")
            .await
            .unwrap();

        let session = h
            .service
            .login("bob@example.com", "BobPass123", &client())
            .await
            .unwrap();
        assert_eq!(session.user_id, bob.user_id);

        let err = h
            .service
            .login("bob@example.com", "MalloryPass1", &client())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn duplicate_registrations_are_rejected() {
        let h = harness();
        h.service.register(alice(), &client()).await.unwrap();

        let mut same_email = alice();
        same_email.username = "alice2".into();
        assert!(matches!(
            h.service.register(same_email, &client()).await.unwrap_err(),
            AuthError::EmailAlreadyExists
        ));

        let mut same_name = alice();
        same_name.email = "alice2@example.com".into();
        assert!(matches!(
            h.service.register(same_name, &client()).await.unwrap_err(),
            AuthError::UsernameAlreadyExists
        ));

        // Both taken: the email is reported.
        assert!(matches!(
            h.service.register(alice(), &client()).await.unwrap_err(),
            AuthError::EmailAlreadyExists
        ));
    }

    #[tokio::test]
    async fn session_expiry_boundary() {
        let h = harness();
        h.service.register(alice(), &client()).await.unwrap();
        let session = h.service.login("alice", "Secret123!", &client()).await.unwrap();
        let expires_at = session.expires_at;

        h.clock.set(expires_at - time::Duration::seconds(1));
        let (found, user) = h.service.validate_session(&session.token).await.unwrap();
        assert_eq!(found.session_id, session.session_id);
        assert_eq!(user.username, "alice");
        let touched = h
            .db
            .session_store()
            .get_by_id(session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(touched.last_active_at, h.clock.now());

        h.clock.set(expires_at + time::Duration::seconds(1));
        assert!(matches!(
            h.service.validate_session(&session.token).await.unwrap_err(),
            AuthError::InvalidToken
        ));
    }

    #[tokio::test]
    async fn validate_rejects_unknown_token_and_missing_owner() {
        let h = harness();
        assert!(matches!(
            h.service.validate_session("no-such-token").await.unwrap_err(),
            AuthError::InvalidToken
        ));

        let user = h.service.register(alice(), &client()).await.unwrap();
        let session = h.service.login("alice", "Secret123!", &client()).await.unwrap();
        let mut disabled = user.clone();
        disabled.is_active = false;
        h.db.user_store().update(&disabled).await.unwrap();
        assert!(matches!(
            h.service.validate_session(&session.token).await.unwrap_err(),
            AuthError::UserNotFound
        ));
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let h = harness();
        let user = h.service.register(alice(), &client()).await.unwrap();
        let session = h.service.login("alice", "Secret123!", &client()).await.unwrap();

        h.service.logout(&session.token, &client()).await.unwrap();
        h.service.logout(&session.token, &client()).await.unwrap();
        h.service.logout("never-issued", &client()).await.unwrap();

        assert!(matches!(
            h.service.validate_session(&session.token).await.unwrap_err(),
            AuthError::InvalidToken
        ));
        let trail = audit_events(&h, user.user_id).await;
        assert_eq!(trail.iter().filter(|e| *e == events::LOGOUT).count(), 1);
    }

    #[tokio::test]
    async fn password_reset_scenario() {
        let h = harness();
        let user = h.service.register(alice(), &client()).await.unwrap();
        let standing = h.service.login("alice", "Secret123!", &client()).await.unwrap();

        let ticket = h
            .service
            .forgot_password("alice@example.com", &client())
            .await
            .unwrap()
            .expect("known email issues a token");
        assert_eq!(ticket.user.user_id, user.user_id);
        let stored = h.db.user_store().get_by_id(user.user_id).await.unwrap().unwrap();
        assert_eq!(
            stored.password_reset_expires_at,
            Some(h.clock.now() + PASSWORD_RESET_TTL)
        );

        h.service
            .reset_password(&ticket.token, "NewPass456!", &client())
            .await
            .unwrap();

        assert!(matches!(
            h.service.login("alice", "Secret123!", &client()).await.unwrap_err(),
            AuthError::InvalidCredentials
        ));
        h.service.login("alice", "NewPass456!", &client()).await.unwrap();

        assert!(matches!(
            h.service.validate_session(&standing.token).await.unwrap_err(),
            AuthError::InvalidToken
        ));
        assert!(matches!(
            h.service
                .reset_password(&ticket.token, "Another789!", &client())
                .await
                .unwrap_err(),
            AuthError::InvalidToken
        ));
    }

    #[tokio::test]
    async fn forgot_password_for_unknown_email_is_silent() {
        let h = harness();
        let ticket = h
            .service
            .forgot_password("ghost@example.com", &client())
            .await
            .unwrap();
        assert!(ticket.is_none());
    }

    #[tokio::test]
    async fn expired_reset_token_is_rejected() {
        let h = harness();
        h.service.register(alice(), &client()).await.unwrap();
        let ticket = h
            .service
            .forgot_password("alice@example.com", &client())
            .await
            .unwrap()
            .unwrap();

        h.clock.advance(PASSWORD_RESET_TTL + time::Duration::seconds(1));
        assert!(matches!(
            h.service
                .reset_password(&ticket.token, "NewPass456!", &client())
                .await
                .unwrap_err(),
            AuthError::InvalidToken
        ));
    }

    #[tokio::test]
    async fn reset_password_lifts_lockout() {
        let h = harness();
        h.service.register(alice(), &client()).await.unwrap();
        for _ in 0..MAX_FAILED_LOGIN_ATTEMPTS {
            let _ = h.service.login("alice", "nope-nope", &client()).await;
        }
        let ticket = h
            .service
            .forgot_password("alice@example.com", &client())
            .await
            .unwrap()
            .unwrap();
        h.service
            .reset_password(&ticket.token, "NewPass456!", &client())
            .await
            .unwrap();

        h.service.login("alice", "NewPass456!", &client()).await.unwrap();
    }

    #[tokio::test]
    async fn verify_email_consumes_token() {
        let h = harness();
        let user = h.service.register(alice(), &client()).await.unwrap();
        let token = user.email_verification_token.clone().unwrap();

        assert_eq!(h.service.verify_email(&token, &client()).await.unwrap(), user.user_id);
        let stored = h.db.user_store().get_by_id(user.user_id).await.unwrap().unwrap();
        assert!(stored.is_email_verified);
        assert!(stored.email_verification_token.is_none());

        assert!(matches!(
            h.service.verify_email(&token, &client()).await.unwrap_err(),
            AuthError::InvalidToken
        ));
    }

    #[tokio::test]
    async fn change_password_requires_current_and_revokes_sessions() {
        let h = harness();
        let user = h.service.register(alice(), &client()).await.unwrap();
        let session = h.service.login("alice", "Secret123!", &client()).await.unwrap();

        assert!(matches!(
            h.service
                .change_password(user.user_id, "not-it", "NewPass456!", &client())
                .await
                .unwrap_err(),
            AuthError::InvalidCredentials
        ));
        h.service.validate_session(&session.token).await.unwrap();

        h.service
            .change_password(user.user_id, "Secret123!", "NewPass456!", &client())
            .await
            .unwrap();
        assert!(matches!(
            h.service.validate_session(&session.token).await.unwrap_err(),
            AuthError::InvalidToken
        ));
        h.service.login("alice", "NewPass456!", &client()).await.unwrap();

        assert!(matches!(
            h.service
                .change_password(Uuid::new_v4(), "x", "y", &client())
                .await
                .unwrap_err(),
            AuthError::UserNotFound
        ));
    }

    #[tokio::test]
    async fn lockout_revokes_standing_sessions() {
        let h = harness();
        h.service.register(alice(), &client()).await.unwrap();
        let session = h.service.login("alice", "Secret123!", &client()).await.unwrap();

        for _ in 0..MAX_FAILED_LOGIN_ATTEMPTS {
            let _ = h.service.login("alice", "nope-nope", &client()).await;
        }
        assert!(matches!(
            h.service.validate_session(&session.token).await.unwrap_err(),
            AuthError::InvalidToken
        ));
    }

    #[tokio::test]
    async fn concurrent_failed_logins_all_count() {
        let h = Arc::new(harness());
        let user = h.service.register(alice(), &client()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..MAX_FAILED_LOGIN_ATTEMPTS {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                h.service.login("alice", "WrongPassword", &client()).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_err());
        }

        let stored = h.db.user_store().get_by_id(user.user_id).await.unwrap().unwrap();
        assert_eq!(stored.failed_login_attempts, MAX_FAILED_LOGIN_ATTEMPTS);
        assert!(stored.is_locked(h.clock.now()));
    }

    #[tokio::test]
    async fn revoke_all_and_list_sessions() {
        let h = harness();
        let user = h.service.register(alice(), &client()).await.unwrap();
        let first = h.service.login("alice", "Secret123!", &client()).await.unwrap();
        h.clock.advance(time::Duration::seconds(5));
        let second = h.service.login("alice", "Secret123!", &client()).await.unwrap();

        let listed = h.service.list_sessions(user.user_id).await.unwrap();
        assert_eq!(
            listed.iter().map(|s| s.session_id).collect::<Vec<_>>(),
            [second.session_id, first.session_id]
        );

        assert_eq!(h.service.revoke_all_sessions(user.user_id, &client()).await.unwrap(), 2);
        assert_eq!(h.service.revoke_all_sessions(user.user_id, &client()).await.unwrap(), 0);
        assert!(h.service.validate_session(&second.token).await.is_err());
    }

    struct FailingAudit;

    #[async_trait]
    impl AuditStore for FailingAudit {
        async fn create(&self, _: NewAuditEntry) -> Result<AuditEntry, StoreError> {
            Err(StoreError::NotFound)
        }
        async fn get_by_id(&self, _: Uuid) -> Result<Option<AuditEntry>, StoreError> {
            Ok(None)
        }
        async fn get_by_user_id(&self, _: Uuid, _: i64, _: i64) -> Result<Vec<AuditEntry>, StoreError> {
            Ok(Vec::new())
        }
        async fn get_by_event_type(&self, _: &str, _: i64, _: i64) -> Result<Vec<AuditEntry>, StoreError> {
            Ok(Vec::new())
        }
        async fn list(&self, _: i64, _: i64) -> Result<Vec<AuditEntry>, StoreError> {
            Ok(Vec::new())
        }
        async fn count(&self) -> Result<i64, StoreError> {
            Ok(0)
        }
        async fn delete_older_than(&self, _: OffsetDateTime) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn audit_failure_does_not_fail_login() {
        let db = MemoryDb::new();
        let service = AuthService::new(
            Arc::new(db.user_store()),
            Arc::new(db.session_store()),
            Arc::new(FailingAudit),
            Arc::new(crate::clock::SystemClock),
            AppConfig::for_tests().auth,
        );
        service.register(alice(), &client()).await.unwrap();
        let session = service.login("alice", "Secret123!", &client()).await.unwrap();
        service.validate_session(&session.token).await.unwrap();
        service.logout(&session.token, &client()).await.unwrap();
    }

    /// Delegates to the in-memory store but cannot touch `last_active_at`.
    struct FailingTouch(MemorySessionStore);

    #[async_trait]
    impl SessionStore for FailingTouch {
        async fn create(&self, session: NewSession) -> Result<Session, StoreError> {
            self.0.create(session).await
        }
        async fn get_by_id(&self, session_id: Uuid) -> Result<Option<Session>, StoreError> {
            self.0.get_by_id(session_id).await
        }
        async fn get_by_token(&self, token: &str) -> Result<Option<Session>, StoreError> {
            self.0.get_by_token(token).await
        }
        async fn get_all_by_user_id(&self, user_id: Uuid) -> Result<Vec<Session>, StoreError> {
            self.0.get_all_by_user_id(user_id).await
        }
        async fn invalidate(&self, token: &str) -> Result<(), StoreError> {
            self.0.invalidate(token).await
        }
        async fn invalidate_all_for_user(&self, user_id: Uuid) -> Result<u64, StoreError> {
            self.0.invalidate_all_for_user(user_id).await
        }
        async fn update_last_active_at(&self, _: Uuid) -> Result<(), StoreError> {
            Err(StoreError::NotFound)
        }
        async fn delete_expired_sessions(&self) -> Result<u64, StoreError> {
            self.0.delete_expired_sessions().await
        }
        async fn delete_by_id(&self, session_id: Uuid) -> Result<(), StoreError> {
            self.0.delete_by_id(session_id).await
        }
    }

    #[tokio::test]
    async fn touch_failure_does_not_fail_validation() {
        let db = MemoryDb::new();
        let service = AuthService::new(
            Arc::new(db.user_store()),
            Arc::new(FailingTouch(db.session_store())),
            Arc::new(db.audit_store()),
            Arc::new(crate::clock::SystemClock),
            AppConfig::for_tests().auth,
        );
        let user = service.register(alice(), &client()).await.unwrap();
        let session = service.login("alice", "Secret123!", &client()).await.unwrap();

        let (validated, owner) = service.validate_session(&session.token).await.unwrap();
        assert_eq!(validated.session_id, session.session_id);
        assert_eq!(owner.user_id, user.user_id);
        assert_eq!(validated.last_active_at, session.last_active_at);
    }

    #[tokio::test]
    async fn oversized_session_ttl_fails_login_cleanly() {
        let db = MemoryDb::new();
        let mut config = AppConfig::for_tests().auth;
        config.session_ttl_minutes = 9_000_000_000;
        let service = AuthService::new(
            Arc::new(db.user_store()),
            Arc::new(db.session_store()),
            Arc::new(db.audit_store()),
            Arc::new(crate::clock::SystemClock),
            config,
        );
        let user = service.register(alice(), &client()).await.unwrap();

        let err = service.login("alice", "Secret123!", &client()).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Infrastructure { source: StoreError::TimeOverflow(_), .. }
        ));
        assert!(service.list_sessions(user.user_id).await.unwrap().is_empty());
    }
}
