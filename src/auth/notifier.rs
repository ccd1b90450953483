use async_trait::async_trait;
use tracing::info;

use crate::users::User;

/// Out-of-band delivery of verification and reset tokens.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_email_verification(&self, user: &User, token: &str) -> anyhow::Result<()>;

    async fn send_password_reset(&self, user: &User, token: &str) -> anyhow::Result<()>;
}

/// Writes one structured log line per dispatch instead of sending mail.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_email_verification(&self, user: &User, token: &str) -> anyhow::Result<()> {
        info!(
            user_id = %user.user_id,
            email = %user.email,
            token_len = token.len(),
            "email verification dispatched"
        );
        Ok(())
    }

    async fn send_password_reset(&self, user: &User, token: &str) -> anyhow::Result<()> {
        info!(
            user_id = %user.user_id,
            email = %user.email,
            token_len = token.len(),
            "password reset dispatched"
        );
        Ok(())
    }
}
