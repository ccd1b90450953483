use tracing::{info, instrument};

use super::{NewUser, User, UserStore};
use crate::config::AdminConfig;
use crate::error::StoreResult;

/// Creates the configured administrator unless a user with that email exists.
/// Returns the new account, or `None` when nothing had to be created.
#[instrument(skip(users, admin), fields(email = %admin.email))]
pub async fn ensure_admin_user(users: &dyn UserStore, admin: &AdminConfig) -> StoreResult<Option<User>> {
    let email = admin.email.trim().to_lowercase();
    if users.get_by_email(&email).await?.is_some() {
        return Ok(None);
    }

    let mut new_admin = NewUser::new(admin.username.trim(), email).named("Admin", "User");
    new_admin.is_email_verified = true;

    let user = users.create(new_admin, &admin.password).await?;
    info!(user_id = %user.user_id, "admin user created");
    Ok(Some(user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::memory::MemoryDb;

    #[tokio::test]
    async fn creates_admin_once() {
        let db = MemoryDb::new();
        let users = db.user_store();
        let admin = AppConfig::for_tests().admin;

        let created = ensure_admin_user(&users, &admin).await.unwrap();
        let created = created.expect("first run creates the admin");
        assert_eq!(created.username, "admin");
        assert!(created.is_email_verified);
        assert!(created.is_active);
        assert!(users.verify_password(&created, &admin.password).await.unwrap());

        let again = ensure_admin_user(&users, &admin).await.unwrap();
        assert!(again.is_none());
        assert_eq!(users.count().await.unwrap(), 1);
    }
}
