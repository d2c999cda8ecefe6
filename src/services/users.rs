use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::BoundedCache;
use crate::config::CacheConfig;
use crate::error::StoreResult;
use crate::models::User;

const USER_COLUMNS: &str = "user_id, email, password_plain, first_name, surname, is_active, registered_at";

#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn get_user(&self, user_id: i32) -> StoreResult<Option<User>>;
}

/// Cache-fronted access to the users table.
#[derive(Clone)]
pub struct UserDirectory {
    pool: PgPool,
    by_id: Arc<BoundedCache<i32, User>>,
    by_email: Arc<BoundedCache<String, User>>,
}

impl UserDirectory {
    pub fn new(pool: PgPool, config: &CacheConfig) -> Self {
        let ttl = Duration::from_secs(config.user_ttl_secs);
        Self {
            pool,
            by_id: Arc::new(BoundedCache::new(config.user_capacity, ttl)),
            by_email: Arc::new(BoundedCache::new(config.user_capacity, ttl)),
        }
    }

    fn remember(&self, user: &User) {
        self.by_id.insert(user.user_id, user.clone());
        self.by_email.insert(user.email.clone(), user.clone());
    }

    pub async fn get_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        if let Some(user) = self.by_email.get(&email.to_string()) {
            return Ok(Some(user));
        }

        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1 AND is_active = true"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(user) = &user {
            self.remember(user);
        }
        Ok(user)
    }

    /// Basic-auth check against the plain-text fixture passwords.
    pub async fn authenticate(&self, email: &str, password: &str) -> StoreResult<Option<User>> {
        let Some(user) = self.get_by_email(email).await? else {
            debug!("unknown user {}", email);
            return Ok(None);
        };

        if !user.is_active || !user.verify_password(password) {
            return Ok(None);
        }

        if let Err(e) = sqlx::query("UPDATE users SET last_logged_in = NOW() WHERE user_id = $1")
            .bind(user.user_id)
            .execute(&self.pool)
            .await
        {
            warn!("failed to record login for user {}: {}", user.user_id, e);
        }

        Ok(Some(user))
    }
}

#[async_trait]
impl UserLookup for UserDirectory {
    async fn get_user(&self, user_id: i32) -> StoreResult<Option<User>> {
        if let Some(user) = self.by_id.get(&user_id) {
            return Ok(Some(user));
        }

        let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = $1"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(user) = &user {
            self.remember(user);
        }
        Ok(user)
    }
}
