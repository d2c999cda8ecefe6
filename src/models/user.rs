use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub user_id: i32,
    pub email: String,
    #[serde(skip)]
    pub password_plain: Option<String>, // For testing only
    pub first_name: String,
    pub surname: String,
    pub is_active: bool,
    pub registered_at: DateTime<Utc>,
}

impl User {
    // Plain-text comparison, the load-test fixtures ship without hashes
    pub fn verify_password(&self, password: &str) -> bool {
        self.password_plain.as_deref() == Some(password)
    }
}
