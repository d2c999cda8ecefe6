use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::StoreResult;
use crate::models::Event;

/// Read-only event lookup, consulted before a booking is opened.
#[async_trait]
pub trait EventCatalog: Send + Sync {
    async fn get_event(&self, event_id: i64) -> StoreResult<Option<Event>>;
}

#[derive(Clone)]
pub struct PgEventCatalog {
    pool: PgPool,
}

impl PgEventCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventCatalog for PgEventCatalog {
    async fn get_event(&self, event_id: i64) -> StoreResult<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(
            "SELECT id, title, description, type, datetime_start, provider FROM events WHERE id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }
}
