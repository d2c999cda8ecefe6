pub mod cache;
pub mod catalog;
pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use services::notifier::{LifecycleNotifier, LogSink, NotificationSink, RedisStreamSink};
use services::payment::PaymentGatewayClient;
use services::reservation::ReservationEngine;
use services::users::UserDirectory;
use store::postgres::PgCoordinator;

pub type Engine = ReservationEngine<PgCoordinator>;

// Shared state for the whole application
#[derive(Clone)]
pub struct AppState {
    pub users: UserDirectory,
    pub engine: Arc<Engine>,
}

impl AppState {
    /// Connects every backend and starts the notification worker.
    pub async fn new(config: &config::Config) -> anyhow::Result<(Arc<Self>, JoinHandle<()>)> {
        let db = database::Database::new(&config.database).await?;
        db.run_migrations().await?;
        info!("Database connected");

        let sink: Arc<dyn NotificationSink> = match config.notifier.sink.as_str() {
            "log" => Arc::new(LogSink),
            _ => {
                let sink = RedisStreamSink::connect(&config.redis.url, config.notifier.stream_maxlen).await?;
                info!("Redis connected");
                Arc::new(sink)
            }
        };
        let (notifier, worker) = LifecycleNotifier::spawn(sink, &config.notifier);

        let users = UserDirectory::new(db.pool.clone(), &config.cache);
        let gateway = PaymentGatewayClient::from_config(&config.payment, &config.circuit_breaker)?;
        let coordinator = PgCoordinator::new(db.pool.clone())
            .with_lock_timeout(Duration::from_millis(config.database.lock_timeout_ms));

        let engine = ReservationEngine::new(
            coordinator,
            Arc::new(catalog::PgEventCatalog::new(db.pool.clone())),
            Arc::new(users.clone()),
            Arc::new(gateway),
            notifier,
            &config.engine,
        );

        let state = Arc::new(Self { users, engine: Arc::new(engine) });
        Ok((state, worker))
    }
}
