use thiserror::Error;
use tokio_cron_scheduler::JobSchedulerError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("notification delivery failed: {0}")]
    Notification(#[from] serenity::Error),

    #[error("scheduler error: {0}")]
    Schedule(#[from] JobSchedulerError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("voice event worker is no longer running")]
    WorkerClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
