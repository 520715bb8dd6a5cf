use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("core error: {0}")]
    Core(#[from] pvwatch_core::PvError),

    #[error("alarm not found: {0}")]
    AlarmNotFound(Uuid),

    #[error("alarm already open for {0}")]
    AlarmAlreadyOpen(String),

    #[error("alarm {0} is already closed")]
    AlarmClosed(Uuid),

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("{0}")]
    Other(String),
}
