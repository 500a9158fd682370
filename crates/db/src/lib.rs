pub mod migrate;
pub mod repo;

use recast_core::JobState;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("cannot encode transcode plan: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job {job_id}: transition {from} -> {to} is not allowed")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },
    /// The row moved on between read and write, or another worker now holds
    /// the claim.
    #[error("job {job_id} is no longer {expected}")]
    Conflict { job_id: String, expected: JobState },
    #[error("job {job_id} has an unreadable {column}: {detail}")]
    CorruptRow {
        job_id: String,
        column: &'static str,
        detail: String,
    },
}

/// Create a SQLite connection pool with WAL mode enabled.
pub async fn connect(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let opts = SqliteConnectOptions::from_str(db_path)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    Ok(pool)
}

/// Connect and bring the schema up to date.
pub async fn open(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = connect(db_path).await?;
    migrate::run(&pool).await?;
    Ok(pool)
}
