pub mod schema;

use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Pool, Sqlite,
};
use std::path::Path;

/// Open (creating if necessary) the engine database at the given path
/// and run the idempotent schema migrations.
pub async fn init_database(db_path: &Path) -> Result<Pool<Sqlite>> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options)
        .await
        .context("Failed to connect to database")?;

    schema::create_tables(&pool).await?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(pool)
}

/// In-memory database for tests.
pub async fn init_memory_database() -> Result<Pool<Sqlite>> {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .context("Failed to create in-memory database")?;
    schema::create_tables(&pool).await?;
    Ok(pool)
}
