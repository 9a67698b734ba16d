use anyhow::{Context, Result};
use sqlx::{Pool, Sqlite};

/// Create all engine tables. Every statement is idempotent so this can run
/// on every startup.
pub async fn create_tables(pool: &Pool<Sqlite>) -> Result<()> {
    // Conversation history, one row per message, scoped by persona.
    // Rows are append-only except for the is_read / concept_processed /
    // state flag columns.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            persona TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('human', 'system')),
            content TEXT NOT NULL,
            timestamp DATETIME NOT NULL,
            is_read INTEGER NOT NULL DEFAULT 1,
            concept_processed INTEGER NOT NULL DEFAULT 0,
            state TEXT,
            metadata TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create messages table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_messages_persona_timestamp
        ON messages(persona, timestamp)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create messages index")?;

    // Entity buckets. `entity` is 'human' or a persona name; facts and
    // people exist only on the human entity. Names are unique per entity,
    // case-insensitively.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS facts (
            id TEXT PRIMARY KEY,
            entity TEXT NOT NULL,
            name TEXT NOT NULL COLLATE NOCASE,
            description TEXT NOT NULL DEFAULT '',
            sentiment REAL NOT NULL DEFAULT 0.0,
            confidence REAL NOT NULL DEFAULT 0.5,
            last_confirmed DATETIME,
            persona_groups TEXT NOT NULL DEFAULT '[]',
            learned_by TEXT,
            UNIQUE(entity, name)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create facts table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS traits (
            id TEXT PRIMARY KEY,
            entity TEXT NOT NULL,
            name TEXT NOT NULL COLLATE NOCASE,
            description TEXT NOT NULL DEFAULT '',
            sentiment REAL NOT NULL DEFAULT 0.0,
            strength REAL NOT NULL DEFAULT 0.5,
            persona_groups TEXT NOT NULL DEFAULT '[]',
            learned_by TEXT,
            UNIQUE(entity, name)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create traits table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS topics (
            id TEXT PRIMARY KEY,
            entity TEXT NOT NULL,
            name TEXT NOT NULL COLLATE NOCASE,
            description TEXT NOT NULL DEFAULT '',
            sentiment REAL NOT NULL DEFAULT 0.0,
            level_current REAL NOT NULL DEFAULT 0.5,
            level_ideal REAL NOT NULL DEFAULT 0.5,
            last_updated DATETIME NOT NULL,
            persona_groups TEXT NOT NULL DEFAULT '[]',
            learned_by TEXT,
            UNIQUE(entity, name)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create topics table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS people (
            id TEXT PRIMARY KEY,
            entity TEXT NOT NULL,
            name TEXT NOT NULL COLLATE NOCASE,
            relationship TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            sentiment REAL NOT NULL DEFAULT 0.0,
            level_current REAL NOT NULL DEFAULT 0.5,
            level_ideal REAL NOT NULL DEFAULT 0.5,
            last_updated DATETIME NOT NULL,
            persona_groups TEXT NOT NULL DEFAULT '[]',
            learned_by TEXT,
            UNIQUE(entity, name)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create people table")?;

    // Persistent LLM task queue. Dequeue order is priority then created_at
    // then insertion order.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_items (
            id TEXT PRIMARY KEY,
            task_type TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 1,
            created_at DATETIME NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_attempt DATETIME,
            payload TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create queue_items table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_queue_items_order
        ON queue_items(priority, created_at)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create queue_items index")?;

    // Extraction frequency counters, per (entity, persona, data_type).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extraction_state (
            entity TEXT NOT NULL,
            persona TEXT NOT NULL,
            data_type TEXT NOT NULL,
            last_extraction DATETIME,
            messages_since_last_extract INTEGER NOT NULL DEFAULT 0,
            total_extractions INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (entity, persona, data_type)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create extraction_state table")?;

    // Small key/value store for engine bookkeeping: queue last_processed,
    // ceremony date, pending ceremony validation ids.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create meta table")?;

    tracing::debug!("Database tables created successfully");

    Ok(())
}

/// Read a bookkeeping value.
pub async fn get_meta(pool: &Pool<Sqlite>, key: &str) -> Result<Option<String>> {
    let value: Option<(String,)> = sqlx::query_as("SELECT value FROM meta WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("Failed to read meta value")?;
    Ok(value.map(|(v,)| v))
}

/// Write a bookkeeping value.
pub async fn set_meta(pool: &Pool<Sqlite>, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO meta (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(chrono::Utc::now())
    .execute(pool)
    .await
    .context("Failed to write meta value")?;
    Ok(())
}

/// Delete a bookkeeping value.
pub async fn delete_meta(pool: &Pool<Sqlite>, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM meta WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await
        .context("Failed to delete meta value")?;
    Ok(())
}
