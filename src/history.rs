//! Per-persona conversation history.
//!
//! Messages are append-only; the only in-place mutations allowed are the
//! `is_read`, `concept_processed`, and `state` flag columns. Timestamps are
//! strictly monotonic within a persona so the observable message sequence
//! has a total order.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

/// Sentinel content marking an absolute conversation boundary. History
/// loads never reach past the most recent sentinel.
pub const CONTEXT_CLEARED: &str = "[CONTEXT_CLEARED]";

/// How many recent messages a persona switch loads at most.
pub const RECENT_WINDOW: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Human,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::System => "system",
        }
    }

    fn parse(s: &str) -> Role {
        match s {
            "human" => Role::Human,
            _ => Role::System,
        }
    }
}

/// Delivery state of a human message through the response pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Queued,
    Processing,
    Sent,
    Failed,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Queued => "queued",
            MessageState::Processing => "processing",
            MessageState::Sent => "sent",
            MessageState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<MessageState> {
        match s {
            "queued" => Some(MessageState::Queued),
            "processing" => Some(MessageState::Processing),
            "sent" => Some(MessageState::Sent),
            "failed" => Some(MessageState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub persona: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub concept_processed: bool,
    pub state: Option<MessageState>,
    pub metadata: Option<serde_json::Value>,
}

/// Parameters for appending a message.
pub struct NewMessage<'a> {
    pub persona: &'a str,
    pub role: Role,
    pub content: &'a str,
    pub read: bool,
    pub concept_processed: bool,
    pub state: Option<MessageState>,
    pub metadata: Option<serde_json::Value>,
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Message {
    Message {
        id: row.get("id"),
        persona: row.get("persona"),
        role: Role::parse(row.get("role")),
        content: row.get("content"),
        timestamp: row.get("timestamp"),
        read: row.get::<i32, _>("is_read") != 0,
        concept_processed: row.get::<i32, _>("concept_processed") != 0,
        state: row
            .get::<Option<String>, _>("state")
            .as_deref()
            .and_then(MessageState::parse),
        metadata: row
            .get::<Option<String>, _>("metadata")
            .and_then(|m| serde_json::from_str(&m).ok()),
    }
}

const SELECT_COLUMNS: &str =
    "id, persona, role, content, timestamp, is_read, concept_processed, state, metadata";

/// Append a message, enforcing monotonic timestamps within the persona.
pub async fn append(db: &Pool<Sqlite>, new: NewMessage<'_>) -> Result<Message> {
    let last: Option<(DateTime<Utc>,)> = sqlx::query_as(
        "SELECT timestamp FROM messages WHERE persona = ? ORDER BY timestamp DESC LIMIT 1",
    )
    .bind(new.persona)
    .fetch_optional(db)
    .await
    .context("Failed to read last message timestamp")?;

    let mut timestamp = Utc::now();
    if let Some((last_ts,)) = last {
        if timestamp <= last_ts {
            timestamp = last_ts + Duration::milliseconds(1);
        }
    }

    let message = Message {
        id: Uuid::new_v4().to_string(),
        persona: new.persona.to_string(),
        role: new.role,
        content: new.content.to_string(),
        timestamp,
        read: new.read,
        concept_processed: new.concept_processed,
        state: new.state,
        metadata: new.metadata,
    };

    sqlx::query(
        r#"
        INSERT INTO messages
            (id, persona, role, content, timestamp, is_read, concept_processed, state, metadata)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&message.id)
    .bind(&message.persona)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(message.timestamp)
    .bind(message.read as i32)
    .bind(message.concept_processed as i32)
    .bind(message.state.map(|s| s.as_str()))
    .bind(
        message
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_default()),
    )
    .execute(db)
    .await
    .context("Failed to append message")?;

    Ok(message)
}

/// Flip the delivery state of a set of messages.
pub async fn set_state(db: &Pool<Sqlite>, ids: &[String], state: MessageState) -> Result<()> {
    for id in ids {
        sqlx::query("UPDATE messages SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(id)
            .execute(db)
            .await
            .context("Failed to update message state")?;
    }
    Ok(())
}

/// Mark messages as concept-processed (extraction has seen them).
pub async fn mark_concept_processed(db: &Pool<Sqlite>, ids: &[String]) -> Result<()> {
    for id in ids {
        sqlx::query("UPDATE messages SET concept_processed = 1 WHERE id = ?")
            .bind(id)
            .execute(db)
            .await
            .context("Failed to mark message concept_processed")?;
    }
    Ok(())
}

/// Mark every message of a persona as read. Returns how many flipped.
pub async fn mark_all_read(db: &Pool<Sqlite>, persona: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE messages SET is_read = 1 WHERE persona = ? AND is_read = 0")
        .bind(persona)
        .execute(db)
        .await
        .context("Failed to mark messages read")?;
    Ok(result.rows_affected())
}

pub async fn unread_count(db: &Pool<Sqlite>, persona: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE persona = ? AND is_read = 0")
            .bind(persona)
            .fetch_one(db)
            .await
            .context("Failed to count unread messages")?;
    Ok(count)
}

/// Recent context for a persona: the last `RECENT_WINDOW` messages or
/// everything after the latest `[CONTEXT_CLEARED]` sentinel, whichever
/// window is shorter.
pub async fn load_recent(db: &Pool<Sqlite>, persona: &str) -> Result<Vec<Message>> {
    let boundary: Option<(DateTime<Utc>,)> = sqlx::query_as(
        "SELECT timestamp FROM messages WHERE persona = ? AND content = ? \
         ORDER BY timestamp DESC LIMIT 1",
    )
    .bind(persona)
    .bind(CONTEXT_CLEARED)
    .fetch_optional(db)
    .await
    .context("Failed to locate context boundary")?;

    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM messages WHERE persona = ? \
         ORDER BY timestamp DESC LIMIT ?"
    ))
    .bind(persona)
    .bind(RECENT_WINDOW)
    .fetch_all(db)
    .await
    .context("Failed to load recent messages")?;

    let mut messages: Vec<Message> = rows.iter().map(row_to_message).collect();
    messages.reverse();

    if let Some((boundary_ts,)) = boundary {
        messages.retain(|m| m.timestamp > boundary_ts);
    }

    Ok(messages)
}

/// Messages not yet seen by extraction, oldest first. The sentinel never
/// appears here because it is written with `concept_processed = 1`.
pub async fn unprocessed(db: &Pool<Sqlite>, persona: &str) -> Result<Vec<Message>> {
    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM messages \
         WHERE persona = ? AND concept_processed = 0 ORDER BY timestamp ASC"
    ))
    .bind(persona)
    .fetch_all(db)
    .await
    .context("Failed to load unprocessed messages")?;

    Ok(rows.iter().map(row_to_message).collect())
}

/// Unprocessed messages older than the cutoff, for the staleness sweep.
pub async fn unprocessed_older_than(
    db: &Pool<Sqlite>,
    persona: &str,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Message>> {
    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM messages \
         WHERE persona = ? AND concept_processed = 0 AND timestamp < ? \
         ORDER BY timestamp ASC"
    ))
    .bind(persona)
    .bind(cutoff)
    .fetch_all(db)
    .await
    .context("Failed to load stale unprocessed messages")?;

    Ok(rows.iter().map(row_to_message).collect())
}

/// The most recent message of a persona, if any.
pub async fn last_message(db: &Pool<Sqlite>, persona: &str) -> Result<Option<Message>> {
    let row = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM messages WHERE persona = ? \
         ORDER BY timestamp DESC LIMIT 1"
    ))
    .bind(persona)
    .fetch_optional(db)
    .await
    .context("Failed to load last message")?;

    Ok(row.as_ref().map(row_to_message))
}

/// The most recent human message timestamp, used to find inactive personas.
pub async fn last_human_activity(
    db: &Pool<Sqlite>,
    persona: &str,
) -> Result<Option<DateTime<Utc>>> {
    let ts: Option<(DateTime<Utc>,)> = sqlx::query_as(
        "SELECT timestamp FROM messages WHERE persona = ? AND role = 'human' \
         ORDER BY timestamp DESC LIMIT 1",
    )
    .bind(persona)
    .fetch_optional(db)
    .await
    .context("Failed to load last human activity")?;
    Ok(ts.map(|(t,)| t))
}

/// Load messages by id, preserving chronological order.
pub async fn load_by_ids(db: &Pool<Sqlite>, ids: &[String]) -> Result<Vec<Message>> {
    let mut messages = Vec::with_capacity(ids.len());
    for id in ids {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM messages WHERE id = ?"))
            .bind(id)
            .fetch_optional(db)
            .await
            .context("Failed to load message by id")?;
        if let Some(row) = row {
            messages.push(row_to_message(&row));
        }
    }
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(messages)
}

/// Full history dump (all personas), for snapshots.
pub async fn load_all(db: &Pool<Sqlite>) -> Result<Vec<Message>> {
    let rows = sqlx::query(&format!(
        "SELECT {SELECT_COLUMNS} FROM messages ORDER BY persona, timestamp ASC"
    ))
    .fetch_all(db)
    .await
    .context("Failed to load full history")?;

    Ok(rows.iter().map(row_to_message).collect())
}
