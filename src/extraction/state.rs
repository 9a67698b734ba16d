//! Extraction frequency controller.
//!
//! Facts and traits saturate: the more often they have been extracted,
//! the more new conversation it takes to justify another pass. Topics and
//! people always extract. The rule is `messages_since_last_extract >=
//! max(10, total_extractions)` with no per-site tuning knobs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};

use crate::entities::DataType;

/// Floor before the taper kicks in.
const MIN_MESSAGES: i64 = 10;

#[derive(Debug, Clone, Default)]
pub struct ExtractionState {
    pub last_extraction: Option<DateTime<Utc>>,
    pub messages_since_last_extract: i64,
    pub total_extractions: i64,
}

pub async fn get_state(
    db: &Pool<Sqlite>,
    entity: &str,
    persona: &str,
    data_type: DataType,
) -> Result<ExtractionState> {
    let row: Option<(Option<DateTime<Utc>>, i64, i64)> = sqlx::query_as(
        "SELECT last_extraction, messages_since_last_extract, total_extractions \
         FROM extraction_state WHERE entity = ? AND persona = ? AND data_type = ?",
    )
    .bind(entity)
    .bind(persona)
    .bind(data_type.as_str())
    .fetch_optional(db)
    .await
    .context("Failed to read extraction state")?;

    Ok(match row {
        Some((last_extraction, messages, total)) => ExtractionState {
            last_extraction,
            messages_since_last_extract: messages,
            total_extractions: total,
        },
        None => ExtractionState::default(),
    })
}

/// Count one conversation turn against every bucket of an entity.
pub async fn increment_messages(
    db: &Pool<Sqlite>,
    entity: &str,
    persona: &str,
    data_types: &[DataType],
) -> Result<()> {
    for data_type in data_types {
        sqlx::query(
            r#"
            INSERT INTO extraction_state (entity, persona, data_type, messages_since_last_extract)
            VALUES (?, ?, ?, 1)
            ON CONFLICT(entity, persona, data_type) DO UPDATE SET
                messages_since_last_extract = messages_since_last_extract + 1
            "#,
        )
        .bind(entity)
        .bind(persona)
        .bind(data_type.as_str())
        .execute(db)
        .await
        .context("Failed to increment extraction counter")?;
    }
    Ok(())
}

/// Record a successful detail update: the message counter resets and the
/// lifetime total advances, tapering future extractions.
pub async fn record_extraction(
    db: &Pool<Sqlite>,
    entity: &str,
    persona: &str,
    data_type: DataType,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO extraction_state
            (entity, persona, data_type, last_extraction, messages_since_last_extract, total_extractions)
        VALUES (?, ?, ?, ?, 0, 1)
        ON CONFLICT(entity, persona, data_type) DO UPDATE SET
            last_extraction = excluded.last_extraction,
            messages_since_last_extract = 0,
            total_extractions = total_extractions + 1
        "#,
    )
    .bind(entity)
    .bind(persona)
    .bind(data_type.as_str())
    .bind(Utc::now())
    .execute(db)
    .await
    .context("Failed to record extraction")?;
    Ok(())
}

/// Whether an extraction attempt is due for this bucket.
pub fn should_extract(data_type: DataType, state: &ExtractionState) -> bool {
    match data_type {
        DataType::Topic | DataType::Person => true,
        DataType::Fact | DataType::Trait => {
            state.messages_since_last_extract >= MIN_MESSAGES.max(state.total_extractions)
        }
    }
}
