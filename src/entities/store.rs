//! Database CRUD for entity rows.
//!
//! All numeric fields are clamped on every write so no out-of-range value
//! can reach disk, whatever the LLM returned.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::{
    clamp_sentiment, clamp_unit, DataType, FactRow, PersonRow, TopicRow, TraitRow,
};

fn groups_to_json(groups: &BTreeSet<String>) -> String {
    serde_json::to_string(groups).unwrap_or_else(|_| "[]".to_string())
}

fn groups_from_json(json: &str) -> BTreeSet<String> {
    serde_json::from_str(json).unwrap_or_default()
}

pub fn new_row_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

pub async fn upsert_fact(db: &Pool<Sqlite>, row: &FactRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO facts
            (id, entity, name, description, sentiment, confidence, last_confirmed,
             persona_groups, learned_by)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity, name) DO UPDATE SET
            description = excluded.description,
            sentiment = excluded.sentiment,
            confidence = excluded.confidence,
            last_confirmed = excluded.last_confirmed,
            persona_groups = excluded.persona_groups,
            learned_by = excluded.learned_by
        "#,
    )
    .bind(&row.id)
    .bind(&row.entity)
    .bind(&row.name)
    .bind(&row.description)
    .bind(clamp_sentiment(row.sentiment))
    .bind(clamp_unit(row.confidence))
    .bind(row.last_confirmed)
    .bind(groups_to_json(&row.persona_groups))
    .bind(&row.learned_by)
    .execute(db)
    .await
    .context("Failed to upsert fact")?;
    Ok(())
}

fn row_to_fact(row: &sqlx::sqlite::SqliteRow) -> FactRow {
    FactRow {
        id: row.get("id"),
        entity: row.get("entity"),
        name: row.get("name"),
        description: row.get("description"),
        sentiment: row.get("sentiment"),
        confidence: row.get("confidence"),
        last_confirmed: row.get("last_confirmed"),
        persona_groups: groups_from_json(row.get("persona_groups")),
        learned_by: row.get("learned_by"),
    }
}

pub async fn get_fact(db: &Pool<Sqlite>, entity: &str, name: &str) -> Result<Option<FactRow>> {
    let row = sqlx::query("SELECT * FROM facts WHERE entity = ? AND name = ?")
        .bind(entity)
        .bind(name)
        .fetch_optional(db)
        .await
        .context("Failed to get fact")?;
    Ok(row.as_ref().map(row_to_fact))
}

pub async fn list_facts(db: &Pool<Sqlite>, entity: &str) -> Result<Vec<FactRow>> {
    let rows = sqlx::query("SELECT * FROM facts WHERE entity = ? ORDER BY name")
        .bind(entity)
        .fetch_all(db)
        .await
        .context("Failed to list facts")?;
    Ok(rows.iter().map(row_to_fact).collect())
}

/// Confirm a fact during the ceremony: confidence to 1.0, stamp
/// last_confirmed.
pub async fn confirm_fact(db: &Pool<Sqlite>, entity: &str, name: &str) -> Result<bool> {
    let result =
        sqlx::query("UPDATE facts SET confidence = 1.0, last_confirmed = ? WHERE entity = ? AND name = ?")
            .bind(Utc::now())
            .bind(entity)
            .bind(name)
            .execute(db)
            .await
            .context("Failed to confirm fact")?;
    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub async fn upsert_trait(db: &Pool<Sqlite>, row: &TraitRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO traits
            (id, entity, name, description, sentiment, strength, persona_groups, learned_by)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity, name) DO UPDATE SET
            description = excluded.description,
            sentiment = excluded.sentiment,
            strength = excluded.strength,
            persona_groups = excluded.persona_groups,
            learned_by = excluded.learned_by
        "#,
    )
    .bind(&row.id)
    .bind(&row.entity)
    .bind(&row.name)
    .bind(&row.description)
    .bind(clamp_sentiment(row.sentiment))
    .bind(clamp_unit(row.strength))
    .bind(groups_to_json(&row.persona_groups))
    .bind(&row.learned_by)
    .execute(db)
    .await
    .context("Failed to upsert trait")?;
    Ok(())
}

fn row_to_trait(row: &sqlx::sqlite::SqliteRow) -> TraitRow {
    TraitRow {
        id: row.get("id"),
        entity: row.get("entity"),
        name: row.get("name"),
        description: row.get("description"),
        sentiment: row.get("sentiment"),
        strength: row.get("strength"),
        persona_groups: groups_from_json(row.get("persona_groups")),
        learned_by: row.get("learned_by"),
    }
}

pub async fn get_trait(db: &Pool<Sqlite>, entity: &str, name: &str) -> Result<Option<TraitRow>> {
    let row = sqlx::query("SELECT * FROM traits WHERE entity = ? AND name = ?")
        .bind(entity)
        .bind(name)
        .fetch_optional(db)
        .await
        .context("Failed to get trait")?;
    Ok(row.as_ref().map(row_to_trait))
}

pub async fn list_traits(db: &Pool<Sqlite>, entity: &str) -> Result<Vec<TraitRow>> {
    let rows = sqlx::query("SELECT * FROM traits WHERE entity = ? ORDER BY name")
        .bind(entity)
        .fetch_all(db)
        .await
        .context("Failed to list traits")?;
    Ok(rows.iter().map(row_to_trait).collect())
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

pub async fn upsert_topic(db: &Pool<Sqlite>, row: &TopicRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO topics
            (id, entity, name, description, sentiment, level_current, level_ideal,
             last_updated, persona_groups, learned_by)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity, name) DO UPDATE SET
            description = excluded.description,
            sentiment = excluded.sentiment,
            level_current = excluded.level_current,
            level_ideal = excluded.level_ideal,
            last_updated = excluded.last_updated,
            persona_groups = excluded.persona_groups,
            learned_by = excluded.learned_by
        "#,
    )
    .bind(&row.id)
    .bind(&row.entity)
    .bind(&row.name)
    .bind(&row.description)
    .bind(clamp_sentiment(row.sentiment))
    .bind(clamp_unit(row.level_current))
    .bind(clamp_unit(row.level_ideal))
    .bind(row.last_updated)
    .bind(groups_to_json(&row.persona_groups))
    .bind(&row.learned_by)
    .execute(db)
    .await
    .context("Failed to upsert topic")?;
    Ok(())
}

fn row_to_topic(row: &sqlx::sqlite::SqliteRow) -> TopicRow {
    TopicRow {
        id: row.get("id"),
        entity: row.get("entity"),
        name: row.get("name"),
        description: row.get("description"),
        sentiment: row.get("sentiment"),
        level_current: row.get("level_current"),
        level_ideal: row.get("level_ideal"),
        last_updated: row.get("last_updated"),
        persona_groups: groups_from_json(row.get("persona_groups")),
        learned_by: row.get("learned_by"),
    }
}

pub async fn get_topic(db: &Pool<Sqlite>, entity: &str, name: &str) -> Result<Option<TopicRow>> {
    let row = sqlx::query("SELECT * FROM topics WHERE entity = ? AND name = ?")
        .bind(entity)
        .bind(name)
        .fetch_optional(db)
        .await
        .context("Failed to get topic")?;
    Ok(row.as_ref().map(row_to_topic))
}

pub async fn list_topics(db: &Pool<Sqlite>, entity: &str) -> Result<Vec<TopicRow>> {
    let rows = sqlx::query("SELECT * FROM topics WHERE entity = ? ORDER BY name")
        .bind(entity)
        .fetch_all(db)
        .await
        .context("Failed to list topics")?;
    Ok(rows.iter().map(row_to_topic).collect())
}

/// Decay/exposure write path: only the level and timestamp move.
pub async fn set_topic_level(
    db: &Pool<Sqlite>,
    entity: &str,
    name: &str,
    level_current: f64,
    last_updated: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE topics SET level_current = ?, last_updated = ? WHERE entity = ? AND name = ?")
        .bind(clamp_unit(level_current))
        .bind(last_updated)
        .bind(entity)
        .bind(name)
        .execute(db)
        .await
        .context("Failed to update topic level")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// People
// ---------------------------------------------------------------------------

pub async fn upsert_person(db: &Pool<Sqlite>, row: &PersonRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO people
            (id, entity, name, relationship, description, sentiment, level_current,
             level_ideal, last_updated, persona_groups, learned_by)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity, name) DO UPDATE SET
            relationship = excluded.relationship,
            description = excluded.description,
            sentiment = excluded.sentiment,
            level_current = excluded.level_current,
            level_ideal = excluded.level_ideal,
            last_updated = excluded.last_updated,
            persona_groups = excluded.persona_groups,
            learned_by = excluded.learned_by
        "#,
    )
    .bind(&row.id)
    .bind(&row.entity)
    .bind(&row.name)
    .bind(&row.relationship)
    .bind(&row.description)
    .bind(clamp_sentiment(row.sentiment))
    .bind(clamp_unit(row.level_current))
    .bind(clamp_unit(row.level_ideal))
    .bind(row.last_updated)
    .bind(groups_to_json(&row.persona_groups))
    .bind(&row.learned_by)
    .execute(db)
    .await
    .context("Failed to upsert person")?;
    Ok(())
}

fn row_to_person(row: &sqlx::sqlite::SqliteRow) -> PersonRow {
    PersonRow {
        id: row.get("id"),
        entity: row.get("entity"),
        name: row.get("name"),
        relationship: row.get("relationship"),
        description: row.get("description"),
        sentiment: row.get("sentiment"),
        level_current: row.get("level_current"),
        level_ideal: row.get("level_ideal"),
        last_updated: row.get("last_updated"),
        persona_groups: groups_from_json(row.get("persona_groups")),
        learned_by: row.get("learned_by"),
    }
}

pub async fn get_person(db: &Pool<Sqlite>, entity: &str, name: &str) -> Result<Option<PersonRow>> {
    let row = sqlx::query("SELECT * FROM people WHERE entity = ? AND name = ?")
        .bind(entity)
        .bind(name)
        .fetch_optional(db)
        .await
        .context("Failed to get person")?;
    Ok(row.as_ref().map(row_to_person))
}

pub async fn list_people(db: &Pool<Sqlite>, entity: &str) -> Result<Vec<PersonRow>> {
    let rows = sqlx::query("SELECT * FROM people WHERE entity = ? ORDER BY name")
        .bind(entity)
        .fetch_all(db)
        .await
        .context("Failed to list people")?;
    Ok(rows.iter().map(row_to_person).collect())
}

pub async fn set_person_level(
    db: &Pool<Sqlite>,
    entity: &str,
    name: &str,
    level_current: f64,
    last_updated: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE people SET level_current = ?, last_updated = ? WHERE entity = ? AND name = ?")
        .bind(clamp_unit(level_current))
        .bind(last_updated)
        .bind(entity)
        .bind(name)
        .execute(db)
        .await
        .context("Failed to update person level")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Cross-bucket operations
// ---------------------------------------------------------------------------

fn table_for(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Fact => "facts",
        DataType::Trait => "traits",
        DataType::Topic => "topics",
        DataType::Person => "people",
    }
}

/// Delete a row (ceremony "rejected" outcome). Returns whether it existed.
pub async fn delete_row(
    db: &Pool<Sqlite>,
    data_type: DataType,
    entity: &str,
    name: &str,
) -> Result<bool> {
    let result = sqlx::query(&format!(
        "DELETE FROM {} WHERE entity = ? AND name = ?",
        table_for(data_type)
    ))
    .bind(entity)
    .bind(name)
    .execute(db)
    .await
    .context("Failed to delete entity row")?;
    Ok(result.rows_affected() > 0)
}

/// Replace a row's visibility groups (ceremony "roleplay" outcome).
pub async fn set_row_groups(
    db: &Pool<Sqlite>,
    data_type: DataType,
    entity: &str,
    name: &str,
    groups: &BTreeSet<String>,
) -> Result<bool> {
    let result = sqlx::query(&format!(
        "UPDATE {} SET persona_groups = ? WHERE entity = ? AND name = ?",
        table_for(data_type)
    ))
    .bind(groups_to_json(groups))
    .bind(entity)
    .bind(name)
    .execute(db)
    .await
    .context("Failed to update row groups")?;
    Ok(result.rows_affected() > 0)
}

/// A topic or person row that has gone stale: low engagement and no touch
/// in a long time. Candidates for the ceremony's staleness suggestions.
#[derive(Debug, Clone)]
pub struct StaleRow {
    pub data_type: DataType,
    pub entity: String,
    pub name: String,
    pub relationship: Option<String>,
}

pub async fn stale_rows(
    db: &Pool<Sqlite>,
    max_level: f64,
    cutoff: DateTime<Utc>,
) -> Result<Vec<StaleRow>> {
    let mut out = Vec::new();

    let topic_rows = sqlx::query(
        "SELECT entity, name FROM topics WHERE level_current < ? AND last_updated < ?",
    )
    .bind(max_level)
    .bind(cutoff)
    .fetch_all(db)
    .await
    .context("Failed to query stale topics")?;
    for row in &topic_rows {
        out.push(StaleRow {
            data_type: DataType::Topic,
            entity: row.get("entity"),
            name: row.get("name"),
            relationship: None,
        });
    }

    let people_rows = sqlx::query(
        "SELECT entity, name, relationship FROM people WHERE level_current < ? AND last_updated < ?",
    )
    .bind(max_level)
    .bind(cutoff)
    .fetch_all(db)
    .await
    .context("Failed to query stale people")?;
    for row in &people_rows {
        out.push(StaleRow {
            data_type: DataType::Person,
            entity: row.get("entity"),
            name: row.get("name"),
            relationship: Some(row.get("relationship")),
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_database;
    use crate::entities::HUMAN_ENTITY;

    fn fact(name: &str, confidence: f64) -> FactRow {
        FactRow {
            id: new_row_id(),
            entity: HUMAN_ENTITY.to_string(),
            name: name.to_string(),
            description: String::new(),
            sentiment: 0.0,
            confidence,
            last_confirmed: None,
            persona_groups: BTreeSet::new(),
            learned_by: Some("ei".to_string()),
        }
    }

    fn topic(entity: &str, name: &str, current: f64, ideal: f64) -> TopicRow {
        TopicRow {
            id: new_row_id(),
            entity: entity.to_string(),
            name: name.to_string(),
            description: String::new(),
            sentiment: 0.0,
            level_current: current,
            level_ideal: ideal,
            last_updated: Utc::now(),
            persona_groups: BTreeSet::new(),
            learned_by: None,
        }
    }

    #[tokio::test]
    async fn test_fact_roundtrip_and_clamping() {
        let db = init_memory_database().await.unwrap();

        let mut row = fact("Birthday", 1.7);
        row.sentiment = -2.5;
        upsert_fact(&db, &row).await.unwrap();

        let loaded = get_fact(&db, HUMAN_ENTITY, "Birthday").await.unwrap().unwrap();
        assert_eq!(loaded.confidence, 1.0);
        assert_eq!(loaded.sentiment, -1.0);
        assert_eq!(loaded.learned_by.as_deref(), Some("ei"));
    }

    #[tokio::test]
    async fn test_fact_name_case_insensitive_unique() {
        let db = init_memory_database().await.unwrap();

        upsert_fact(&db, &fact("Birthday", 0.5)).await.unwrap();
        upsert_fact(&db, &fact("birthday", 0.8)).await.unwrap();

        let all = list_facts(&db, HUMAN_ENTITY).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].confidence, 0.8);

        // Lookup matches either casing.
        assert!(get_fact(&db, HUMAN_ENTITY, "BIRTHDAY").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_confirm_fact() {
        let db = init_memory_database().await.unwrap();
        upsert_fact(&db, &fact("Birthday", 0.4)).await.unwrap();

        assert!(confirm_fact(&db, HUMAN_ENTITY, "Birthday").await.unwrap());

        let loaded = get_fact(&db, HUMAN_ENTITY, "Birthday").await.unwrap().unwrap();
        assert_eq!(loaded.confidence, 1.0);
        assert!(loaded.last_confirmed.is_some());
    }

    #[tokio::test]
    async fn test_topic_level_write() {
        let db = init_memory_database().await.unwrap();
        upsert_topic(&db, &topic("bob", "sailing", 0.9, 0.3)).await.unwrap();

        let now = Utc::now();
        set_topic_level(&db, "bob", "sailing", 1.4, now).await.unwrap();

        let loaded = get_topic(&db, "bob", "sailing").await.unwrap().unwrap();
        assert_eq!(loaded.level_current, 1.0); // clamped
    }

    #[tokio::test]
    async fn test_delete_row_and_groups() {
        let db = init_memory_database().await.unwrap();
        upsert_fact(&db, &fact("Cat", 0.2)).await.unwrap();

        let mut groups = BTreeSet::new();
        groups.insert("Campaign X".to_string());
        assert!(
            set_row_groups(&db, DataType::Fact, HUMAN_ENTITY, "Cat", &groups)
                .await
                .unwrap()
        );
        let loaded = get_fact(&db, HUMAN_ENTITY, "Cat").await.unwrap().unwrap();
        assert!(loaded.persona_groups.contains("Campaign X"));

        assert!(delete_row(&db, DataType::Fact, HUMAN_ENTITY, "Cat").await.unwrap());
        assert!(get_fact(&db, HUMAN_ENTITY, "Cat").await.unwrap().is_none());
        assert!(!delete_row(&db, DataType::Fact, HUMAN_ENTITY, "Cat").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_rows() {
        let db = init_memory_database().await.unwrap();

        let mut old = topic(HUMAN_ENTITY, "stamp collecting", 0.1, 0.5);
        old.last_updated = Utc::now() - chrono::Duration::days(400);
        upsert_topic(&db, &old).await.unwrap();

        // Fresh and engaged: not stale.
        upsert_topic(&db, &topic(HUMAN_ENTITY, "sailing", 0.8, 0.5))
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(180);
        let stale = stale_rows(&db, 0.2, cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].name, "stamp collecting");
    }
}
