//! Snapshot / undo.
//!
//! A bounded in-memory ring captures full engine state before every
//! mutating user action; named saves go to disk as JSON documents. Restore
//! rewrites every document inside one transaction, so a failure leaves the
//! previous state untouched.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use std::collections::VecDeque;
use std::path::PathBuf;
use uuid::Uuid;

use crate::entities::{store, FactRow, PersonRow, TopicRow, TraitRow};
use crate::history::{self, Message};
use crate::personas::PersonaRecord;

/// Undo depth kept in memory.
const RING_CAPACITY: usize = 10;
/// Named saves retained on disk.
const MAX_SAVED: usize = 10;

/// Point-in-time copy of every in-scope document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub personas: Vec<PersonaRecord>,
    pub messages: Vec<Message>,
    pub facts: Vec<FactRow>,
    pub traits: Vec<TraitRow>,
    pub topics: Vec<TopicRow>,
    pub people: Vec<PersonRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub name: Option<String>,
    /// Human-readable description of the action about to happen.
    pub action: String,
    pub payload: SnapshotPayload,
}

#[derive(Debug, Clone)]
pub struct SavedStateInfo {
    pub id: String,
    pub name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct SnapshotManager {
    ring: VecDeque<Snapshot>,
    dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            ring: VecDeque::new(),
            dir,
        }
    }

    /// Copy the full current state out of storage.
    pub async fn capture(
        db: &Pool<Sqlite>,
        personas: Vec<PersonaRecord>,
        action: &str,
    ) -> Result<Snapshot> {
        let mut facts = Vec::new();
        for entity in entities_of(db, "facts").await? {
            facts.extend(store::list_facts(db, &entity).await?);
        }
        let mut traits = Vec::new();
        for entity in entities_of(db, "traits").await? {
            traits.extend(store::list_traits(db, &entity).await?);
        }
        let mut topics = Vec::new();
        for entity in entities_of(db, "topics").await? {
            topics.extend(store::list_topics(db, &entity).await?);
        }
        let mut people = Vec::new();
        for entity in entities_of(db, "people").await? {
            people.extend(store::list_people(db, &entity).await?);
        }

        let payload = SnapshotPayload {
            personas,
            messages: history::load_all(db).await?,
            facts,
            traits,
            topics,
            people,
        };

        Ok(Snapshot {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            name: None,
            action: action.to_string(),
            payload,
        })
    }

    /// Push onto the undo ring, evicting the oldest beyond capacity.
    pub fn push(&mut self, snapshot: Snapshot) {
        self.ring.push_back(snapshot);
        while self.ring.len() > RING_CAPACITY {
            self.ring.pop_front();
        }
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    /// Take the snapshot `n` steps back (1 = most recent), discarding the
    /// newer ones. `None` when the ring does not reach that deep.
    pub fn undo(&mut self, n: usize) -> Option<Snapshot> {
        if n == 0 || self.ring.len() < n {
            return None;
        }
        for _ in 0..(n - 1) {
            self.ring.pop_back();
        }
        self.ring.pop_back()
    }

    /// Rewrite every document from the payload, atomically.
    pub async fn restore(db: &Pool<Sqlite>, payload: &SnapshotPayload) -> Result<()> {
        let mut tx = db.begin().await.context("Failed to begin restore")?;

        for table in ["messages", "facts", "traits", "topics", "people"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to clear {table}"))?;
        }

        for m in &payload.messages {
            sqlx::query(
                r#"
                INSERT INTO messages
                    (id, persona, role, content, timestamp, is_read, concept_processed, state, metadata)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&m.id)
            .bind(&m.persona)
            .bind(m.role.as_str())
            .bind(&m.content)
            .bind(m.timestamp)
            .bind(m.read as i32)
            .bind(m.concept_processed as i32)
            .bind(m.state.map(|s| s.as_str()))
            .bind(
                m.metadata
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default()),
            )
            .execute(&mut *tx)
            .await
            .context("Failed to restore message")?;
        }

        for f in &payload.facts {
            sqlx::query(
                r#"
                INSERT INTO facts
                    (id, entity, name, description, sentiment, confidence, last_confirmed,
                     persona_groups, learned_by)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&f.id)
            .bind(&f.entity)
            .bind(&f.name)
            .bind(&f.description)
            .bind(f.sentiment)
            .bind(f.confidence)
            .bind(f.last_confirmed)
            .bind(serde_json::to_string(&f.persona_groups).unwrap_or_else(|_| "[]".into()))
            .bind(&f.learned_by)
            .execute(&mut *tx)
            .await
            .context("Failed to restore fact")?;
        }

        for t in &payload.traits {
            sqlx::query(
                r#"
                INSERT INTO traits
                    (id, entity, name, description, sentiment, strength, persona_groups, learned_by)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&t.id)
            .bind(&t.entity)
            .bind(&t.name)
            .bind(&t.description)
            .bind(t.sentiment)
            .bind(t.strength)
            .bind(serde_json::to_string(&t.persona_groups).unwrap_or_else(|_| "[]".into()))
            .bind(&t.learned_by)
            .execute(&mut *tx)
            .await
            .context("Failed to restore trait")?;
        }

        for t in &payload.topics {
            sqlx::query(
                r#"
                INSERT INTO topics
                    (id, entity, name, description, sentiment, level_current, level_ideal,
                     last_updated, persona_groups, learned_by)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&t.id)
            .bind(&t.entity)
            .bind(&t.name)
            .bind(&t.description)
            .bind(t.sentiment)
            .bind(t.level_current)
            .bind(t.level_ideal)
            .bind(t.last_updated)
            .bind(serde_json::to_string(&t.persona_groups).unwrap_or_else(|_| "[]".into()))
            .bind(&t.learned_by)
            .execute(&mut *tx)
            .await
            .context("Failed to restore topic")?;
        }

        for p in &payload.people {
            sqlx::query(
                r#"
                INSERT INTO people
                    (id, entity, name, relationship, description, sentiment, level_current,
                     level_ideal, last_updated, persona_groups, learned_by)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&p.id)
            .bind(&p.entity)
            .bind(&p.name)
            .bind(&p.relationship)
            .bind(&p.description)
            .bind(p.sentiment)
            .bind(p.level_current)
            .bind(p.level_ideal)
            .bind(p.last_updated)
            .bind(serde_json::to_string(&p.persona_groups).unwrap_or_else(|_| "[]".into()))
            .bind(&p.learned_by)
            .execute(&mut *tx)
            .await
            .context("Failed to restore person")?;
        }

        tx.commit().await.context("Failed to commit restore")?;
        Ok(())
    }

    /// Write a snapshot to disk as a named save, pruning beyond the cap.
    pub fn save_to_disk(&self, mut snapshot: Snapshot, name: Option<String>) -> Result<SavedStateInfo> {
        std::fs::create_dir_all(&self.dir).context("Failed to create snapshots directory")?;

        snapshot.name = name;
        let path = self.dir.join(format!("{}.json", snapshot.id));
        let contents =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize snapshot")?;
        std::fs::write(&path, contents).context("Failed to write snapshot")?;

        let info = SavedStateInfo {
            id: snapshot.id.clone(),
            name: snapshot.name.clone(),
            timestamp: snapshot.timestamp,
        };

        // Prune oldest saves beyond the cap.
        let mut saved = self.list_saved()?;
        saved.sort_by_key(|s| s.timestamp);
        while saved.len() > MAX_SAVED {
            let victim = saved.remove(0);
            let victim_path = self.dir.join(format!("{}.json", victim.id));
            if let Err(e) = std::fs::remove_file(&victim_path) {
                tracing::warn!("Failed to prune old snapshot {}: {}", victim.id, e);
            }
        }

        tracing::info!("Saved state {} to disk", info.id);
        Ok(info)
    }

    /// Metadata of every on-disk save, oldest first.
    pub fn list_saved(&self) -> Result<Vec<SavedStateInfo>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&self.dir).context("Failed to read snapshots directory")? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<Snapshot>(&c).ok())
            {
                Some(snapshot) => out.push(SavedStateInfo {
                    id: snapshot.id,
                    name: snapshot.name,
                    timestamp: snapshot.timestamp,
                }),
                None => tracing::warn!("Skipping unreadable snapshot file {}", path.display()),
            }
        }
        out.sort_by_key(|s| s.timestamp);
        Ok(out)
    }

    /// Load a save by id, name, or 1-based list number.
    pub fn load_saved(&self, selector: &str) -> Result<Snapshot> {
        let saved = self.list_saved()?;

        let target = if let Ok(number) = selector.parse::<usize>() {
            saved
                .get(number.saturating_sub(1))
                .map(|s| s.id.clone())
                .with_context(|| format!("No saved state #{}", number))?
        } else {
            saved
                .iter()
                .find(|s| s.id == selector || s.name.as_deref() == Some(selector))
                .map(|s| s.id.clone())
                .with_context(|| format!("No saved state matching '{}'", selector))?
        };

        let path = self.dir.join(format!("{}.json", target));
        let contents = std::fs::read_to_string(&path).context("Failed to read snapshot")?;
        serde_json::from_str(&contents).context("Failed to parse snapshot")
    }
}

/// Entities holding rows in a bucket table.
async fn entities_of(db: &Pool<Sqlite>, table: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(&format!("SELECT DISTINCT entity FROM {table}"))
        .fetch_all(db)
        .await
        .with_context(|| format!("Failed to list {table} entities"))?;
    Ok(rows.into_iter().map(|(e,)| e).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_database;
    use crate::entities::HUMAN_ENTITY;
    use crate::history::{append, NewMessage, Role};

    async fn seeded_db() -> Pool<Sqlite> {
        let db = init_memory_database().await.unwrap();

        append(
            &db,
            NewMessage {
                persona: "bob",
                role: Role::Human,
                content: "hello",
                read: true,
                concept_processed: false,
                state: None,
                metadata: None,
            },
        )
        .await
        .unwrap();

        store::upsert_fact(
            &db,
            &FactRow {
                id: store::new_row_id(),
                entity: HUMAN_ENTITY.to_string(),
                name: "Birthday".to_string(),
                description: "in May".to_string(),
                sentiment: 0.0,
                confidence: 0.8,
                last_confirmed: None,
                persona_groups: Default::default(),
                learned_by: Some("ei".to_string()),
            },
        )
        .await
        .unwrap();

        db
    }

    #[tokio::test]
    async fn test_capture_restore_roundtrip() {
        let db = seeded_db().await;

        let snapshot = SnapshotManager::capture(&db, vec![], "test").await.unwrap();
        assert_eq!(snapshot.payload.messages.len(), 1);
        assert_eq!(snapshot.payload.facts.len(), 1);

        // Mutate, then restore.
        store::delete_row(&db, crate::entities::DataType::Fact, HUMAN_ENTITY, "Birthday")
            .await
            .unwrap();
        append(
            &db,
            NewMessage {
                persona: "bob",
                role: Role::Human,
                content: "extra",
                read: true,
                concept_processed: false,
                state: None,
                metadata: None,
            },
        )
        .await
        .unwrap();

        SnapshotManager::restore(&db, &snapshot.payload).await.unwrap();

        let restored = SnapshotManager::capture(&db, vec![], "after").await.unwrap();
        assert_eq!(restored.payload.messages.len(), 1);
        assert_eq!(restored.payload.facts.len(), 1);
        assert_eq!(restored.payload.facts[0].name, "Birthday");
    }

    #[tokio::test]
    async fn test_ring_bounded_at_capacity() {
        let db = init_memory_database().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = SnapshotManager::new(tmp.path().to_path_buf());

        for i in 0..15 {
            let snapshot = SnapshotManager::capture(&db, vec![], &format!("action {}", i))
                .await
                .unwrap();
            manager.push(snapshot);
        }

        assert_eq!(manager.ring_len(), RING_CAPACITY);
    }

    #[tokio::test]
    async fn test_undo_depth() {
        let db = init_memory_database().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = SnapshotManager::new(tmp.path().to_path_buf());

        for i in 0..3 {
            let snapshot = SnapshotManager::capture(&db, vec![], &format!("action {}", i))
                .await
                .unwrap();
            manager.push(snapshot);
        }

        // undo(2) discards the newest and returns the one behind it.
        let restored = manager.undo(2).unwrap();
        assert_eq!(restored.action, "action 1");
        assert_eq!(manager.ring_len(), 1);

        assert!(manager.undo(5).is_none());
        assert!(manager.undo(1).is_some());
        assert!(manager.undo(1).is_none()); // empty ring
    }

    #[tokio::test]
    async fn test_saved_states_on_disk() {
        let db = seeded_db().await;
        let tmp = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(tmp.path().to_path_buf());

        let snapshot = SnapshotManager::capture(&db, vec![], "save").await.unwrap();
        let info = manager
            .save_to_disk(snapshot, Some("before-vacation".to_string()))
            .unwrap();

        let listed = manager.list_saved().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name.as_deref(), Some("before-vacation"));

        let by_name = manager.load_saved("before-vacation").unwrap();
        assert_eq!(by_name.id, info.id);

        let by_number = manager.load_saved("1").unwrap();
        assert_eq!(by_number.id, info.id);

        assert!(manager.load_saved("nope").is_err());
    }
}
