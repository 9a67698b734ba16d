//! Phase B: per-item detail updates.
//!
//! One focused call per item, merging a single row into its entity
//! document. Merges never overwrite `learned_by`, never demote a fact's
//! confidence, and always clamp numeric ranges.

use anyhow::{Context, Result};
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::entities::{store, DataType, FactRow, PersonRow, TopicRow, TraitRow};
use crate::history;
use crate::llm::call_for_json;
use crate::personas::PersonaRecord;
use crate::visibility;

use super::{prompts, state, DetailUpdatePayload, ExtractionEngine};

fn default_confidence() -> f64 {
    0.5
}

fn default_level() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct FactDetail {
    pub description: String,
    #[serde(default)]
    pub sentiment: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct TraitDetail {
    pub description: String,
    #[serde(default)]
    pub sentiment: f64,
    #[serde(default = "default_confidence")]
    pub strength: f64,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct TopicDetail {
    pub description: String,
    #[serde(default)]
    pub sentiment: f64,
    #[serde(default = "default_level")]
    pub level_current: f64,
    #[serde(default = "default_level")]
    pub level_ideal: f64,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct PersonDetail {
    pub relationship: String,
    pub description: String,
    #[serde(default)]
    pub sentiment: f64,
    #[serde(default = "default_level")]
    pub level_current: f64,
    #[serde(default = "default_level")]
    pub level_ideal: f64,
}

impl ExtractionEngine {
    pub async fn run_detail_update(
        &self,
        payload: DetailUpdatePayload,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !payload.data_type.valid_for_persona() && payload.entity != crate::entities::HUMAN_ENTITY
        {
            anyhow::bail!(
                "{} rows cannot exist on persona entity '{}'",
                payload.data_type.as_str(),
                payload.entity
            );
        }

        let viewer = self
            .registry
            .lock()
            .await
            .get(&payload.persona)
            .cloned()
            .with_context(|| format!("Unknown persona: {}", payload.persona))?;

        let recent = history::load_recent(&self.db, &payload.persona).await?;
        let opts = self.concept_opts(&payload.persona, cancel).await;
        let context = payload.context.as_deref();

        match payload.data_type {
            DataType::Fact => {
                let existing = store::get_fact(&self.db, &payload.entity, &payload.name).await?;
                let (system, user) =
                    prompts::fact_detail_prompt(&payload.name, existing.as_ref(), context, &recent);
                let detail: FactDetail =
                    call_for_json(self.llm.as_ref(), &system, &user, &opts)
                        .await?
                        .context("Fact detail returned malformed JSON")?;
                let row = merge_fact(existing, &payload, &viewer, detail);
                store::upsert_fact(&self.db, &row).await?;
            }
            DataType::Trait => {
                let existing = store::get_trait(&self.db, &payload.entity, &payload.name).await?;
                let (system, user) = prompts::trait_detail_prompt(
                    &payload.entity,
                    &payload.name,
                    existing.as_ref(),
                    context,
                    &recent,
                );
                let detail: TraitDetail =
                    call_for_json(self.llm.as_ref(), &system, &user, &opts)
                        .await?
                        .context("Trait detail returned malformed JSON")?;
                let row = merge_trait(existing, &payload, &viewer, detail);
                store::upsert_trait(&self.db, &row).await?;
            }
            DataType::Topic => {
                let existing = store::get_topic(&self.db, &payload.entity, &payload.name).await?;
                let (system, user) = prompts::topic_detail_prompt(
                    &payload.entity,
                    &payload.name,
                    existing.as_ref(),
                    context,
                    &recent,
                );
                let detail: TopicDetail =
                    call_for_json(self.llm.as_ref(), &system, &user, &opts)
                        .await?
                        .context("Topic detail returned malformed JSON")?;
                let row = merge_topic(existing, &payload, &viewer, detail);
                store::upsert_topic(&self.db, &row).await?;
            }
            DataType::Person => {
                let existing = store::get_person(&self.db, &payload.entity, &payload.name).await?;
                let (system, user) = prompts::person_detail_prompt(
                    &payload.name,
                    existing.as_ref(),
                    context,
                    &recent,
                );
                let detail: PersonDetail =
                    call_for_json(self.llm.as_ref(), &system, &user, &opts)
                        .await?
                        .context("Person detail returned malformed JSON")?;
                let row = merge_person(existing, &payload, &viewer, detail);
                store::upsert_person(&self.db, &row).await?;
            }
        }

        if !payload.message_ids.is_empty() {
            history::mark_concept_processed(&self.db, &payload.message_ids).await?;
        }
        state::record_extraction(&self.db, &payload.entity, &payload.persona, payload.data_type)
            .await?;

        tracing::info!(
            "Detail update applied: {} '{}' on '{}'",
            payload.data_type.as_str(),
            payload.name,
            payload.entity
        );

        Ok(())
    }
}

fn merge_fact(
    existing: Option<FactRow>,
    payload: &DetailUpdatePayload,
    viewer: &PersonaRecord,
    detail: FactDetail,
) -> FactRow {
    let mut row = existing.unwrap_or_else(|| FactRow {
        id: store::new_row_id(),
        entity: payload.entity.clone(),
        name: payload.name.clone(),
        description: String::new(),
        sentiment: 0.0,
        confidence: 0.0,
        last_confirmed: None,
        persona_groups: Default::default(),
        learned_by: Some(viewer.name.clone()),
    });

    row.description = detail.description;
    row.sentiment = detail.sentiment;
    // Confidence never moves backwards on a merge.
    row.confidence = row.confidence.max(detail.confidence);
    if row.learned_by.is_none() {
        row.learned_by = Some(viewer.name.clone());
    }
    visibility::tag_row_on_write(&mut row.persona_groups, viewer);
    row
}

fn merge_trait(
    existing: Option<TraitRow>,
    payload: &DetailUpdatePayload,
    viewer: &PersonaRecord,
    detail: TraitDetail,
) -> TraitRow {
    let mut row = existing.unwrap_or_else(|| TraitRow {
        id: store::new_row_id(),
        entity: payload.entity.clone(),
        name: payload.name.clone(),
        description: String::new(),
        sentiment: 0.0,
        strength: 0.5,
        persona_groups: Default::default(),
        learned_by: Some(viewer.name.clone()),
    });

    row.description = detail.description;
    row.sentiment = detail.sentiment;
    row.strength = detail.strength;
    if row.learned_by.is_none() {
        row.learned_by = Some(viewer.name.clone());
    }
    visibility::tag_row_on_write(&mut row.persona_groups, viewer);
    row
}

fn merge_topic(
    existing: Option<TopicRow>,
    payload: &DetailUpdatePayload,
    viewer: &PersonaRecord,
    detail: TopicDetail,
) -> TopicRow {
    let mut row = existing.unwrap_or_else(|| TopicRow {
        id: store::new_row_id(),
        entity: payload.entity.clone(),
        name: payload.name.clone(),
        description: String::new(),
        sentiment: 0.0,
        level_current: 0.5,
        level_ideal: 0.5,
        last_updated: Utc::now(),
        persona_groups: Default::default(),
        learned_by: Some(viewer.name.clone()),
    });

    row.description = detail.description;
    row.sentiment = detail.sentiment;
    row.level_current = detail.level_current;
    row.level_ideal = detail.level_ideal;
    row.last_updated = Utc::now();
    if row.learned_by.is_none() {
        row.learned_by = Some(viewer.name.clone());
    }
    visibility::tag_row_on_write(&mut row.persona_groups, viewer);
    row
}

fn merge_person(
    existing: Option<PersonRow>,
    payload: &DetailUpdatePayload,
    viewer: &PersonaRecord,
    detail: PersonDetail,
) -> PersonRow {
    let mut row = existing.unwrap_or_else(|| PersonRow {
        id: store::new_row_id(),
        entity: payload.entity.clone(),
        name: payload.name.clone(),
        relationship: String::new(),
        description: String::new(),
        sentiment: 0.0,
        level_current: 0.5,
        level_ideal: 0.5,
        last_updated: Utc::now(),
        persona_groups: Default::default(),
        learned_by: Some(viewer.name.clone()),
    });

    row.relationship = detail.relationship;
    row.description = detail.description;
    row.sentiment = detail.sentiment;
    row.level_current = detail.level_current;
    row.level_ideal = detail.level_ideal;
    row.last_updated = Utc::now();
    if row.learned_by.is_none() {
        row.learned_by = Some(viewer.name.clone());
    }
    visibility::tag_row_on_write(&mut row.persona_groups, viewer);
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::HUMAN_ENTITY;

    fn viewer_with_group(group: Option<&str>) -> PersonaRecord {
        let mut p = PersonaRecord::new("bob".to_string());
        p.group_primary = group.map(|g| g.to_string());
        p
    }

    fn payload(name: &str, data_type: DataType) -> DetailUpdatePayload {
        DetailUpdatePayload {
            persona: "bob".to_string(),
            entity: HUMAN_ENTITY.to_string(),
            data_type,
            name: name.to_string(),
            context: None,
            message_ids: vec![],
        }
    }

    #[test]
    fn test_merge_fact_never_demotes_confidence() {
        let existing = FactRow {
            id: "f1".to_string(),
            entity: HUMAN_ENTITY.to_string(),
            name: "Birthday".to_string(),
            description: "in May".to_string(),
            sentiment: 0.2,
            confidence: 0.9,
            last_confirmed: None,
            persona_groups: Default::default(),
            learned_by: Some("ei".to_string()),
        };

        let merged = merge_fact(
            Some(existing),
            &payload("Birthday", DataType::Fact),
            &viewer_with_group(None),
            FactDetail {
                description: "birthday in May, dislikes parties".to_string(),
                sentiment: 0.1,
                confidence: 0.4,
            },
        );

        assert_eq!(merged.confidence, 0.9);
        assert_eq!(merged.learned_by.as_deref(), Some("ei"));
        assert_eq!(merged.description, "birthday in May, dislikes parties");
    }

    #[test]
    fn test_merge_fact_new_row_attributed_to_viewer() {
        let merged = merge_fact(
            None,
            &payload("Coffee", DataType::Fact),
            &viewer_with_group(Some("fantasy")),
            FactDetail {
                description: "drinks too much coffee".to_string(),
                sentiment: 0.0,
                confidence: 0.7,
            },
        );

        assert_eq!(merged.learned_by.as_deref(), Some("bob"));
        assert!(merged.persona_groups.contains("fantasy"));
        assert_eq!(merged.confidence, 0.7);
    }

    #[test]
    fn test_merge_topic_refreshes_last_updated() {
        let stale = Utc::now() - chrono::Duration::days(30);
        let existing = TopicRow {
            id: "t1".to_string(),
            entity: HUMAN_ENTITY.to_string(),
            name: "sailing".to_string(),
            description: String::new(),
            sentiment: 0.0,
            level_current: 0.2,
            level_ideal: 0.6,
            last_updated: stale,
            persona_groups: Default::default(),
            learned_by: None,
        };

        let merged = merge_topic(
            Some(existing),
            &payload("sailing", DataType::Topic),
            &viewer_with_group(None),
            TopicDetail {
                description: "weekend sailing".to_string(),
                sentiment: 0.5,
                level_current: 0.8,
                level_ideal: 0.6,
            },
        );

        assert!(merged.last_updated > stale);
        assert_eq!(merged.level_current, 0.8);
        // learned_by backfilled by the merging persona.
        assert_eq!(merged.learned_by.as_deref(), Some("bob"));
    }
}
