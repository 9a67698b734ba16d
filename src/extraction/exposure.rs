//! Phase C: deferred exposure analysis.
//!
//! When a session goes idle, one call judges how much the session engaged
//! each known topic and person; the resulting deltas land on
//! `level_current` and everything untouched decays by elapsed time.

use anyhow::{Context, Result};
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::decay;
use crate::entities::{clamp_unit, store, HUMAN_ENTITY};
use crate::history;
use crate::llm::call_for_json;

use super::{prompts, ExposureAnalysisPayload, ExtractionEngine};

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct ExposureResponse {
    /// Map of topic/person name to an exposure delta in [-1, 1].
    #[serde(default)]
    pub deltas: HashMap<String, f64>,
}

impl ExtractionEngine {
    pub async fn run_exposure_analysis(
        &self,
        payload: ExposureAnalysisPayload,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let messages = history::load_by_ids(&self.db, &payload.message_ids).await?;
        if messages.is_empty() {
            return Ok(());
        }

        // The session touches the persona's own topics plus the human's
        // topics and people.
        let persona_topics = store::list_topics(&self.db, &payload.persona).await?;
        let human_topics = store::list_topics(&self.db, HUMAN_ENTITY).await?;
        let human_people = store::list_people(&self.db, HUMAN_ENTITY).await?;

        let topic_names: Vec<String> = persona_topics
            .iter()
            .chain(human_topics.iter())
            .map(|t| t.name.clone())
            .collect();
        let people_names: Vec<String> = human_people.iter().map(|p| p.name.clone()).collect();

        if topic_names.is_empty() && people_names.is_empty() {
            return Ok(());
        }

        let (system, user) = prompts::exposure_prompt(&messages, &topic_names, &people_names);
        let opts = self.concept_opts(&payload.persona, cancel).await;

        let response: ExposureResponse =
            call_for_json(self.llm.as_ref(), &system, &user, &opts)
                .await?
                .context("Exposure analysis returned malformed JSON")?;

        let lowered: HashMap<String, f64> = response
            .deltas
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        let now = Utc::now();

        for topic in persona_topics.iter().chain(human_topics.iter()) {
            match lowered.get(&topic.name.to_lowercase()) {
                Some(delta) => {
                    let level = clamp_unit(topic.level_current + delta);
                    store::set_topic_level(&self.db, &topic.entity, &topic.name, level, now)
                        .await?;
                }
                None => {
                    let hours = (now - topic.last_updated).num_minutes() as f64 / 60.0;
                    if let Some(level) =
                        decay::apply_decay(topic.level_current, topic.level_ideal, hours)
                    {
                        store::set_topic_level(&self.db, &topic.entity, &topic.name, level, now)
                            .await?;
                    }
                }
            }
        }

        for person in &human_people {
            match lowered.get(&person.name.to_lowercase()) {
                Some(delta) => {
                    let level = clamp_unit(person.level_current + delta);
                    store::set_person_level(&self.db, &person.entity, &person.name, level, now)
                        .await?;
                }
                None => {
                    let hours = (now - person.last_updated).num_minutes() as f64 / 60.0;
                    if let Some(level) =
                        decay::apply_decay(person.level_current, person.level_ideal, hours)
                    {
                        store::set_person_level(&self.db, &person.entity, &person.name, level, now)
                            .await?;
                    }
                }
            }
        }

        tracing::info!(
            "Exposure analysis applied for '{}' ({} deltas)",
            payload.persona,
            lowered.len()
        );

        Ok(())
    }
}
