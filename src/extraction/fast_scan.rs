//! Phase A: the fast scan.
//!
//! One cheap classification call over a stretch of messages decides what
//! was discussed and what might be new, then routes follow-up work by
//! confidence: high/medium proposals become detail updates, low ones go to
//! human verification. Nothing is written to the entity documents here.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::entities::{store, DataType, HUMAN_ENTITY};
use crate::history;
use crate::llm::call_for_json;
use crate::queue::{Priority, TaskType};

use super::{
    prompts, state, Confidence, DetailUpdatePayload, ExtractionEngine, FastScanPayload,
    FastScanResponse, ScanTarget, ValidationPayload,
};

/// A scan result item after post-processing, ready for routing.
#[derive(Debug)]
struct RoutedItem {
    name: String,
    kind: DataType,
    confidence: Confidence,
    reason: Option<String>,
}

impl ExtractionEngine {
    pub async fn run_fast_scan(
        &self,
        payload: FastScanPayload,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let messages = history::load_by_ids(&self.db, &payload.message_ids).await?;
        if messages.is_empty() {
            return Ok(());
        }

        let entity = match payload.target {
            ScanTarget::Human => HUMAN_ENTITY.to_string(),
            ScanTarget::System => payload.persona.clone(),
        };

        let known = self.known_items(&entity, payload.target).await?;
        let persona_names = self.registry.lock().await.all_names_and_aliases();

        let (system, user) =
            prompts::fast_scan_prompt(&payload.persona, payload.target, &messages, &known);
        let opts = self.concept_opts(&payload.persona, cancel).await;

        let response: FastScanResponse =
            call_for_json(self.llm.as_ref(), &system, &user, &opts)
                .await?
                .context("Fast scan returned malformed JSON")?;

        let items = self
            .post_process(&payload, response, &persona_names)
            .await?;

        for item in items {
            self.route_item(&payload, &entity, item).await?;
        }

        // Persona traits never come from general conversation; explicit
        // behavior-change requests are the only path.
        if payload.target == ScanTarget::System {
            self.detect_behavior_change(&payload.persona, &messages, cancel)
                .await?;
        }

        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        history::mark_concept_processed(&self.db, &ids).await?;

        tracing::debug!(
            "Fast scan done for '{}' ({:?}, {} messages)",
            payload.persona,
            payload.target,
            ids.len()
        );

        Ok(())
    }

    /// Names the scan should treat as already known, per bucket.
    async fn known_items(
        &self,
        entity: &str,
        target: ScanTarget,
    ) -> Result<Vec<(DataType, String)>> {
        let mut known = Vec::new();

        for t in store::list_traits(&self.db, entity).await? {
            known.push((DataType::Trait, t.name));
        }
        for t in store::list_topics(&self.db, entity).await? {
            known.push((DataType::Topic, t.name));
        }

        if target == ScanTarget::Human {
            for f in store::list_facts(&self.db, entity).await? {
                known.push((DataType::Fact, f.name));
            }
            for p in store::list_people(&self.db, entity).await? {
                known.push((DataType::Person, p.name));
            }
        }

        Ok(known)
    }

    /// Apply the deterministic filters: persona-name collisions, bucket
    /// restrictions per target, and the fact/trait frequency gates.
    async fn post_process(
        &self,
        payload: &FastScanPayload,
        response: FastScanResponse,
        persona_names: &[String],
    ) -> Result<Vec<RoutedItem>> {
        let fact_gate = self.gate_open(payload, DataType::Fact).await?;
        let trait_gate = self.gate_open(payload, DataType::Trait).await?;

        let mut items: Vec<RoutedItem> = Vec::new();

        for m in response.mentioned {
            items.push(RoutedItem {
                name: m.name,
                kind: m.kind,
                confidence: m.confidence,
                reason: None,
            });
        }
        for n in response.new_items {
            // Proposed items that collide with a persona identity are
            // scan artifacts, not knowledge.
            if persona_names.iter().any(|p| p.eq_ignore_ascii_case(&n.name)) {
                tracing::debug!("Dropping new item '{}': matches a persona name", n.name);
                continue;
            }
            items.push(RoutedItem {
                name: n.name,
                kind: n.kind,
                confidence: n.confidence,
                reason: n.reason,
            });
        }

        items.retain(|item| match payload.target {
            // Personas track only topics here; traits move through the
            // behavior-change tiers.
            ScanTarget::System => item.kind == DataType::Topic,
            ScanTarget::Human => match item.kind {
                DataType::Fact => fact_gate,
                DataType::Trait => trait_gate,
                DataType::Topic | DataType::Person => true,
            },
        });

        Ok(items)
    }

    async fn gate_open(&self, payload: &FastScanPayload, data_type: DataType) -> Result<bool> {
        if payload.target != ScanTarget::Human {
            return Ok(false);
        }
        let s = state::get_state(&self.db, HUMAN_ENTITY, &payload.persona, data_type).await?;
        Ok(state::should_extract(data_type, &s))
    }

    async fn route_item(
        &self,
        payload: &FastScanPayload,
        entity: &str,
        item: RoutedItem,
    ) -> Result<()> {
        match item.confidence {
            Confidence::High | Confidence::Medium => {
                self.queue
                    .enqueue(
                        TaskType::DetailUpdate,
                        Priority::Normal,
                        &DetailUpdatePayload {
                            persona: payload.persona.clone(),
                            entity: entity.to_string(),
                            data_type: item.kind,
                            name: item.name,
                            context: item.reason,
                            message_ids: payload.message_ids.clone(),
                        },
                    )
                    .await?;
            }
            Confidence::Low => {
                self.queue
                    .enqueue(
                        TaskType::EiValidation,
                        Priority::Low,
                        &ValidationPayload {
                            validation_type: "data_confirm".to_string(),
                            persona: payload.persona.clone(),
                            entity: entity.to_string(),
                            data_type: item.kind,
                            name: item.name,
                            confidence: item.confidence,
                            reason: item.reason,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
