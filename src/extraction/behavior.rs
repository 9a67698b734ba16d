//! Three-tier behavior-change detection for persona traits.
//!
//! Persona traits never move on ordinary conversation ("pirates say arr"
//! must not make the persona piratical). Tier 1 gates on an explicit
//! request; tier 2 extracts the specific behavior; tier 3 maps it onto a
//! new or existing trait row.

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::entities::{store, TraitRow};
use crate::history::{Message, Role};
use crate::llm::call_for_json;
use crate::queue::{Priority, TaskType};
use crate::visibility;

use super::{prompts, DescriptionRegenPayload, ExtractionEngine};

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct BehaviorGate {
    /// Whether the human explicitly asked for a behavior change.
    pub requests_change: bool,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct BehaviorExtract {
    /// The requested behavior, one sentence.
    pub behavior: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct BehaviorTrait {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub sentiment: f64,
    #[serde(default = "default_strength")]
    pub strength: f64,
}

fn default_strength() -> f64 {
    0.5
}

impl ExtractionEngine {
    /// Run the tiers over a stretch of conversation. Only human messages
    /// can request a change; without any, this is a no-op.
    pub(crate) async fn detect_behavior_change(
        &self,
        persona: &str,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let human_messages: Vec<Message> = messages
            .iter()
            .filter(|m| m.role == Role::Human)
            .cloned()
            .collect();
        if human_messages.is_empty() {
            return Ok(());
        }

        let opts = self.concept_opts(persona, cancel).await;

        // Tier 1: the gate.
        let (system, user) = prompts::behavior_gate_prompt(&human_messages);
        let gate: BehaviorGate = call_for_json(self.llm.as_ref(), &system, &user, &opts)
            .await?
            .context("Behavior gate returned malformed JSON")?;
        if !gate.requests_change {
            return Ok(());
        }

        // Tier 2: what exactly was requested.
        let (system, user) = prompts::behavior_extract_prompt(&human_messages);
        let extract: BehaviorExtract = call_for_json(self.llm.as_ref(), &system, &user, &opts)
            .await?
            .context("Behavior extraction returned malformed JSON")?;

        // Tier 3: map onto a trait row.
        let existing = store::list_traits(&self.db, persona).await?;
        let (system, user) = prompts::behavior_trait_prompt(persona, &extract.behavior, &existing);
        let mapped: BehaviorTrait = call_for_json(self.llm.as_ref(), &system, &user, &opts)
            .await?
            .context("Behavior trait mapping returned malformed JSON")?;

        let viewer = self
            .registry
            .lock()
            .await
            .get(persona)
            .cloned()
            .with_context(|| format!("Unknown persona: {}", persona))?;

        let prior = store::get_trait(&self.db, persona, &mapped.name).await?;
        let mut row = prior.unwrap_or_else(|| TraitRow {
            id: store::new_row_id(),
            entity: persona.to_string(),
            name: mapped.name.clone(),
            description: String::new(),
            sentiment: 0.0,
            strength: 0.5,
            persona_groups: Default::default(),
            learned_by: Some(viewer.name.clone()),
        });
        row.description = mapped.description;
        row.sentiment = mapped.sentiment;
        row.strength = mapped.strength;
        visibility::tag_row_on_write(&mut row.persona_groups, &viewer);

        store::upsert_trait(&self.db, &row).await?;

        // The persona's descriptions no longer reflect how it behaves.
        self.queue
            .enqueue(
                TaskType::DescriptionRegen,
                Priority::Low,
                &DescriptionRegenPayload {
                    persona: persona.to_string(),
                },
            )
            .await?;

        tracing::info!(
            "Behavior change applied to persona '{}': trait '{}'",
            persona,
            row.name
        );

        Ok(())
    }
}
