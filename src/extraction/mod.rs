//! Asynchronous knowledge extraction.
//!
//! Two-phase mining decoupled from the response path: a cheap fast-scan
//! classifies what a stretch of conversation touched and proposes new
//! items; per-item detail updates then merge single rows into the entity
//! documents. Low-confidence proposals detour through human verification
//! instead of being written directly.

pub mod behavior;
pub mod detail;
pub mod exposure;
pub mod fast_scan;
pub mod prompts;
pub mod state;

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::entities::DataType;
use crate::llm::{call_for_json, CallOpts, LlmClient, Operation};
use crate::personas::{PersonaRegistry, PRIMARY_PERSONA};
use crate::queue::TaskQueue;

/// Scan confidence, as reported by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Ascending order for ceremony batching: low sorts first.
    pub fn rank(&self) -> u8 {
        match self {
            Confidence::Low => 0,
            Confidence::Medium => 1,
            Confidence::High => 2,
        }
    }
}

/// Whose knowledge a scan is mining: the human's or the persona's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanTarget {
    Human,
    System,
}

// ---------------------------------------------------------------------------
// Queue payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastScanPayload {
    pub persona: String,
    pub target: ScanTarget,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailUpdatePayload {
    pub persona: String,
    pub entity: String,
    pub data_type: DataType,
    pub name: String,
    /// Scan reason or ceremony correction, fed into the prompt.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPayload {
    pub validation_type: String,
    pub persona: String,
    pub entity: String,
    pub data_type: DataType,
    pub name: String,
    pub confidence: Confidence,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptionRegenPayload {
    pub persona: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureAnalysisPayload {
    pub persona: String,
    pub message_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Fast-scan response shape
// ---------------------------------------------------------------------------

/// One already-known item the conversation touched.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScanItem {
    pub name: String,
    /// One of: fact, trait, topic, person.
    #[serde(rename = "type")]
    pub kind: DataType,
    pub confidence: Confidence,
}

/// A proposed new item with the model's reasoning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NewScanItem {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DataType,
    pub confidence: Confidence,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FastScanResponse {
    #[serde(default)]
    pub mentioned: Vec<ScanItem>,
    #[serde(default)]
    pub new_items: Vec<NewScanItem>,
}

/// Regenerated persona descriptions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DescriptionResponse {
    pub short_description: String,
    pub long_description: String,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the data-mining side of the system. Only the worker (and the
/// ceremony, for corrections) drives it.
pub struct ExtractionEngine {
    pub(crate) db: Pool<Sqlite>,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) registry: Arc<Mutex<PersonaRegistry>>,
}

impl ExtractionEngine {
    pub fn new(
        db: Pool<Sqlite>,
        llm: Arc<dyn LlmClient>,
        queue: Arc<TaskQueue>,
        registry: Arc<Mutex<PersonaRegistry>>,
    ) -> Self {
        Self {
            db,
            llm,
            queue,
            registry,
        }
    }

    /// Concept-operation call options carrying the persona's model
    /// override and the task's abort token.
    pub(crate) async fn concept_opts(&self, persona: &str, cancel: &CancellationToken) -> CallOpts {
        let model = self
            .registry
            .lock()
            .await
            .get(persona)
            .and_then(|p| p.model.clone());
        CallOpts::new(Operation::Concept)
            .with_model(model)
            .with_cancel(cancel.clone())
    }

    /// Regenerate a persona's short/long descriptions from its recent
    /// history. The primary persona's description is locked.
    pub async fn run_description_regen(
        &self,
        payload: DescriptionRegenPayload,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if payload.persona == PRIMARY_PERSONA {
            tracing::debug!("Skipping description regen for the primary persona");
            return Ok(());
        }

        let recent = crate::history::load_recent(&self.db, &payload.persona).await?;
        let traits = crate::entities::store::list_traits(&self.db, &payload.persona).await?;

        let (system, user) = prompts::description_regen_prompt(&payload.persona, &recent, &traits);
        let opts = CallOpts::new(Operation::Generation)
            .with_cancel(cancel.clone());

        let response: DescriptionResponse =
            call_for_json(self.llm.as_ref(), &system, &user, &opts)
                .await?
                .context("Description regen returned malformed JSON")?;

        self.registry.lock().await.update(&payload.persona, |p| {
            p.short_description = response.short_description.clone();
            p.long_description = response.long_description.clone();
            Ok(())
        })?;

        tracing::info!("Regenerated descriptions for persona '{}'", payload.persona);
        Ok(())
    }
}
