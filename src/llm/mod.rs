//! Provider-agnostic LLM call layer.
//!
//! The engine only ever talks to the [`LlmClient`] trait; the rig-backed
//! [`gateway::LlmGateway`] is the production implementation and tests
//! substitute scripted ones.

pub mod gateway;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;

/// What kind of work a call is doing. Each operation can be routed to a
/// different model via the `EI_MODEL_*` env vars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Conversational replies shown to the user.
    Response,
    /// Data mining: fast scans, detail updates, ceremony parsing.
    Concept,
    /// Text generation chores: persona descriptions.
    Generation,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Response => "response",
            Operation::Concept => "concept",
            Operation::Generation => "generation",
        }
    }
}

/// Per-call options. Every call carries an abort token; cancellation is
/// cooperative and surfaces as [`LlmError::Aborted`].
#[derive(Debug, Clone)]
pub struct CallOpts {
    pub operation: Operation,
    /// Persona-level `provider:model` override, if any.
    pub model: Option<String>,
    pub cancel: CancellationToken,
}

impl CallOpts {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            model: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Configuration state of one provider, for `/model list`.
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub provider: String,
    pub env_var: String,
    pub configured: bool,
    /// Whether a call through this provider succeeded this session.
    pub validated: bool,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Plain completion: returns the assistant text.
    async fn complete(&self, system: &str, user: &str, opts: &CallOpts)
        -> Result<String, LlmError>;

    /// Completion that must yield JSON. Implementations retry once with a
    /// stricter "JSON only" reinforcement before giving up.
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        opts: &CallOpts,
    ) -> Result<serde_json::Value, LlmError>;

    /// Provider configuration report.
    fn provider_statuses(&self) -> Vec<ProviderStatus>;
}

/// Typed wrapper over [`LlmClient::complete_json`]. Returns `Ok(None)` when
/// the response parsed as JSON but not as `T`; callers treat that as a
/// failed task, not a crash.
pub async fn call_for_json<T: DeserializeOwned>(
    llm: &dyn LlmClient,
    system: &str,
    user: &str,
    opts: &CallOpts,
) -> Result<Option<T>, LlmError> {
    let value = llm.complete_json(system, user, opts).await?;
    match serde_json::from_value::<T>(value) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => {
            tracing::warn!("LLM JSON did not match expected shape: {}", e);
            Ok(None)
        }
    }
}

/// Pull a JSON document out of raw model output: direct parse first, then
/// with markdown fences stripped, then the widest brace-delimited slice.
pub fn extract_json(text: &str) -> Result<serde_json::Value, LlmError> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim);
    if let Some(inner) = unfenced {
        if let Ok(value) = serde_json::from_str(inner) {
            return Ok(value);
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }

    Err(LlmError::Parse(format!(
        "no JSON document found in {} chars of output",
        text.len()
    )))
}
