//! Shared test support: a scripted LLM standing in for the gateway.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use ei_lib::error::LlmError;
use ei_lib::llm::{extract_json, CallOpts, LlmClient, Operation, ProviderStatus};

/// What the scripted LLM should do for one call, in order.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Return this text.
    Text(String),
    /// Return this value serialized as JSON text.
    Json(serde_json::Value),
    /// Fail with a provider error carrying this message.
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub operation: Operation,
    pub system: String,
    pub user: String,
}

/// Deterministic [`LlmClient`]: pops scripted responses in order and
/// records every call. An optional per-call delay makes cancellation
/// observable.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Scripted>>,
    pub calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: Some(delay),
        }
    }

    pub fn push(&self, scripted: Scripted) {
        self.responses.lock().unwrap().push_back(scripted);
    }

    pub fn push_text(&self, text: &str) {
        self.push(Scripted::Text(text.to_string()));
    }

    pub fn push_json(&self, value: serde_json::Value) {
        self.push(Scripted::Json(value));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, operation: Operation) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        opts: &CallOpts,
    ) -> Result<String, LlmError> {
        if opts.cancel.is_cancelled() {
            return Err(LlmError::Aborted);
        }

        // Record at call start so aborted calls still count as begun.
        self.calls.lock().unwrap().push(RecordedCall {
            operation: opts.operation,
            system: system.to_string(),
            user: user.to_string(),
        });

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = opts.cancel.cancelled() => return Err(LlmError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Text(text)) => Ok(text),
            Some(Scripted::Json(value)) => Ok(value.to_string()),
            Some(Scripted::Fail(message)) => Err(LlmError::Provider(message)),
            None => Ok("Understood.".to_string()),
        }
    }

    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        opts: &CallOpts,
    ) -> Result<serde_json::Value, LlmError> {
        let text = self.complete(system, user, opts).await?;
        extract_json(&text)
    }

    fn provider_statuses(&self) -> Vec<ProviderStatus> {
        vec![ProviderStatus {
            provider: "scripted".to_string(),
            env_var: String::new(),
            configured: true,
            validated: true,
        }]
    }
}
