//! rig-backed gateway implementing [`LlmClient`].
//!
//! Clients are built per call (they are cheap handles over a shared HTTP
//! pool) so a persona-level model override never leaks into other calls.

use async_trait::async_trait;
use rig::client::{CompletionClient, Nothing};
use rig::completion::Prompt;
use rig::providers::{anthropic, gemini, ollama, openai, xai};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::LlmError;
use crate::llm::{extract_json, CallOpts, LlmClient, ProviderStatus};

/// Retries for rate-limited calls: 1s, 2s, 4s.
const MAX_ATTEMPTS: u32 = 3;

/// Appended to the system prompt when a JSON response failed to parse.
const JSON_REINFORCEMENT: &str =
    "\n\nIMPORTANT: Respond with valid JSON only. No markdown, no code fences, no prose.";

const ANTHROPIC_MAX_TOKENS: u64 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Anthropic,
    OpenAi,
    Google,
    XAi,
    Ollama,
    /// OpenAI-compatible endpoint at `EI_LLM_BASE_URL`.
    Custom,
}

impl Provider {
    pub fn parse(s: &str) -> Option<Provider> {
        match s.to_lowercase().as_str() {
            "anthropic" => Some(Provider::Anthropic),
            "openai" => Some(Provider::OpenAi),
            "google" | "gemini" => Some(Provider::Google),
            "xai" | "grok" => Some(Provider::XAi),
            "ollama" => Some(Provider::Ollama),
            "custom" => Some(Provider::Custom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAi => "openai",
            Provider::Google => "google",
            Provider::XAi => "xai",
            Provider::Ollama => "ollama",
            Provider::Custom => "custom",
        }
    }

    /// The env var holding this provider's API key.
    pub fn env_var(&self) -> &'static str {
        match self {
            Provider::Anthropic => "EI_ANTHROPIC_API_KEY",
            Provider::OpenAi => "EI_OPENAI_API_KEY",
            Provider::Google => "EI_GOOGLE_API_KEY",
            Provider::XAi => "EI_XAI_API_KEY",
            Provider::Ollama => "",
            Provider::Custom => "EI_LLM_API_KEY",
        }
    }

    fn needs_api_key(&self) -> bool {
        !matches!(self, Provider::Ollama)
    }

    const ALL: [Provider; 6] = [
        Provider::Anthropic,
        Provider::OpenAi,
        Provider::Google,
        Provider::XAi,
        Provider::Ollama,
        Provider::Custom,
    ];
}

/// A resolved `provider:model` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: Provider,
    pub model: String,
}

/// Parse a `provider:model` spec. The model part may itself contain
/// colons (`ollama:qwen2.5:0.5b`).
pub fn resolve_model(spec: &str) -> Result<ModelSpec, LlmError> {
    let (provider_str, model) = spec
        .split_once(':')
        .ok_or_else(|| LlmError::InvalidModelSpec(spec.to_string()))?;

    let provider = Provider::parse(provider_str)
        .ok_or_else(|| LlmError::InvalidModelSpec(spec.to_string()))?;

    if model.trim().is_empty() {
        return Err(LlmError::InvalidModelSpec(spec.to_string()));
    }

    Ok(ModelSpec {
        provider,
        model: model.to_string(),
    })
}

/// Production gateway over the rig provider clients.
pub struct LlmGateway {
    config: Config,
    /// Providers whose key succeeded this session. Validation is lazy:
    /// the first successful call validates.
    validated: Mutex<HashSet<Provider>>,
}

impl LlmGateway {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            validated: Mutex::new(HashSet::new()),
        }
    }

    fn resolve_for(&self, opts: &CallOpts) -> Result<ModelSpec, LlmError> {
        let spec = opts
            .model
            .clone()
            .unwrap_or_else(|| self.config.model_for(opts.operation));
        resolve_model(&spec)
    }

    fn api_key(&self, provider: Provider) -> Result<String, LlmError> {
        if !provider.needs_api_key() {
            return Ok(String::new());
        }
        if provider == Provider::Custom {
            return self
                .config
                .custom_api_key
                .clone()
                .ok_or_else(|| LlmError::InvalidKey {
                    provider: provider.as_str().to_string(),
                    env_var: provider.env_var().to_string(),
                });
        }
        std::env::var(provider.env_var())
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidKey {
                provider: provider.as_str().to_string(),
                env_var: provider.env_var().to_string(),
            })
    }

    /// One provider round-trip, no retries.
    async fn prompt_once(
        &self,
        spec: &ModelSpec,
        system: &str,
        user: &str,
    ) -> Result<String, LlmError> {
        let provider_err = |e: &dyn std::fmt::Display| LlmError::Provider(e.to_string());

        let result = match spec.provider {
            Provider::Anthropic => {
                let key = self.api_key(spec.provider)?;
                let client: anthropic::Client = anthropic::Client::builder()
                    .api_key(&key)
                    .build()
                    .map_err(|e| provider_err(&e))?;
                let agent = client
                    .agent(&spec.model)
                    .preamble(system)
                    .max_tokens(ANTHROPIC_MAX_TOKENS)
                    .build();
                agent.prompt(user).await
            }
            Provider::OpenAi => {
                let key = self.api_key(spec.provider)?;
                let client: openai::Client = openai::Client::builder()
                    .api_key(&key)
                    .build()
                    .map_err(|e| provider_err(&e))?;
                let agent = client
                    .completions_api()
                    .agent(&spec.model)
                    .preamble(system)
                    .build();
                agent.prompt(user).await
            }
            Provider::Google => {
                let key = self.api_key(spec.provider)?;
                let client: gemini::Client = gemini::Client::builder()
                    .api_key(&key)
                    .build()
                    .map_err(|e| provider_err(&e))?;
                let agent = client.agent(&spec.model).preamble(system).build();
                agent.prompt(user).await
            }
            Provider::XAi => {
                let key = self.api_key(spec.provider)?;
                let client: xai::Client = xai::Client::builder()
                    .api_key(&key)
                    .build()
                    .map_err(|e| provider_err(&e))?;
                let agent = client.agent(&spec.model).preamble(system).build();
                agent.prompt(user).await
            }
            Provider::Ollama => {
                let client: ollama::Client = if let Some(url) = &self.config.custom_base_url {
                    ollama::Client::builder()
                        .api_key(Nothing)
                        .base_url(url)
                        .build()
                        .map_err(|e| provider_err(&e))?
                } else {
                    ollama::Client::new(Nothing).map_err(|e| provider_err(&e))?
                };
                let agent = client.agent(&spec.model).preamble(system).build();
                agent.prompt(user).await
            }
            Provider::Custom => {
                let key = self.api_key(spec.provider)?;
                let base_url = self
                    .config
                    .custom_base_url
                    .clone()
                    .ok_or_else(|| LlmError::Provider("EI_LLM_BASE_URL is not set".to_string()))?;
                let client: openai::Client = openai::Client::builder()
                    .api_key(&key)
                    .base_url(&base_url)
                    .build()
                    .map_err(|e| provider_err(&e))?;
                let agent = client
                    .completions_api()
                    .agent(&spec.model)
                    .preamble(system)
                    .build();
                agent.prompt(user).await
            }
        };

        result.map_err(|e| classify_provider_error(spec.provider, &e.to_string()))
    }

    fn mark_validated(&self, provider: Provider) {
        if let Ok(mut set) = self.validated.lock() {
            set.insert(provider);
        }
    }
}

/// Map a provider error message onto the gateway taxonomy.
fn classify_provider_error(provider: Provider, message: &str) -> LlmError {
    let lowered = message.to_lowercase();

    if lowered.contains("401")
        || lowered.contains("403")
        || lowered.contains("unauthorized")
        || lowered.contains("invalid api key")
        || lowered.contains("invalid_api_key")
        || lowered.contains("authentication")
    {
        return LlmError::InvalidKey {
            provider: provider.as_str().to_string(),
            env_var: provider.env_var().to_string(),
        };
    }

    if lowered.contains("429")
        || lowered.contains("529")
        || lowered.contains("rate limit")
        || lowered.contains("rate_limit")
        || lowered.contains("overloaded")
    {
        return LlmError::RateLimited {
            attempts: 1,
            message: message.to_string(),
        };
    }

    if lowered.contains("truncat") || lowered.contains("max_tokens") {
        return LlmError::Truncated;
    }

    LlmError::Provider(message.to_string())
}

#[async_trait]
impl LlmClient for LlmGateway {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        opts: &CallOpts,
    ) -> Result<String, LlmError> {
        let spec = self.resolve_for(opts)?;
        let started = Instant::now();

        let mut attempt: u32 = 0;
        let text = loop {
            if opts.cancel.is_cancelled() {
                return Err(LlmError::Aborted);
            }

            let call = self.prompt_once(&spec, system, user);
            let result = tokio::select! {
                _ = opts.cancel.cancelled() => return Err(LlmError::Aborted),
                result = call => result,
            };

            match result {
                Ok(text) => break text,
                Err(LlmError::RateLimited { message, .. }) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(LlmError::RateLimited {
                            attempts: attempt,
                            message,
                        });
                    }
                    let backoff = Duration::from_secs(1u64 << (attempt - 1));
                    tracing::warn!(
                        "Rate limited by {} (attempt {}), backing off {:?}",
                        spec.provider.as_str(),
                        attempt,
                        backoff
                    );
                    tokio::select! {
                        _ = opts.cancel.cancelled() => return Err(LlmError::Aborted),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        };

        self.mark_validated(spec.provider);

        if self.config.log_usage {
            tracing::info!(
                operation = opts.operation.as_str(),
                model = %spec.model,
                provider = spec.provider.as_str(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "model usage"
            );
        }

        Ok(text)
    }

    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        opts: &CallOpts,
    ) -> Result<serde_json::Value, LlmError> {
        let first = self.complete(system, user, opts).await?;
        match extract_json(&first) {
            Ok(value) => Ok(value),
            Err(_) => {
                tracing::debug!("JSON parse failed, retrying with reinforcement suffix");
                let reinforced = format!("{}{}", system, JSON_REINFORCEMENT);
                let second = self.complete(&reinforced, user, opts).await?;
                extract_json(&second)
            }
        }
    }

    fn provider_statuses(&self) -> Vec<ProviderStatus> {
        let validated = self
            .validated
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();

        Provider::ALL
            .iter()
            .map(|p| {
                let configured = match p {
                    Provider::Ollama => true,
                    Provider::Custom => {
                        self.config.custom_base_url.is_some() && self.config.custom_api_key.is_some()
                    }
                    _ => std::env::var(p.env_var())
                        .map(|v| !v.trim().is_empty())
                        .unwrap_or(false),
                };
                ProviderStatus {
                    provider: p.as_str().to_string(),
                    env_var: p.env_var().to_string(),
                    configured,
                    validated: validated.contains(p),
                }
            })
            .collect()
    }
}
