use thiserror::Error;

/// Errors produced by the LLM gateway.
///
/// Callers are expected to treat `Aborted` as a no-op: a cancelled call is
/// not a failure, it just means newer input superseded the request.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The call was cancelled via its abort token.
    #[error("LLM call aborted")]
    Aborted,

    /// The provider stopped generating before the response was complete.
    #[error("LLM response truncated")]
    Truncated,

    /// The provider rejected our credentials (HTTP 401/403).
    #[error("invalid or missing API key for {provider} (set {env_var})")]
    InvalidKey { provider: String, env_var: String },

    /// Rate limit still hit after all backoff retries.
    #[error("rate limited after {attempts} attempts: {message}")]
    RateLimited { attempts: u32, message: String },

    /// The response could not be parsed as JSON, even after the retry
    /// with the stricter reinforcement suffix.
    #[error("failed to parse LLM response as JSON: {0}")]
    Parse(String),

    /// No model could be resolved for the call.
    #[error("invalid model spec '{0}' (expected provider:model)")]
    InvalidModelSpec(String),

    /// Anything else the provider reported.
    #[error("LLM provider error: {0}")]
    Provider(String),
}

impl LlmError {
    /// Whether this error should be swallowed at the call boundary
    /// rather than surfaced to the user.
    pub fn is_aborted(&self) -> bool {
        matches!(self, LlmError::Aborted)
    }
}
