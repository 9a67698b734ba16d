use std::path::PathBuf;

use crate::llm::Operation;

/// Runtime configuration resolved from `EI_*` environment variables.
///
/// Everything is read once at startup; components receive a clone rather
/// than consulting the environment themselves.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root data directory (`EI_DATA_PATH`, default `~/.ei`).
    pub data_dir: PathBuf,
    /// Global default model spec (`EI_LLM_MODEL`), e.g. `anthropic:claude-sonnet-4-5`.
    pub default_model: Option<String>,
    /// Per-operation model overrides (`EI_MODEL_RESPONSE` etc.).
    pub model_response: Option<String>,
    pub model_concept: Option<String>,
    pub model_generation: Option<String>,
    /// Custom OpenAI-compatible endpoint (`EI_LLM_BASE_URL` + `EI_LLM_API_KEY`).
    pub custom_base_url: Option<String>,
    pub custom_api_key: Option<String>,
    /// Log model/operation/duration for every gateway call (`EI_LOG_MODEL_USAGE`).
    pub log_usage: bool,
    /// Debug mode (`DEBUG`): verbose logging, dead-letter payload dumps.
    pub debug: bool,
    /// Skip the startup warning about a data dir inside a source checkout
    /// (`EI_SKIP_REPO_CHECK`).
    pub skip_repo_check: bool,
    /// Wall-clock time for the daily verification ceremony
    /// (`EI_CEREMONY_HOUR`/`EI_CEREMONY_MINUTE`, default 09:00 local).
    pub ceremony_hour: u8,
    pub ceremony_minute: u8,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("EI_DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        Self {
            data_dir,
            default_model: non_empty_var("EI_LLM_MODEL"),
            model_response: non_empty_var("EI_MODEL_RESPONSE"),
            model_concept: non_empty_var("EI_MODEL_CONCEPT"),
            model_generation: non_empty_var("EI_MODEL_GENERATION"),
            custom_base_url: non_empty_var("EI_LLM_BASE_URL"),
            custom_api_key: non_empty_var("EI_LLM_API_KEY"),
            log_usage: flag_var("EI_LOG_MODEL_USAGE"),
            debug: flag_var("DEBUG"),
            skip_repo_check: flag_var("EI_SKIP_REPO_CHECK"),
            ceremony_hour: clock_component(non_empty_var("EI_CEREMONY_HOUR"), 9, 23),
            ceremony_minute: clock_component(non_empty_var("EI_CEREMONY_MINUTE"), 0, 59),
        }
    }

    /// Warn when the data directory sits inside a source checkout, where a
    /// `git clean` could eat the user's history. `EI_SKIP_REPO_CHECK`
    /// silences it.
    pub fn warn_if_inside_repo(&self) {
        if self.skip_repo_check {
            return;
        }
        let mut dir = self.data_dir.as_path();
        loop {
            if dir.join(".git").exists() {
                tracing::warn!(
                    "Data directory {} is inside a git checkout; set EI_SKIP_REPO_CHECK=1 to silence",
                    self.data_dir.display()
                );
                return;
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => return,
            }
        }
    }

    /// Model spec for an operation, before the persona override is applied.
    /// Fallback chain: operation env var -> global env var -> built-in default.
    pub fn model_for(&self, operation: Operation) -> String {
        let per_op = match operation {
            Operation::Response => &self.model_response,
            Operation::Concept => &self.model_concept,
            Operation::Generation => &self.model_generation,
        };

        per_op
            .clone()
            .or_else(|| self.default_model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }
}

/// Built-in fallback model when nothing is configured.
pub const DEFAULT_MODEL: &str = "anthropic:claude-sonnet-4-5-20250929";

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".ei")
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a clock component, falling back to the default when the value is
/// absent, unparseable, or out of range.
fn clock_component(value: Option<String>, default: u8, max: u8) -> u8 {
    match value {
        None => default,
        Some(raw) => match raw.trim().parse::<u8>() {
            Ok(v) if v <= max => v,
            _ => {
                tracing::warn!(
                    "Ignoring invalid ceremony time component '{}' (max {})",
                    raw,
                    max
                );
                default
            }
        },
    }
}

fn flag_var(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.trim().to_lowercase();
            !v.is_empty() && v != "0" && v != "false"
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            data_dir: PathBuf::from("/tmp/ei-test"),
            default_model: None,
            model_response: None,
            model_concept: None,
            model_generation: None,
            custom_base_url: None,
            custom_api_key: None,
            log_usage: false,
            debug: false,
            skip_repo_check: false,
            ceremony_hour: 9,
            ceremony_minute: 0,
        }
    }

    #[test]
    fn test_model_fallback_to_builtin() {
        let config = base_config();
        assert_eq!(config.model_for(Operation::Response), DEFAULT_MODEL);
    }

    #[test]
    fn test_model_fallback_to_global() {
        let mut config = base_config();
        config.default_model = Some("openai:gpt-5-mini".to_string());
        assert_eq!(config.model_for(Operation::Concept), "openai:gpt-5-mini");
    }

    #[test]
    fn test_clock_component_parsing() {
        assert_eq!(clock_component(None, 9, 23), 9);
        assert_eq!(clock_component(Some("7".to_string()), 9, 23), 7);
        assert_eq!(clock_component(Some(" 30 ".to_string()), 0, 59), 30);
        // Out of range or garbage falls back to the default.
        assert_eq!(clock_component(Some("24".to_string()), 9, 23), 9);
        assert_eq!(clock_component(Some("noon".to_string()), 9, 23), 9);
        assert_eq!(clock_component(Some("-5".to_string()), 0, 59), 0);
    }

    #[test]
    fn test_model_per_operation_wins() {
        let mut config = base_config();
        config.default_model = Some("openai:gpt-5-mini".to_string());
        config.model_concept = Some("ollama:qwen2.5:0.5b".to_string());
        assert_eq!(config.model_for(Operation::Concept), "ollama:qwen2.5:0.5b");
        assert_eq!(config.model_for(Operation::Response), "openai:gpt-5-mini");
    }
}
