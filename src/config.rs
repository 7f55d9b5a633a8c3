use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm_manager::GenerationOptions;

/// Environment variable that overrides the configured model name.
pub const MODEL_ENV_VAR: &str = "GENAI_MODEL";

/// Problems with the assembled configuration, reported instead of exiting.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("{env_var} not found; set it in the environment or a .env file to use the {provider} provider")]
    MissingApiKey { provider: String, env_var: String },
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Main configuration structure for smart_task_planner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Completion service selection
    #[serde(default)]
    pub provider: ProviderSettings,

    /// Generation parameters sent with every request
    #[serde(default)]
    pub generation: GenerationSettings,

    /// Retry policy for transient service errors
    #[serde(default)]
    pub retry: RetrySettings,

    /// Terminal display configuration
    #[serde(default)]
    pub ui: UIConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Gemini,
    #[value(name = "openai")]
    OpenAI,
    Anthropic,
    /// Offline provider returning a canned plan
    Local,
}

impl ProviderKind {
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini-2.5-flash",
            ProviderKind::OpenAI => "gpt-4.1-mini",
            ProviderKind::Anthropic => "claude-sonnet-4-0",
            ProviderKind::Local => "canned",
        }
    }

    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Gemini => Some("GOOGLE_API_KEY"),
            ProviderKind::OpenAI => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Local => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Gemini => write!(f, "gemini"),
            ProviderKind::OpenAI => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Which completion service to call
    #[serde(default)]
    pub kind: ProviderKind,

    /// Model to use; each provider has its own default
    pub model: Option<String>,

    /// Environment variable holding the API key
    pub api_key_env: Option<String>,

    /// Override the provider's API endpoint
    pub base_url: Option<String>,

    /// Request timeout; the HTTP client default applies when unset
    pub timeout_secs: Option<u64>,
}

impl ProviderSettings {
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.kind.default_model().to_string())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,

    /// Ask services that support it for JSON-only output
    #[serde(default = "default_strict_json")]
    pub strict_json: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            strict_json: default_strict_json(),
        }
    }
}

impl GenerationSettings {
    pub fn options(&self) -> GenerationOptions {
        GenerationOptions {
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            strict_json: self.strict_json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Extra attempts after the first call, for rate limits and transport errors only
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetrySettings {
    const MAX_DELAY: Duration = Duration::from_secs(30);

    /// Delay before retry number `attempt` (0-based): the server's hint if any,
    /// otherwise exponential backoff from `base_delay_ms`, capped at 30s.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(Self::MAX_DELAY);
        }
        let multiplier = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier)).min(Self::MAX_DELAY)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Terminal,
    Json,
    Plain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UIConfig {
    /// Enable colorful output
    #[serde(default = "default_colorful")]
    pub colorful: bool,

    #[serde(default)]
    pub output_format: OutputFormat,

    /// How much of a failed candidate to show before truncating
    #[serde(default = "default_candidate_preview_chars")]
    pub candidate_preview_chars: usize,
}

impl Default for UIConfig {
    fn default() -> Self {
        Self {
            colorful: default_colorful(),
            output_format: OutputFormat::default(),
            candidate_preview_chars: default_candidate_preview_chars(),
        }
    }
}

/// Command-line values that take precedence over the file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<usize>,
    pub strict_json: bool,
    pub output_format: Option<OutputFormat>,
    pub no_color: bool,
}

// Default value functions
fn default_temperature() -> f32 { 0.0 }
fn default_max_output_tokens() -> usize { 1024 }
fn default_strict_json() -> bool { false }
fn default_max_retries() -> u32 { 2 }
fn default_base_delay_ms() -> u64 { 1000 }
fn default_colorful() -> bool { true }
fn default_candidate_preview_chars() -> usize { 2000 }

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))
    }

    /// Load configuration from command line argument or default locations
    pub fn load(config_path: &Option<String>) -> Result<Self> {
        if let Some(path) = config_path {
            let expanded = shellexpand::tilde(path);
            return Self::from_file(expanded.as_ref());
        }

        let default_paths = [
            "smart_task_planner.toml",
            ".smart_task_planner.toml",
            "~/.config/smart_task_planner/config.toml",
        ];

        for path in default_paths {
            let expanded_path = shellexpand::tilde(path);
            if Path::new(expanded_path.as_ref()).exists() {
                match Self::from_file(expanded_path.as_ref()) {
                    Ok(config) => {
                        info!("Loaded configuration from {}", path);
                        return Ok(config);
                    }
                    Err(e) => warn!("Failed to load config from {}: {:#}", path, e),
                }
            }
        }

        Ok(Self::default())
    }

    /// Apply environment overrides through `lookup` so callers decide where values come from.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup(MODEL_ENV_VAR).filter(|m| !m.trim().is_empty()) {
            self.provider.model = Some(model.trim().to_string());
        }
    }

    /// Merge with command-line arguments (CLI args take precedence)
    pub fn merge_with_args(&mut self, overrides: &Overrides) {
        if let Some(kind) = overrides.provider {
            if kind != self.provider.kind {
                self.provider.kind = kind;
                self.provider.api_key_env = None;
                self.provider.base_url = None;
                self.provider.model = None;
            }
        }
        if let Some(model) = &overrides.model {
            self.provider.model = Some(model.clone());
        }
        if let Some(temperature) = overrides.temperature {
            self.generation.temperature = temperature;
        }
        if let Some(max_output_tokens) = overrides.max_output_tokens {
            self.generation.max_output_tokens = max_output_tokens;
        }
        if overrides.strict_json {
            self.generation.strict_json = true;
        }
        if let Some(format) = overrides.output_format {
            self.ui.output_format = format;
        }
        if overrides.no_color || self.ui.output_format != OutputFormat::Terminal {
            self.ui.colorful = false;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let temperature = self.generation.temperature;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigurationError::InvalidValue {
                field: "generation.temperature".to_string(),
                message: format!("{} is outside 0.0..=2.0", temperature),
            });
        }
        if self.generation.max_output_tokens == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "generation.max_output_tokens".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.provider.model().trim().is_empty() {
            return Err(ConfigurationError::InvalidValue {
                field: "provider.model".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve the API key for the configured provider. `Ok(None)` means none is needed.
    pub fn resolve_api_key<F>(&self, lookup: F) -> Result<Option<String>, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_var = match &self.provider.api_key_env {
            Some(var) => var.clone(),
            None => match self.provider.kind.default_api_key_env() {
                Some(var) => var.to_string(),
                None => return Ok(None),
            },
        };
        match lookup(&env_var).filter(|key| !key.trim().is_empty()) {
            Some(key) => Ok(Some(key.trim().to_string())),
            None => Err(ConfigurationError::MissingApiKey {
                provider: self.provider.kind.to_string(),
                env_var,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.provider.kind, ProviderKind::Gemini);
        assert_eq!(config.provider.model(), "gemini-2.5-flash");
        assert_eq!(config.generation.temperature, 0.0);
        assert_eq!(config.generation.max_output_tokens, 1024);
        assert_eq!(config.ui.candidate_preview_chars, 2000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [provider]
            kind = "openai"
            timeout_secs = 30

            [generation]
            strict_json = true

            [ui]
            output_format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.provider.kind, ProviderKind::OpenAI);
        assert_eq!(config.provider.model(), "gpt-4.1-mini");
        assert_eq!(config.provider.timeout(), Some(Duration::from_secs(30)));
        assert!(config.generation.strict_json);
        assert_eq!(config.generation.max_output_tokens, 1024);
        assert_eq!(config.ui.output_format, OutputFormat::Json);
        assert_eq!(config.retry.max_retries, 2);
    }

    #[test]
    fn test_missing_api_key_is_typed_error() {
        let config = Config::default();
        let err = config.resolve_api_key(env(&[])).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::MissingApiKey {
                provider: "gemini".to_string(),
                env_var: "GOOGLE_API_KEY".to_string(),
            }
        );
        assert!(err.to_string().starts_with("GOOGLE_API_KEY not found"));
    }

    #[test]
    fn test_api_key_lookup() {
        let mut config = Config::default();
        assert_eq!(
            config
                .resolve_api_key(env(&[("GOOGLE_API_KEY", " abc ")]))
                .unwrap(),
            Some("abc".to_string())
        );

        config.provider.api_key_env = Some("MY_KEY".to_string());
        assert!(config.resolve_api_key(env(&[("GOOGLE_API_KEY", "abc")])).is_err());

        config.provider.kind = ProviderKind::Local;
        config.provider.api_key_env = None;
        assert_eq!(config.resolve_api_key(env(&[])).unwrap(), None);
    }

    #[test]
    fn test_env_and_cli_precedence() {
        let mut config = Config::default();
        config.apply_env_overrides(env(&[(MODEL_ENV_VAR, "gemini-2.5-pro")]));
        assert_eq!(config.provider.model(), "gemini-2.5-pro");

        config.merge_with_args(&Overrides {
            model: Some("gemini-2.0-flash".to_string()),
            temperature: Some(0.3),
            strict_json: true,
            ..Overrides::default()
        });
        assert_eq!(config.provider.model(), "gemini-2.0-flash");
        assert_eq!(config.generation.temperature, 0.3);
        assert!(config.generation.strict_json);
        assert!(config.ui.colorful);
    }

    #[test]
    fn test_switching_provider_resets_model() {
        let mut config = Config::default();
        config.provider.model = Some("gemini-2.5-pro".to_string());
        config.merge_with_args(&Overrides {
            provider: Some(ProviderKind::Anthropic),
            ..Overrides::default()
        });
        assert_eq!(config.provider.model(), "claude-sonnet-4-0");
    }

    #[test]
    fn test_json_output_disables_color() {
        let mut config = Config::default();
        config.merge_with_args(&Overrides {
            output_format: Some(OutputFormat::Json),
            ..Overrides::default()
        });
        assert!(!config.ui.colorful);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.generation.temperature = 3.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));

        let mut config = Config::default();
        config.generation.max_output_tokens = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delay_backoff() {
        let retry = RetrySettings {
            max_retries: 3,
            base_delay_ms: 500,
        };
        assert_eq!(retry.delay_for(0, None), Duration::from_millis(500));
        assert_eq!(retry.delay_for(2, None), Duration::from_millis(2000));
        assert_eq!(retry.delay_for(20, None), Duration::from_secs(30));
        assert_eq!(
            retry.delay_for(0, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_from_file_reports_path() {
        let err = Config::from_file("/nonexistent/smart_task_planner.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/smart_task_planner.toml"));
    }
}
