use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use thiserror::Error;

use crate::config::RetrySettings;
use crate::event_bus::{Event, EventBus};

/// Generation parameters passed with every completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_output_tokens: usize,
    /// Request JSON-only output from services that support it.
    pub strict_json: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_output_tokens: 1024,
            strict_json: false,
        }
    }
}

/// Failure reported by a completion service. Opaque to the interpreter.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("quota exceeded or rate limited: {message}")]
    QuotaOrRateLimit {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected service error: {0}")]
    Unknown(String),
}

impl ServiceError {
    /// Whether a retry with the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::QuotaOrRateLimit { .. } | ServiceError::Transport(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::QuotaOrRateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => ServiceError::Auth(message),
            // Gemini reports a bad key as 400 INVALID_ARGUMENT
            400 if message.contains("API key") => ServiceError::Auth(message),
            429 => ServiceError::QuotaOrRateLimit {
                message,
                retry_after,
            },
            404 => ServiceError::ModelUnavailable(message),
            408 | 500..=599 => ServiceError::Transport(format!("HTTP {}: {}", status, message)),
            _ => ServiceError::Unknown(format!("HTTP {}: {}", status, message)),
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            ServiceError::Transport(err.to_string())
        } else {
            ServiceError::Unknown(err.to_string())
        }
    }
}

/// Trait representing a text completion service.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Name of the provider.
    fn name(&self) -> &str;

    /// Model name of the provider.
    fn model_name(&self) -> &str {
        "Unknown"
    }

    /// Whether `strict_json` is honoured. Providers that ignore it may still
    /// return prose around the JSON.
    fn supports_strict_json(&self) -> bool {
        false
    }

    /// Send a prompt and return the raw completion text.
    async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, ServiceError>;
}

/// Offline provider that answers with a canned plan for the goal in the prompt.
pub struct LocalProvider;

impl LocalProvider {
    pub fn new() -> Self {
        Self
    }

    fn goal_from_prompt(prompt: &str) -> &str {
        const MARKER: &str = "The user's goal is: \"";
        prompt
            .find(MARKER)
            .map(|start| &prompt[start + MARKER.len()..])
            .and_then(|rest| rest.find("\"\n").map(|end| &rest[..end]))
            .unwrap_or("your goal")
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn model_name(&self) -> &str {
        "canned"
    }

    fn supports_strict_json(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, ServiceError> {
        let goal = Self::goal_from_prompt(prompt);
        let plan = serde_json::json!({
            "plan": [
                {
                    "task_id": 1,
                    "task_name": format!("Define scope: {}", goal),
                    "description": "List outcomes, constraints and success criteria.",
                    "dependencies": [],
                    "duration_days": 2
                },
                {
                    "task_id": 2,
                    "task_name": "Research and design",
                    "description": "Survey options and settle on an approach.",
                    "dependencies": [1],
                    "duration_days": 5
                },
                {
                    "task_id": 3,
                    "task_name": "Build",
                    "description": "Carry out the main body of work.",
                    "dependencies": [2],
                    "duration_days": 10
                },
                {
                    "task_id": 4,
                    "task_name": "Review and launch",
                    "description": "Check the result against the success criteria and release it.",
                    "dependencies": [1, 3],
                    "duration_days": 3
                }
            ]
        });
        if options.strict_json {
            Ok(plan.to_string())
        } else {
            Ok(format!(
                "Here is your plan:\n```json\n{}\n```",
                serde_json::to_string_pretty(&plan).unwrap_or_else(|_| plan.to_string())
            ))
        }
    }
}

/// Wraps the active provider with retry on transient errors and event reporting.
pub struct LLMManager {
    provider: Box<dyn LLMProvider>,
    event_bus: Option<Arc<EventBus>>,
    retry: RetrySettings,
}

impl LLMManager {
    pub fn new(
        provider: Box<dyn LLMProvider>,
        event_bus: Option<Arc<EventBus>>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            provider,
            event_bus,
            retry,
        }
    }

    /// Get the active provider.
    pub fn provider(&self) -> &dyn LLMProvider {
        &*self.provider
    }

    /// Send a prompt, retrying rate limits and transport failures up to `max_retries` times.
    pub async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, ServiceError> {
        let provider = &self.provider;
        if options.strict_json && !provider.supports_strict_json() {
            info!(
                "{} does not support strict JSON mode; relying on response interpretation",
                provider.name()
            );
        }

        let mut attempt: u32 = 0;
        loop {
            self.emit(Event::APICallStarted {
                provider: provider.name().to_string(),
                model: provider.model_name().to_string(),
                attempt: attempt + 1,
            })
            .await;

            match provider.complete(prompt, options).await {
                Ok(response) => {
                    // Rough estimate: 1 token ≈ 4 characters
                    let tokens = (prompt.len() + response.len()) / 4;
                    self.emit(Event::APICallCompleted {
                        provider: provider.name().to_string(),
                        tokens,
                    })
                    .await;
                    return Ok(response);
                }
                Err(err) => {
                    self.emit(Event::APIError {
                        provider: provider.name().to_string(),
                        error: err.to_string(),
                    })
                    .await;

                    if !err.is_transient() || attempt >= self.retry.max_retries {
                        return Err(err);
                    }

                    let delay = self.retry.delay_for(attempt, err.retry_after());
                    attempt += 1;
                    warn!(
                        "{} call failed ({}); retry {}/{} in {:?}",
                        provider.name(),
                        err,
                        attempt,
                        self.retry.max_retries,
                        delay
                    );
                    self.emit(Event::RetryScheduled {
                        provider: provider.name().to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    })
                    .await;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(event).await;
        }
    }
}
