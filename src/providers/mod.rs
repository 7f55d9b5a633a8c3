//! Concrete completion service bindings.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::config::{Config, ConfigurationError, ProviderKind};
use crate::llm_manager::{LLMProvider, LocalProvider, ServiceError};

pub mod anthropic;
pub mod gemini;
pub mod openai;

use anthropic::AnthropicProvider;
use gemini::GeminiProvider;
use openai::OpenAIProvider;

/// Build the provider selected in `config`, resolving its key through `lookup`.
pub fn build<F>(config: &Config, lookup: F) -> Result<Box<dyn LLMProvider>, ConfigurationError>
where
    F: Fn(&str) -> Option<String>,
{
    let settings = &config.provider;
    let provider: Box<dyn LLMProvider> = match settings.kind {
        ProviderKind::Local => Box::new(LocalProvider::new()),
        ProviderKind::Gemini => {
            let (api_key, client) = credentials(config, lookup)?;
            Box::new(GeminiProvider::new(settings, api_key, client))
        }
        ProviderKind::OpenAI => {
            let (api_key, client) = credentials(config, lookup)?;
            Box::new(OpenAIProvider::new(settings, api_key, client))
        }
        ProviderKind::Anthropic => {
            let (api_key, client) = credentials(config, lookup)?;
            Box::new(AnthropicProvider::new(settings, api_key, client))
        }
    };
    Ok(provider)
}

fn credentials<F>(config: &Config, lookup: F) -> Result<(String, reqwest::Client), ConfigurationError>
where
    F: Fn(&str) -> Option<String>,
{
    let api_key = config.resolve_api_key(lookup)?.ok_or_else(|| {
        ConfigurationError::InvalidValue {
            field: "provider.api_key_env".to_string(),
            message: format!("no API key variable known for {}", config.provider.kind),
        }
    })?;
    Ok((api_key, http_client(config.provider.timeout())?))
}

fn http_client(timeout: Option<Duration>) -> Result<reqwest::Client, ConfigurationError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| ConfigurationError::HttpClient(e.to_string()))
}

/// Seconds-form `Retry-After` header, if present.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Turn a non-success response into a `ServiceError`, preferring the
/// `error.message` field when the body is the usual JSON error envelope.
pub(crate) async fn error_from_response(response: reqwest::Response) -> ServiceError {
    let status = response.status().as_u16();
    let retry_after = retry_after(response.headers());
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => return ServiceError::from(e),
    };
    ServiceError::from_status(status, error_message(&body), retry_after)
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            let error = value.get("error")?;
            error
                .get("message")
                .and_then(|m| m.as_str())
                .or_else(|| error.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
