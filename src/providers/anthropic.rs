use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::ProviderSettings;
use crate::llm_manager::{GenerationOptions, LLMProvider, ServiceError};
use crate::providers::error_from_response;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: usize,
    output_tokens: usize,
}

/// Anthropic Messages API provider. Has no JSON mode, so `strict_json` is ignored.
pub struct AnthropicProvider {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(settings: &ProviderSettings, api_key: String, client: reqwest::Client) -> Self {
        Self {
            api_key,
            model: settings.model(),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
        }
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "Anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, ServiceError> {
        let request = AnthropicRequest {
            model: &self.model,
            messages: vec![AnthropicMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: options.max_output_tokens,
            temperature: options.temperature.min(1.0),
        };

        let response = self
            .client
            .post(format!("{}/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let response_text = response.text().await?;
        debug!("Raw Anthropic response: {}", response_text);

        let api_response: AnthropicResponse = serde_json::from_str(&response_text).map_err(|e| {
            ServiceError::Unknown(format!("Failed to parse Anthropic API response: {}", e))
        })?;

        match api_response.stop_reason.as_deref() {
            Some("max_tokens") => warn!(
                "Anthropic response was truncated due to max_tokens limit ({}). Response may be incomplete.",
                options.max_output_tokens
            ),
            Some("end_turn") | None => {}
            Some(other) => warn!("Anthropic response stopped with reason: {}", other),
        }

        if let Some(usage) = &api_response.usage {
            info!(
                "Anthropic token usage - Input: {}, Output: {}",
                usage.input_tokens, usage.output_tokens
            );
        }

        api_response
            .content
            .into_iter()
            .find(|c| c.content_type == "text")
            .map(|c| c.text)
            .ok_or_else(|| ServiceError::Unknown("No text content in Anthropic response".to_string()))
    }
}
