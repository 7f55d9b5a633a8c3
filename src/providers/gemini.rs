use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::ProviderSettings;
use crate::llm_manager::{GenerationOptions, LLMProvider, ServiceError};
use crate::providers::error_from_response;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Gemini through its OpenAI-compatible chat completions endpoint
pub struct GeminiProvider {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct GeminiRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

impl GeminiProvider {
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

    fn build_request<'a>(&'a self, prompt: &'a str, options: &GenerationOptions) -> GeminiRequest<'a> {
        GeminiRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: options.max_output_tokens,
            temperature: options.temperature,
            response_format: options.strict_json.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        }
    }
}

#[async_trait]
impl LLMProvider for GeminiProvider {
    fn name(&self) -> &str {
        "Gemini"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn supports_strict_json(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, ServiceError> {
        let request = self.build_request(prompt, options);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let response_text = response.text().await?;
        debug!("Raw Gemini response: {}", response_text);

        let gemini_response: GeminiResponse = serde_json::from_str(&response_text)
            .map_err(|e| ServiceError::Unknown(format!("Failed to parse Gemini response: {}", e)))?;

        let choice = gemini_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::Unknown("No response choices from Gemini".to_string()))?;

        if choice.finish_reason.as_deref() == Some("length") {
            warn!(
                "Gemini response was truncated at max_output_tokens ({}). Response may be incomplete.",
                options.max_output_tokens
            );
        }

        if let Some(usage) = gemini_response.usage {
            info!(
                "Gemini token usage - Prompt: {}, Completion: {}, Total: {}",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }

        Ok(choice.message.content.unwrap_or_default())
    }
}
