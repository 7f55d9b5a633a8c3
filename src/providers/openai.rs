use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::ProviderSettings;
use crate::llm_manager::{GenerationOptions, LLMProvider, ServiceError};
use crate::providers::error_from_response;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI Responses API provider implementation
pub struct OpenAIProvider {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    input: &'a str,
    max_output_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<OpenAIReasoning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<TextOptions>,
}

#[derive(Debug, Serialize)]
struct OpenAIReasoning {
    effort: &'static str,
}

#[derive(Debug, Serialize)]
struct TextOptions {
    format: TextFormat,
}

#[derive(Debug, Serialize)]
struct TextFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Vec<ResponseItem>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ResponseItem {
    #[serde(rename = "type")]
    item_type: String,
    #[serde(default)]
    content: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: usize,
    output_tokens: usize,
    total_tokens: usize,
}

impl OpenAIProvider {
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

    /// Reasoning models reject `temperature`.
    fn is_reasoning_model(model: &str) -> bool {
        model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4")
    }

    fn build_request<'a>(&'a self, prompt: &'a str, options: &GenerationOptions) -> OpenAIRequest<'a> {
        let reasoning = Self::is_reasoning_model(&self.model);
        OpenAIRequest {
            model: &self.model,
            input: prompt,
            max_output_tokens: options.max_output_tokens,
            temperature: (!reasoning).then_some(options.temperature),
            reasoning: reasoning.then_some(OpenAIReasoning { effort: "low" }),
            text: options.strict_json.then_some(TextOptions {
                format: TextFormat {
                    format_type: "json_object",
                },
            }),
        }
    }

    fn output_text(response: &OpenAIResponse) -> String {
        response
            .output
            .iter()
            .filter(|item| item.item_type == "message")
            .flat_map(|item| item.content.iter())
            .filter(|c| c.content_type == "output_text" || c.content_type == "text")
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "OpenAI"
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
            .post(format!("{}/responses", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let response_text = response.text().await?;
        debug!("Raw OpenAI response: {}", response_text);

        let openai_response: OpenAIResponse = serde_json::from_str(&response_text)
            .map_err(|e| ServiceError::Unknown(format!("Failed to parse OpenAI response: {}", e)))?;

        if openai_response.status.as_deref() == Some("incomplete") {
            warn!(
                "OpenAI response is incomplete (max_output_tokens {}). Response may be truncated.",
                options.max_output_tokens
            );
        }

        if let Some(usage) = &openai_response.usage {
            info!(
                "OpenAI token usage - Input: {}, Output: {}, Total: {}",
                usage.input_tokens, usage.output_tokens, usage.total_tokens
            );
        }

        Ok(Self::output_text(&openai_response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    fn provider(model: &str) -> OpenAIProvider {
        let settings = ProviderSettings {
            kind: ProviderKind::OpenAI,
            model: Some(model.to_string()),
            ..ProviderSettings::default()
        };
        OpenAIProvider::new(&settings, "test_key".to_string(), reqwest::Client::new())
    }

    #[test]
    fn test_reasoning_models_omit_temperature() {
        let options = GenerationOptions::default();

        let chat = provider("gpt-4.1-mini");
        let body = serde_json::to_value(chat.build_request("p", &options)).unwrap();
        assert_eq!(body["temperature"], 0.0);
        assert!(body.get("reasoning").is_none());

        let reasoning = provider("o4-mini");
        let body = serde_json::to_value(reasoning.build_request("p", &options)).unwrap();
        assert!(body.get("temperature").is_none());
        assert_eq!(body["reasoning"]["effort"], "low");
    }

    #[test]
    fn test_strict_json_text_format() {
        let options = GenerationOptions {
            strict_json: true,
            ..GenerationOptions::default()
        };
        let p = provider("gpt-4.1-mini");
        let body = serde_json::to_value(p.build_request("p", &options)).unwrap();
        assert_eq!(body["text"]["format"]["type"], "json_object");
    }

    #[test]
    fn test_output_text_skips_reasoning_items() {
        let response: OpenAIResponse = serde_json::from_str(
            r#"{
                "status": "completed",
                "output": [
                    {"type": "reasoning", "id": "rs_1", "summary": []},
                    {"type": "message", "id": "msg_1", "role": "assistant",
                     "content": [{"type": "output_text", "text": "{\"plan\": []}", "annotations": []}]}
                ],
                "usage": {"input_tokens": 10, "output_tokens": 5, "total_tokens": 15}
            }"#,
        )
        .unwrap();
        assert_eq!(OpenAIProvider::output_text(&response), "{\"plan\": []}");
    }
}
