//! Mistral provider with JSON-object structured output.
//!
//! Mistral's chat completions endpoint shares the OpenAI wire shape but its
//! structured-output mode is `response_format: {"type": "json_object"}`; the
//! expected object shape is reinforced through the system prompt.

use serde::{Deserialize, Serialize};

use super::{parse_structure, GenerationParams, LlmProvider, StructuredResponse, TokenUsage};
use crate::error::LlmError;

/// Default Mistral API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.mistral.ai/v1";

/// Appended to the system prompt so JSON mode yields the comment shape.
const SCHEMA_INSTRUCTION: &str = "Antworte ausschliesslich mit einem JSON-Objekt der Form \
    {\"comment_content\": string, \"confidence_level\": number|null, \"reasoning\": string|null}.";

/// An LLM provider using the Mistral chat completions API.
pub struct MistralProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl MistralProvider {
    /// Create a new Mistral provider.
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            model,
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for MistralProvider {
    fn name(&self) -> &str {
        "mistral"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        system: &str,
        user_message: &str,
        params: &GenerationParams,
    ) -> Result<StructuredResponse, LlmError> {
        tracing::debug!(
            provider = "mistral",
            model = %self.model,
            max_tokens = ?params.max_tokens,
            "LLM request"
        );

        let system_with_schema = format!("{system}\n\n{SCHEMA_INSTRUCTION}");

        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system_with_schema,
                },
                ChatMessage {
                    role: "user",
                    content: user_message,
                },
            ],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            response_format: serde_json::json!({ "type": "json_object" }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();

            if status == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                return Err(LlmError::RateLimited {
                    retry_after_secs: retry_after,
                });
            }

            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: body,
            });
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("failed to parse response: {e}")))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        let structure = parse_structure(&content)?;

        let usage = body.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            input_tokens: u.prompt_tokens.unwrap_or(0),
            output_tokens: u.completion_tokens.unwrap_or(0),
        });

        Ok(StructuredResponse {
            structure,
            usage,
            model: body.model,
        })
    }
}

// --- Internal Serde types ---

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    response_format: serde_json::Value,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}
