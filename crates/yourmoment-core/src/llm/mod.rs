//! LLM provider abstraction and implementations.
//!
//! Provides a trait-based abstraction over heterogeneous LLM providers
//! (OpenAI, Mistral) with JSON-schema-constrained comment output, token
//! usage tracking, per-provider rate limiting, and fallback chains.

pub mod factory;
pub mod gateway;
pub mod mistral;
pub mod openai;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Structured comment returned by every provider.
///
/// Providers are asked for a JSON object constrained to exactly this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentStructure {
    /// The generated comment text.
    pub comment_content: String,
    /// Model-reported confidence in the comment, 0.0–1.0.
    #[serde(default)]
    pub confidence_level: Option<f32>,
    /// Optional model reasoning (never posted).
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// JSON schema describing [`CommentStructure`], sent to providers that
/// support schema-constrained output.
pub fn comment_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "comment_content": { "type": "string" },
            "confidence_level": { "type": ["number", "null"] },
            "reasoning": { "type": ["string", "null"] }
        },
        "required": ["comment_content"],
        "additionalProperties": false
    })
}

/// Token usage information from an LLM completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the input/prompt.
    pub input_tokens: u32,
    /// Number of tokens in the output/completion.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Total tokens consumed by the call.
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A structured response from a provider.
#[derive(Debug, Clone)]
pub struct StructuredResponse {
    /// The parsed comment structure.
    pub structure: CommentStructure,
    /// Token usage for this completion.
    pub usage: TokenUsage,
    /// The model that produced this response.
    pub model: String,
}

/// Parameters controlling generation behavior.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate (provider default when unset).
    pub max_tokens: Option<u32>,
    /// Sampling temperature in `[0, 1]` (provider default when unset).
    pub temperature: Option<f32>,
}

/// Trait abstracting all LLM provider operations.
///
/// Implementations include [`openai::OpenAiProvider`] and
/// [`mistral::MistralProvider`]. The trait is object-safe for use as
/// `Box<dyn LlmProvider>`.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Display name of this provider (e.g. "openai", "mistral").
    fn name(&self) -> &str;

    /// The configured model name.
    fn model(&self) -> &str;

    /// Request a schema-constrained comment.
    async fn generate(
        &self,
        system: &str,
        user_message: &str,
        params: &GenerationParams,
    ) -> Result<StructuredResponse, LlmError>;
}

/// Parse a chat-completion message body into a [`CommentStructure`].
///
/// Shared by the providers: both return the JSON object as the message
/// content string.
pub(crate) fn parse_structure(content: &str) -> Result<CommentStructure, LlmError> {
    serde_json::from_str::<CommentStructure>(content.trim())
        .map_err(|e| LlmError::Parse(format!("response is not a valid comment object: {e}")))
}
