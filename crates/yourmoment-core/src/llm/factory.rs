//! Provider construction from decrypted configuration.
//!
//! Adding a provider means a new variant match arm here plus its client
//! module; nothing else in the gateway changes.

use super::mistral::MistralProvider;
use super::openai::OpenAiProvider;
use super::{GenerationParams, LlmProvider};
use crate::error::LlmError;

/// A provider configuration prepared for generation.
///
/// Carries the decrypted API key; instances must not outlive the operation
/// they were built for.
#[derive(Clone)]
pub struct ProviderGenerationConfig {
    /// Id of the configuration row this was built from.
    pub provider_id: String,
    /// Provider name: `openai` or `mistral`.
    pub provider_name: String,
    /// Model to request.
    pub model_name: String,
    /// Decrypted API key.
    pub api_key: String,
    /// Optional max token budget.
    pub max_tokens: Option<i64>,
    /// Optional sampling temperature.
    pub temperature: Option<f64>,
    /// Override for the provider's API base URL (tests, proxies).
    pub base_url: Option<String>,
}

impl std::fmt::Debug for ProviderGenerationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderGenerationConfig")
            .field("provider_id", &self.provider_id)
            .field("provider_name", &self.provider_name)
            .field("model_name", &self.model_name)
            .field("api_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl ProviderGenerationConfig {
    /// Generation parameters derived from this configuration.
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens.and_then(|v| u32::try_from(v).ok()),
            temperature: self.temperature.map(|v| v as f32),
        }
    }
}

/// Build a concrete provider client for a configuration.
pub fn build_provider(
    config: &ProviderGenerationConfig,
) -> Result<Box<dyn LlmProvider>, LlmError> {
    match config.provider_name.as_str() {
        "openai" => Ok(Box::new(OpenAiProvider::new(
            config
                .base_url
                .clone()
                .unwrap_or_else(|| super::openai::DEFAULT_BASE_URL.to_string()),
            config.api_key.clone(),
            config.model_name.clone(),
        ))),
        "mistral" => Ok(Box::new(MistralProvider::new(
            config
                .base_url
                .clone()
                .unwrap_or_else(|| super::mistral::DEFAULT_BASE_URL.to_string()),
            config.api_key.clone(),
            config.model_name.clone(),
        ))),
        other => Err(LlmError::UnsupportedProvider {
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> ProviderGenerationConfig {
        ProviderGenerationConfig {
            provider_id: "p1".to_string(),
            provider_name: name.to_string(),
            model_name: "model-x".to_string(),
            api_key: "sk-test".to_string(),
            max_tokens: Some(400),
            temperature: Some(0.7),
            base_url: None,
        }
    }

    #[test]
    fn builds_known_providers() {
        let openai = build_provider(&config("openai")).expect("openai");
        assert_eq!(openai.name(), "openai");
        assert_eq!(openai.model(), "model-x");

        let mistral = build_provider(&config("mistral")).expect("mistral");
        assert_eq!(mistral.name(), "mistral");
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = match build_provider(&config("huggingface")) {
            Err(e) => e,
            Ok(_) => panic!("expected unsupported provider error"),
        };
        assert!(matches!(
            err,
            LlmError::UnsupportedProvider { name } if name == "huggingface"
        ));
    }

    #[test]
    fn params_convert_numeric_types() {
        let params = config("openai").params();
        assert_eq!(params.max_tokens, Some(400));
        assert_eq!(params.temperature, Some(0.7));
    }

    #[test]
    fn debug_redacts_api_key() {
        let rendered = format!("{:?}", config("openai"));
        assert!(!rendered.contains("sk-test"));
        assert!(rendered.contains("<redacted>"));
    }
}
