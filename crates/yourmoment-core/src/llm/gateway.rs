//! The LLM gateway: fallback chains, per-provider pacing, and timeouts.
//!
//! Callers hand the gateway an ordered provider chain (preferred provider
//! first). The gateway tries each in order, enforcing a minimum inter-call
//! delay per provider and a hard per-call timeout, and surfaces
//! [`LlmError::ProviderExhausted`] only after every provider failed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::factory::{build_provider, ProviderGenerationConfig};
use super::CommentStructure;
use crate::config::LlmConfig;
use crate::error::LlmError;

/// Result of a successful gateway generation.
#[derive(Debug, Clone)]
pub struct GatewayOutcome {
    /// The structured comment.
    pub structure: CommentStructure,
    /// Name of the provider that produced it.
    pub provider_used: String,
    /// Id of the configuration row that produced it.
    pub provider_id: String,
    /// Model that produced it.
    pub model_used: String,
    /// Whether a non-first provider in the chain was used.
    pub fallback_used: bool,
    /// Total tokens consumed, when reported.
    pub tokens: Option<i64>,
    /// Wall-clock generation time in milliseconds.
    pub generation_time_ms: i64,
}

/// Uniform gateway over all configured providers.
pub struct LlmGateway {
    generation_timeout: Duration,
    min_call_interval: Duration,
    fallback_to_next_provider: bool,
    last_call: Mutex<HashMap<String, Instant>>,
}

impl LlmGateway {
    /// Build a gateway from LLM configuration.
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            generation_timeout: Duration::from_secs(config.generation_timeout_seconds),
            min_call_interval: Duration::from_secs_f64(config.min_call_interval_seconds),
            fallback_to_next_provider: config.fallback_to_next_provider,
            last_call: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a structured comment, walking the provider chain in order.
    pub async fn generate(
        &self,
        chain: &[ProviderGenerationConfig],
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<GatewayOutcome, LlmError> {
        if chain.is_empty() {
            return Err(LlmError::ProviderExhausted {
                attempts: 0,
                last_error: "no active providers configured".to_string(),
            });
        }

        let mut last_error: Option<LlmError> = None;

        for (index, config) in chain.iter().enumerate() {
            self.pace(&config.provider_id).await;

            let started = Instant::now();
            match self.call_provider(config, system_prompt, user_prompt).await {
                Ok(response) => {
                    let elapsed_ms = started.elapsed().as_millis() as i64;
                    tracing::info!(
                        provider = %config.provider_name,
                        model = %response.model,
                        fallback = index > 0,
                        elapsed_ms,
                        "comment generated"
                    );
                    return Ok(GatewayOutcome {
                        structure: response.structure,
                        provider_used: config.provider_name.clone(),
                        provider_id: config.provider_id.clone(),
                        model_used: if response.model.is_empty() {
                            config.model_name.clone()
                        } else {
                            response.model
                        },
                        fallback_used: index > 0,
                        tokens: {
                            let total = response.usage.total();
                            (total > 0).then_some(i64::from(total))
                        },
                        generation_time_ms: elapsed_ms,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        provider = %config.provider_name,
                        error = %e,
                        remaining = chain.len() - index - 1,
                        "provider failed"
                    );
                    last_error = Some(e);
                    if !self.fallback_to_next_provider {
                        break;
                    }
                }
            }
        }

        Err(LlmError::ProviderExhausted {
            attempts: if self.fallback_to_next_provider {
                chain.len()
            } else {
                1
            },
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn call_provider(
        &self,
        config: &ProviderGenerationConfig,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<super::StructuredResponse, LlmError> {
        let provider = build_provider(config)?;
        let params = config.params();

        tokio::time::timeout(
            self.generation_timeout,
            provider.generate(system_prompt, user_prompt, &params),
        )
        .await
        .map_err(|_| LlmError::Timeout {
            seconds: self.generation_timeout.as_secs(),
        })?
    }

    /// Enforce the minimum inter-call delay for one provider.
    async fn pace(&self, provider_id: &str) {
        let wait = {
            // A poisoned lock skips pacing instead of panicking the stage.
            let Ok(mut last_call) = self.last_call.lock() else {
                return;
            };
            let now = Instant::now();
            let wait = last_call
                .get(provider_id)
                .map(|last| self.min_call_interval.saturating_sub(now.duration_since(*last)))
                .unwrap_or(Duration::ZERO);
            // Reserve the slot before sleeping so concurrent callers queue up.
            last_call.insert(provider_id.to_string(), now + wait);
            wait
        };

        if !wait.is_zero() {
            tracing::debug!(
                provider_id,
                wait_ms = wait.as_millis() as u64,
                "pacing provider call"
            );
            tokio::time::sleep(wait).await;
        }
    }
}
