use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::prompts::simplify_prompt;
use super::registry::RegisteredProvider;
use super::{GenerationOptions, ProviderKind, ProviderRegistry, TaskType};
use crate::config::RoutingConfig;
use crate::error::{AllProvidersFailedError, ProviderAttempt, ProviderError};

/// One routed generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub task_type: TaskType,
    pub prompt: String,
    /// Model name used for every provider instead of the configured one
    pub model_override: Option<String>,
    /// Extra same-provider attempts on transient faults
    pub max_retries: u32,
    /// Limit for a single provider call
    pub timeout: Duration,
    pub options: GenerationOptions,
}

impl GenerationRequest {
    pub fn new(task_type: TaskType, prompt: impl Into<String>) -> Self {
        Self {
            task_type,
            prompt: prompt.into(),
            model_override: None,
            max_retries: 1,
            timeout: Duration::from_secs(120),
            options: GenerationOptions::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }
}

/// Successful routed generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub provider_used: ProviderKind,
    pub model: String,
    pub text: String,
    /// Providers that failed before `provider_used` answered
    pub failures: Vec<ProviderAttempt>,
}

/// Walks the priority list for a task and falls back between providers.
pub struct Router {
    registry: Arc<ProviderRegistry>,
    routing: RoutingConfig,
    model_override: Option<String>,
}

impl Router {
    pub fn new(registry: Arc<ProviderRegistry>, routing: RoutingConfig) -> Self {
        Self {
            registry,
            routing,
            model_override: None,
        }
    }

    /// Apply a model name to every request built by [`Router::request`]
    pub fn with_model_override(mut self, model: Option<String>) -> Self {
        self.model_override = model.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Request pre-filled with the configured retry, timeout and sampling defaults
    pub fn request(&self, task_type: TaskType, prompt: impl Into<String>) -> GenerationRequest {
        let mut request = GenerationRequest::new(task_type, prompt)
            .with_max_retries(self.routing.max_retries)
            .with_timeout(self.routing.timeout())
            .with_options(GenerationOptions {
                temperature: self.routing.temperature,
                max_tokens: self.routing.max_tokens,
                stop: Vec::new(),
            });
        request.model_override = self.model_override.clone();
        request
    }

    /// Simplify a block of text for narration
    pub async fn simplify(
        &self,
        text: &str,
        task_type: TaskType,
    ) -> Result<GenerationResult, AllProvidersFailedError> {
        let request = self.request(task_type, simplify_prompt(text, task_type));
        self.route(&request).await
    }

    /// Try providers in priority order; the first success wins.
    pub async fn route(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, AllProvidersFailedError> {
        let candidates = self.registry.resolve(request.task_type);
        let mut failures: Vec<ProviderAttempt> = Vec::with_capacity(candidates.len());

        for provider in candidates {
            let model = request
                .model_override
                .as_deref()
                .unwrap_or_else(|| provider.config.model_for(request.task_type))
                .to_string();

            match self.try_provider(provider, &model, request).await {
                Ok(text) => {
                    if !failures.is_empty() {
                        info!(
                            provider = %provider.kind,
                            skipped = failures.len(),
                            "🔀 Fell back to {} after {} failed provider(s)",
                            provider.kind,
                            failures.len()
                        );
                    }
                    return Ok(GenerationResult {
                        provider_used: provider.kind,
                        model,
                        text,
                        failures,
                    });
                }
                Err((error, tries)) => {
                    warn!(
                        provider = %provider.kind,
                        tries,
                        error = %error,
                        "Provider failed, trying next"
                    );
                    failures.push(ProviderAttempt {
                        provider: provider.kind,
                        error,
                        tries,
                    });
                }
            }
        }

        Err(AllProvidersFailedError {
            task_type: request.task_type,
            attempts: failures,
        })
    }

    /// Call one provider, retrying transient faults up to `max_retries` times
    async fn try_provider(
        &self,
        provider: &RegisteredProvider,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<String, (ProviderError, u32)> {
        let mut tries = 0;
        loop {
            tries += 1;
            debug!(provider = %provider.kind, model, attempt = tries, "Attempting completion");

            let started = Instant::now();
            let outcome = tokio::time::timeout(
                request.timeout,
                provider.client.generate(&request.prompt, model, &request.options),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ProviderError::Timeout {
                    provider: provider.kind,
                    elapsed: started.elapsed(),
                })
            });

            match outcome {
                Ok(text) => {
                    debug!(
                        provider = %provider.kind,
                        "Completion received in {:.2}s ({} chars)",
                        started.elapsed().as_secs_f64(),
                        text.chars().count()
                    );
                    return Ok(text);
                }
                Err(error) if error.is_transient() && tries <= request.max_retries => {
                    debug!(provider = %provider.kind, error = %error, "Transient failure, retrying");
                    let backoff = self.routing.retry_backoff();
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(error) => return Err((error, tries)),
            }
        }
    }
}
