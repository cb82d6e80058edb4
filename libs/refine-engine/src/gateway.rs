//! Model-Call Gateway - the single choke point for model calls
//!
//! **Contract:** `invoke::<T>(prompt, models) -> T | GatewayError`
//!
//! Per call:
//! 1. Wait for rate-limit capacity (shared across all callers), bounded by the
//!    call's own deadline
//! 2. Ask the backend, bounded by the same deadline
//! 3. Parse and validate the response as `T`
//!
//! **Retry and fallback bounds:**
//! - Schema-invalid response: retry the same model up to `schema_retries` times
//! - Timeout or backend error: move on to the next model immediately
//! - Rate-limit deadline missed: fail, other models share the same limiter
//!
//! At most `models.len() * (1 + schema_retries)` backend calls per invoke.
//! The gateway holds no state besides the limiter, so it can be shared
//! freely between concurrent pipelines.

use crate::backend::{ModelBackend, Prompt};
use crate::error::GatewayError;
use crate::limiter::RateLimiter;
use crate::responses::{parse_structured, StructuredResponse};
use refine_common::config::ModelConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Matches the `model.temperature` config default
pub const DEFAULT_TEMPERATURE: f32 = 0.2;

#[derive(Clone)]
pub struct ModelGateway {
    backend: Arc<dyn ModelBackend>,
    limiter: Arc<RateLimiter>,
    call_timeout: Duration,
    schema_retries: u32,
    temperature: f32,
}

impl ModelGateway {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        limiter: Arc<RateLimiter>,
        call_timeout: Duration,
        schema_retries: u32,
    ) -> Self {
        Self {
            backend,
            limiter,
            call_timeout,
            schema_retries,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// Gateway with its own limiter sized from config
    pub fn from_config(backend: Arc<dyn ModelBackend>, config: &ModelConfig) -> Self {
        let limiter = Arc::new(RateLimiter::per_minute(config.max_requests_per_minute));
        Self::new(backend, limiter, config.call_timeout(), config.schema_retries)
            .with_temperature(config.temperature)
    }

    /// Sampling temperature stamped on every outgoing prompt
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    #[instrument(skip(self, prompt, models), fields(shape = short_type_name::<T>(), models = models.len()))]
    pub async fn invoke<T: StructuredResponse>(
        &self,
        prompt: &Prompt,
        models: &[String],
    ) -> Result<T, GatewayError> {
        let mut prompt = with_shape_instruction::<T>(prompt);
        prompt.temperature = self.temperature;
        let mut attempts = 0u32;
        let mut last_error: Option<GatewayError> = None;

        for model in models {
            for retry in 0..=self.schema_retries {
                attempts += 1;
                match self.call_once::<T>(model, &prompt).await {
                    Ok(response) => {
                        debug!(model = %model, attempts, "Model call succeeded");
                        return Ok(response);
                    }
                    Err(err @ GatewayError::RateLimitExhausted { .. }) => {
                        warn!(model = %model, error = %err, "Rate limit deadline missed");
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(model = %model, retry, error = %err, "Model call failed");
                        let retry_same = err.is_retryable_on_same_model();
                        last_error = Some(err);
                        if !retry_same {
                            break;
                        }
                    }
                }
            }
        }

        let last = last_error.unwrap_or_else(|| GatewayError::Backend {
            model: String::new(),
            message: "no models configured".to_string(),
        });

        if models.len() == 1 {
            return Err(last);
        }
        Err(GatewayError::AllModelsExhausted {
            models: models.len(),
            attempts,
            last: Box::new(last),
        })
    }

    async fn call_once<T: StructuredResponse>(
        &self,
        model: &str,
        prompt: &Prompt,
    ) -> Result<T, GatewayError> {
        let deadline = Instant::now() + self.call_timeout;

        if tokio::time::timeout_at(deadline, self.limiter.acquire()).await.is_err() {
            return Err(GatewayError::RateLimitExhausted {
                waited: self.call_timeout,
            });
        }

        let raw = match tokio::time::timeout_at(deadline, self.backend.complete(model, prompt)).await {
            Err(_) => {
                return Err(GatewayError::Timeout {
                    model: model.to_string(),
                    after: self.call_timeout,
                })
            }
            Ok(Err(e)) => {
                return Err(GatewayError::Backend {
                    model: model.to_string(),
                    message: format!("{:#}", e),
                })
            }
            Ok(Ok(raw)) => raw,
        };

        parse_structured::<T>(&raw).map_err(|reason| GatewayError::SchemaInvalid {
            model: model.to_string(),
            reason,
        })
    }
}

fn with_shape_instruction<T: StructuredResponse>(prompt: &Prompt) -> Prompt {
    let mut prompt = prompt.clone();
    prompt.user.push_str(
        "\n\nAnswer with a single YAML object and nothing else, in this shape:\n```yaml\n",
    );
    prompt.user.push_str(T::SHAPE);
    prompt.user.push_str("\n```");
    prompt
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
