//! Typed failures of the model-call gateway.
//!
//! None of these are fatal to the pipeline: the controller maps them to
//! stage-level budget consumption.

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// The model did not answer within the per-call timeout
    #[error("model {model} timed out after {}s", .after.as_secs())]
    Timeout { model: String, after: Duration },

    /// Rate-limit capacity did not free up before the call's deadline
    #[error("rate limit capacity unavailable within {}s", .waited.as_secs())]
    RateLimitExhausted { waited: Duration },

    /// The response could not be parsed into the declared shape
    #[error("model {model} returned a response that failed validation: {reason}")]
    SchemaInvalid { model: String, reason: String },

    /// Transport or provider error reported by the backend
    #[error("model {model} backend error: {message}")]
    Backend { model: String, message: String },

    /// Every model in the preference order failed
    #[error("all {attempts} attempts across {models} model(s) failed; last error: {last}")]
    AllModelsExhausted {
        models: usize,
        attempts: u32,
        last: Box<GatewayError>,
    },
}

impl GatewayError {
    /// Whether the same model may be asked again
    #[must_use]
    pub fn is_retryable_on_same_model(&self) -> bool {
        matches!(self, Self::SchemaInvalid { .. })
    }
}
