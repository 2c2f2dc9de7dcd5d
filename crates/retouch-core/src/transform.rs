//! Transformer trait and transform types.
//!
//! Transformers apply a natural-language edit instruction to a payload
//! by calling out to an external generation tool. The tool is opaque,
//! possibly slow (minutes, not seconds), and possibly failing; the
//! trait boundary keeps that machinery out of the pipeline.

use async_trait::async_trait;
use std::time::Duration;

/// Why a transform attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The tool did not finish within the deadline. Eligible for one
    /// bounded retry through a simpler invocation path.
    #[error("transformation tool timed out after {0:?}")]
    Timeout(Duration),

    /// The tool exited non-zero or could not be started.
    #[error("transformation tool failed: {0}")]
    Tool(String),

    /// The tool produced output that does not resemble a document.
    /// Not retried.
    #[error("tool output failed structural check: {0}")]
    Malformed(String),
}

/// A successful transform result.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    /// The complete modified payload.
    pub payload: String,
}

/// Trait for edit transformers.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Name of this transformer, for logs.
    fn name(&self) -> &'static str;

    /// Apply `instruction` to `payload`, bounded by `timeout`.
    async fn transform(
        &self,
        instruction: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<TransformOutput, TransformError>;
}
