//! Agent Core error types.

use thiserror::Error;

use crate::inference::errors::InferenceError;

/// Errors that stop an utterance before any tool is dispatched.
///
/// Per-call failures are never errors at this level; they are reported
/// inside the execution result.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The LLM capability failed.
    #[error("intent capability failed: {0}")]
    Inference(#[from] InferenceError),

    /// The LLM capability did not answer within the intent timeout.
    #[error("intent resolution timed out after {timeout_ms}ms")]
    IntentTimeout { timeout_ms: u64 },
}

impl ExecutionError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ExecutionError::IntentTimeout { .. } | ExecutionError::Inference(InferenceError::Timeout { .. })
        )
    }
}
