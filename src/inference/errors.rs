//! Inference error types.
//!
//! These carry enough context (endpoint, status, raw model output) for the
//! caller to log a useful entry; the client itself only logs fallbacks.

use thiserror::Error;

/// Errors at the LLM capability boundary.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond in time.
    #[error("inference timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// A tool call in the model's reply could not be parsed or repaired.
    #[error("tool call parse error: {reason}")]
    ToolCallParseError { raw_response: String, reason: String },

    /// Every model in the fallback chain failed.
    #[error("all models unavailable (tried: {})", attempted.join(", "))]
    AllModelsUnavailable { attempted: Vec<String> },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response body was not a chat completion.
    #[error("response error: {reason}")]
    ResponseError { reason: String },

    /// Model configuration is missing or inconsistent.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Check if this error is an Ollama tool call parse failure (HTTP 500).
    ///
    /// Ollama returns HTTP 500 with `"error parsing tool call"` when the model
    /// generates malformed JSON in tool call arguments. These errors are
    /// candidates for client-side JSON repair.
    pub fn is_tool_call_parse_error(&self) -> bool {
        matches!(
            self,
            InferenceError::HttpError { status: 500, body }
                if body.contains("error parsing tool call")
        )
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }
}
