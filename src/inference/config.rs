//! Model endpoint configuration.
//!
//! The `models` section of the core config: which OpenAI-compatible
//! endpoint proposes tool calls, and which endpoints to fall back to.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::errors::InferenceError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which tool-call format the model emits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallFormat {
    /// Standard OpenAI JSON tool calls.
    #[default]
    NativeJson,
    /// Text-based `Tool: … Arguments: …` lines in the reply content.
    Pythonic,
}

/// A single model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub display_name: String,
    /// Model name sent in the request body. Defaults to the config key.
    #[serde(default)]
    pub model_name: Option<String>,
    /// Base URL up to and including `/v1`.
    pub base_url: String,
    /// Sent as a bearer token when set.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub tool_call_format: ToolCallFormat,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// When `true`, sends `response_format: {"type":"json_object"}` on
    /// tool-calling requests. Some local runtimes use this to switch on
    /// grammar-constrained JSON output.
    #[serde(default)]
    pub force_json_response: bool,
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    1024
}

/// Model registry: the active model plus an ordered fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub active_model: String,
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// Resolve the active model configuration, respecting the fallback chain.
///
/// Returns `(model_key, ModelConfig)` for the first model that exists in
/// the config. Connectivity is checked at request time by the client.
pub fn resolve_active_model(config: &ModelsConfig) -> Result<(String, ModelConfig), InferenceError> {
    if let Some(model) = config.models.get(&config.active_model) {
        return Ok((config.active_model.clone(), model.clone()));
    }

    for key in &config.fallback_chain {
        if let Some(model) = config.models.get(key) {
            tracing::warn!(
                active = %config.active_model,
                fallback = %key,
                "active model not configured, using fallback"
            );
            return Ok((key.clone(), model.clone()));
        }
    }

    Err(InferenceError::ConfigError {
        reason: format!(
            "active model '{}' not found in config and no fallback available",
            config.active_model
        ),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
