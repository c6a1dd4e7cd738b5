//! OpenAI-compatible inference client.
//!
//! Sends chat completion requests to the configured model endpoint and walks
//! the fallback chain when the current model is unavailable.

use std::time::Duration;

use reqwest::Client as HttpClient;
use serde_json::Value;
use uuid::Uuid;

use super::config::{resolve_active_model, ModelConfig, ModelsConfig, ToolCallFormat};
use super::errors::InferenceError;
use super::response::parse_chat_response;
use super::tool_call_parser::{extract_arguments_from_error, repair_json};
use super::types::{ChatCompletionRequest, ChatMessage, ChatResponse, ResponseFormat, ToolCall};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout. The intent resolver applies its own, usually
/// shorter, deadline on top of this.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for the model endpoint.
///
/// Holds the full models config so it can move down the fallback chain.
/// Once a model has failed the client stays on the fallback for the rest of
/// its lifetime.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelsConfig,
    current_model_key: String,
    current_model: ModelConfig,
    /// Models that have already been tried and failed.
    exhausted_models: Vec<String>,
}

impl InferenceClient {
    /// Create a client from the models configuration.
    ///
    /// Does NOT check connectivity; that happens on the first request.
    pub fn from_config(config: ModelsConfig) -> Result<Self, InferenceError> {
        let (key, model) = resolve_active_model(&config)?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: model.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            config,
            current_model_key: key,
            current_model: model,
            exhausted_models: Vec::new(),
        })
    }

    /// The config key of the currently selected model.
    pub fn current_model_key(&self) -> &str {
        &self.current_model_key
    }

    /// The display name of the currently selected model.
    pub fn current_model_name(&self) -> &str {
        &self.current_model.display_name
    }

    pub fn tool_call_format(&self) -> ToolCallFormat {
        self.current_model.tool_call_format
    }

    // ─── Chat Completion ─────────────────────────────────────────────────

    /// Send a chat completion request, falling back down the chain on
    /// retriable failures.
    ///
    /// When Ollama rejects the model's own tool call JSON (HTTP 500) and
    /// exactly one tool was offered, the arguments are repaired client-side
    /// instead of falling back.
    pub async fn chat_completion(
        &mut self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<Value>>,
    ) -> Result<ChatResponse, InferenceError> {
        let mut last_error: Option<InferenceError> = None;

        for _attempt in 0..=self.remaining_fallbacks() {
            match self.try_request(&messages, &tools).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_tool_call_parse_error() => {
                    if let Some(repaired) = Self::try_repair_from_error(&e, tools.as_deref()) {
                        tracing::info!(
                            model = %self.current_model_key,
                            "repaired malformed JSON tool call"
                        );
                        return Ok(repaired);
                    }
                    tracing::warn!(model = %self.current_model_key, "tool call JSON repair failed, falling back");
                    last_error = Some(e);
                    if self.try_next_fallback().is_err() {
                        break;
                    }
                }
                Err(e) if Self::is_retriable(&e) => {
                    tracing::warn!(model = %self.current_model_key, error = %e, "model unavailable, falling back");
                    last_error = Some(e);
                    if self.try_next_fallback().is_err() {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(InferenceError::AllModelsUnavailable {
            attempted: self.exhausted_models.clone(),
        }))
    }

    /// One request to the current model.
    async fn try_request(
        &self,
        messages: &[ChatMessage],
        tools: &Option<Vec<Value>>,
    ) -> Result<ChatResponse, InferenceError> {
        let url = format!("{}/chat/completions", self.current_model.base_url.trim_end_matches('/'));
        let has_tools = tools.as_ref().is_some_and(|t| !t.is_empty());

        let body = ChatCompletionRequest {
            model: self
                .current_model
                .model_name
                .clone()
                .unwrap_or_else(|| self.current_model_key.clone()),
            messages: messages.to_vec(),
            tools: tools.clone().filter(|t| !t.is_empty()),
            tool_choice: has_tools.then(|| "auto".to_string()),
            temperature: self.current_model.temperature,
            max_tokens: self.current_model.max_tokens,
            stream: false,
            response_format: (self.current_model.force_json_response && has_tools).then(|| ResponseFormat {
                r#type: "json_object".to_string(),
            }),
        };

        tracing::debug!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map_or(0, Vec::len),
            "LLM request"
        );

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.current_model.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_ms: REQUEST_TIMEOUT.as_millis() as u64,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let text = response.text().await.map_err(|e| InferenceError::ResponseError {
            reason: format!("failed to read response body: {e}"),
        })?;
        parse_chat_response(&text, self.current_model.tool_call_format)
    }

    // ─── Tool Call Repair ────────────────────────────────────────────────

    /// Build a response from the arguments embedded in an Ollama parse error.
    ///
    /// The error body carries no tool name, so this only succeeds when a
    /// single tool was offered.
    fn try_repair_from_error(err: &InferenceError, tools: Option<&[Value]>) -> Option<ChatResponse> {
        let [tool] = tools? else {
            return None;
        };
        let name = tool.pointer("/function/name")?.as_str()?;
        let raw = extract_arguments_from_error(err.error_body()?)?;
        let arguments = repair_json(&raw).filter(Value::is_object)?;

        Some(ChatResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id: format!("call_{}", Uuid::new_v4()),
                name: name.to_string(),
                arguments,
            }],
            finish_reason: Some("tool_calls".to_string()),
        })
    }

    // ─── Health Check ────────────────────────────────────────────────────

    /// Check if the current model endpoint answers `GET /models`.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.current_model.base_url.trim_end_matches('/'));
        match self.http.get(&url).timeout(CONNECT_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    // ─── Fallback Chain ──────────────────────────────────────────────────

    /// Move to the next untried model in the fallback chain.
    pub fn try_next_fallback(&mut self) -> Result<(), InferenceError> {
        self.exhausted_models.push(self.current_model_key.clone());

        for key in &self.config.fallback_chain {
            if self.exhausted_models.contains(key) {
                continue;
            }
            if let Some(model) = self.config.models.get(key) {
                tracing::info!(from = %self.current_model_key, to = %key, "switching model");
                self.current_model_key = key.clone();
                self.current_model = model.clone();
                return Ok(());
            }
        }

        Err(InferenceError::AllModelsUnavailable {
            attempted: self.exhausted_models.clone(),
        })
    }

    fn remaining_fallbacks(&self) -> usize {
        self.config
            .fallback_chain
            .iter()
            .filter(|k| !self.exhausted_models.contains(k) && **k != self.current_model_key)
            .filter(|k| self.config.models.contains_key(k.as_str()))
            .count()
    }

    /// Whether an error should trigger a fallback attempt.
    ///
    /// 404 is what Ollama returns for a model that isn't pulled; 500 is what
    /// local runtimes return when the model emits malformed tool call JSON.
    fn is_retriable(err: &InferenceError) -> bool {
        matches!(
            err,
            InferenceError::ConnectionFailed { .. }
                | InferenceError::Timeout { .. }
                | InferenceError::HttpError { status: 404, .. }
                | InferenceError::HttpError { status: 500, .. }
                | InferenceError::HttpError { status: 502..=504, .. }
        )
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
