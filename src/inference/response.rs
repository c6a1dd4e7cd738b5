//! Chat completion response parsing.
//!
//! Turns a `POST /v1/chat/completions` body into a `ChatResponse`, routing
//! tool calls through the parser for the model's configured format.

use serde::Deserialize;
use serde_json::Value;

use super::config::ToolCallFormat;
use super::errors::InferenceError;
use super::tool_call_parser::{parse_native_tool_call, parse_pythonic_tool_calls};
use super::types::ChatResponse;

#[derive(Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    /// A JSON-encoded string per the OpenAI API; some runtimes send an object.
    #[serde(default)]
    arguments: Value,
}

/// Parse a complete (non-streaming) chat completion body.
///
/// Empty `content` is reported as `None`. In pythonic mode, tool calls are
/// read from the content when the message carries no native `tool_calls`.
pub fn parse_chat_response(body: &str, format: ToolCallFormat) -> Result<ChatResponse, InferenceError> {
    let parsed: CompletionBody = serde_json::from_str(body).map_err(|e| InferenceError::ResponseError {
        reason: format!("failed to parse chat completion: {e}"),
    })?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::ResponseError {
            reason: "empty choices array".into(),
        })?;

    let content = choice.message.content.filter(|c| !c.trim().is_empty());

    let mut tool_calls = Vec::new();
    for call in choice.message.tool_calls.unwrap_or_default() {
        let arguments = match &call.function.arguments {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        tool_calls.push(parse_native_tool_call(
            call.id.as_deref(),
            &call.function.name,
            &arguments,
        )?);
    }

    if tool_calls.is_empty() && format == ToolCallFormat::Pythonic {
        if let Some(text) = &content {
            tool_calls = parse_pythonic_tool_calls(text)?;
        }
    }

    Ok(ChatResponse {
        content,
        tool_calls,
        finish_reason: choice.finish_reason,
    })
}
