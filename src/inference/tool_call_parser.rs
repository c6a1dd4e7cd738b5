//! Tool call parsing: normalizes model output to `ToolCall` structs.
//!
//! Two formats are understood (per `ModelConfig::tool_call_format`):
//!
//! 1. **native_json**: OpenAI `tool_calls` on the assistant message, with
//!    arguments as a JSON-encoded string.
//! 2. **pythonic**: calls written into the reply text:
//!    ```text
//!    Tool: chain.get_price
//!    Arguments: {"symbol": "ETH"}
//!    ```
//!
//! Small models regularly emit arguments that are almost JSON. Both paths run
//! the argument text through `repair_json` before giving up.

use serde_json::Value;
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::ToolCall;

// ─── Native JSON ─────────────────────────────────────────────────────────────

/// Build a `ToolCall` from one entry of a native `tool_calls` array.
///
/// Empty argument text is treated as `{}`. Arguments that are not valid JSON
/// are repaired when possible.
pub fn parse_native_tool_call(
    id: Option<&str>,
    name: &str,
    arguments_json: &str,
) -> Result<ToolCall, InferenceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason: "empty tool name".into(),
        });
    }

    let arguments = parse_arguments(arguments_json)?;
    Ok(ToolCall {
        id: id.map(String::from).unwrap_or_else(new_call_id),
        name: name.to_string(),
        arguments,
    })
}

// ─── Pythonic ────────────────────────────────────────────────────────────────

/// Extract `Tool:` / `Arguments:` pairs from reply text.
///
/// A `Tool:` line without a following `Arguments:` line gets `{}`. Text that
/// contains no `Tool:` lines yields an empty list.
pub fn parse_pythonic_tool_calls(text: &str) -> Result<Vec<ToolCall>, InferenceError> {
    let mut calls = Vec::new();
    let mut lines = text.lines().map(str::trim).peekable();

    while let Some(line) = lines.next() {
        let Some(name) = strip_label(line, "tool") else {
            continue;
        };
        if name.is_empty() {
            continue;
        }

        let arguments = match lines.peek().and_then(|next| strip_label(next, "arguments")) {
            Some(raw) => {
                lines.next();
                parse_arguments(raw)?
            }
            None => Value::Object(Default::default()),
        };

        calls.push(ToolCall {
            id: new_call_id(),
            name: name.to_string(),
            arguments,
        });
    }

    Ok(calls)
}

/// Strip a case-insensitive `label:` prefix, returning the trimmed rest.
fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let head = line.get(..label.len())?;
    if !head.eq_ignore_ascii_case(label) {
        return None;
    }
    line[label.len()..].strip_prefix(':').map(str::trim)
}

fn parse_arguments(raw: &str) -> Result<Value, InferenceError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let value = repair_json(raw).ok_or_else(|| InferenceError::ToolCallParseError {
        raw_response: raw.to_string(),
        reason: "invalid JSON arguments".into(),
    })?;
    if !value.is_object() {
        return Err(InferenceError::ToolCallParseError {
            raw_response: raw.to_string(),
            reason: "arguments are not a JSON object".into(),
        });
    }
    Ok(value)
}

fn new_call_id() -> String {
    format!("call_{}", Uuid::new_v4())
}

// ─── Malformed JSON Repair ───────────────────────────────────────────────────

/// Pull the raw argument text out of an Ollama HTTP 500 body.
///
/// Ollama rejects its own model output with
/// `{"error":{"message":"error parsing tool call: raw='…', err=…"}}`.
/// The tool name is not part of the message.
pub fn extract_arguments_from_error(error_body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(error_body).ok()?;
    let message = parsed.pointer("/error/message")?.as_str()?;
    if !message.contains("error parsing tool call") {
        return None;
    }

    let start = message.find("raw='")? + "raw='".len();
    let len = message[start..].rfind("', err=")?;
    Some(message[start..start + len].to_string())
}

/// Parse `raw` as JSON, applying repairs one at a time until it parses.
///
/// Repairs, in order:
/// 1. a doubled opening quote on a value (`"k":""v"`)
/// 2. trailing commas before `}` or `]`
/// 3. an unterminated final string
/// 4. missing closing `}` / `]`
/// 5. stray control characters
///
/// Returns `None` when the text is still not JSON after every step.
pub fn repair_json(raw: &str) -> Option<Value> {
    let steps: [fn(&str) -> String; 5] = [
        collapse_doubled_quotes,
        drop_trailing_commas,
        close_open_string,
        close_open_containers,
        strip_control_characters,
    ];

    let mut text = raw.trim().to_string();
    if let Ok(v) = serde_json::from_str(&text) {
        return Some(v);
    }
    for step in steps {
        text = step(&text);
        if let Ok(v) = serde_json::from_str(&text) {
            return Some(v);
        }
    }
    None
}

/// `:""value` → `:"value"`. A real empty string (`:""` followed by `,` `}`
/// or end of input) is left alone.
fn collapse_doubled_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find(":\"\"") {
        let after = &rest[pos + 3..];
        let empty_string = after
            .trim_start()
            .chars()
            .next()
            .map_or(true, |c| c == ',' || c == '}');
        if empty_string {
            out.push_str(&rest[..pos + 3]);
        } else {
            out.push_str(&rest[..pos + 2]);
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

fn drop_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());

    for (i, &c) in chars.iter().enumerate() {
        if c == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Walk the text tracking string state; returns whether it ends inside a
/// string and the stack of unclosed containers.
fn scan(input: &str) -> (bool, Vec<char>) {
    let mut in_string = false;
    let mut escaped = false;
    let mut open = Vec::new();

    for c in input.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                if open.last() == Some(&c) {
                    open.pop();
                }
            }
            _ => {}
        }
    }
    (in_string, open)
}

fn close_open_string(input: &str) -> String {
    let (in_string, _) = scan(input);
    if in_string {
        format!("{input}\"")
    } else {
        input.to_string()
    }
}

fn close_open_containers(input: &str) -> String {
    let (_, open) = scan(input);
    let mut out = input.to_string();
    out.extend(open.iter().rev());
    out
}

/// Keeps `\n`, `\r` and `\t`.
fn strip_control_characters(input: &str) -> String {
    input
        .chars()
        .filter(|&c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
