//! Execution Service: the single entry point for running an utterance.
//!
//! Resolver, then Dispatcher, then formatting. Per-call failures stay
//! per-call: a plan where one call times out and another succeeds is a
//! partial success, not an error.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use super::errors::ExecutionError;
use super::intent::{ConversationContext, IntentPlan, IntentResolver, RejectedCall, RejectionReason};
use crate::config::ExecutionSettings;
use crate::mcp_client::dispatcher::content_text;
use crate::mcp_client::types::{CallOutcome, FailureKind, RequestId, ToolCallResult};
use crate::mcp_client::{Dispatcher, McpClient, ToolRegistry};

const DEFAULT_CLARIFICATION: &str = "I'm not sure what you'd like me to do. Could you rephrase or add more detail?";

// ─── Result Types ────────────────────────────────────────────────────────────

/// The bounded set of outcomes a user can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserOutcome {
    Success,
    ToolUnavailable,
    InvalidRequest,
    TimedOut,
    Cancelled,
    Failed,
}

impl UserOutcome {
    pub fn from_failure(kind: FailureKind) -> Self {
        match kind {
            FailureKind::SessionUnavailable | FailureKind::UnknownTool => UserOutcome::ToolUnavailable,
            FailureKind::SchemaMismatch | FailureKind::DuplicateRequest => UserOutcome::InvalidRequest,
            FailureKind::Transport | FailureKind::Protocol | FailureKind::Tool => UserOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// One entry per dispatched or rejected call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedOutput {
    /// Absent for calls rejected before dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// Qualified name for dispatched calls; the proposed name otherwise.
    pub tool: String,
    pub outcome: UserOutcome,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// At least one call was planned. `reply` is the model's accompanying text.
    Completed {
        status: PlanStatus,
        outputs: Vec<FormattedOutput>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
    },
    Clarification { prompt: String, confidence: f64 },
    /// The model answered without proposing any tool.
    Reply { text: String },
    Error { outcome: UserOutcome, message: String },
}

impl ExecutionResult {
    /// What the assistant said, as it should be remembered in the
    /// conversation for the next utterance.
    pub fn assistant_text(&self) -> String {
        match self {
            ExecutionResult::Completed { outputs, reply, .. } => {
                let mut lines: Vec<&str> = reply.iter().map(String::as_str).collect();
                lines.extend(outputs.iter().map(|o| o.text.as_str()));
                lines.join("\n")
            }
            ExecutionResult::Clarification { prompt, .. } => prompt.clone(),
            ExecutionResult::Reply { text } => text.clone(),
            ExecutionResult::Error { message, .. } => message.clone(),
        }
    }
}

// ─── ExecutionService ────────────────────────────────────────────────────────

pub struct ExecutionService {
    resolver: IntentResolver,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ToolRegistry>,
    settings: ExecutionSettings,
}

impl ExecutionService {
    pub fn new(resolver: IntentResolver, client: &McpClient, settings: ExecutionSettings) -> Self {
        Self {
            resolver,
            dispatcher: Arc::clone(client.dispatcher()),
            registry: Arc::clone(client.registry()),
            settings,
        }
    }

    /// Run one utterance end to end.
    pub async fn execute(&self, utterance: &str, context: &ConversationContext) -> ExecutionResult {
        let started = Instant::now();
        let catalog = self.registry.snapshot();

        let plan = match self.resolver.resolve(utterance, &catalog, context).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(error = %e, "intent resolution failed");
                return error_result(&e);
            }
        };

        let result = self.run_plan(plan).await;
        tracing::info!(
            session = ?context.session_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            result = result_label(&result),
            "utterance executed"
        );
        result
    }

    async fn run_plan(&self, plan: IntentPlan) -> ExecutionResult {
        if plan.needs_clarification {
            return ExecutionResult::Clarification {
                prompt: plan.reply.unwrap_or_else(|| DEFAULT_CLARIFICATION.to_string()),
                confidence: plan.confidence,
            };
        }
        if plan.is_empty() {
            return match plan.reply {
                Some(text) => ExecutionResult::Reply { text },
                None => ExecutionResult::Clarification {
                    prompt: DEFAULT_CLARIFICATION.to_string(),
                    confidence: plan.confidence,
                },
            };
        }

        let results = self.dispatcher.call_many(plan.resolved_tool_calls).await;

        let mut outputs: Vec<FormattedOutput> = results.iter().map(|r| self.format_result(r)).collect();
        outputs.extend(plan.rejected.iter().map(format_rejection));

        ExecutionResult::Completed {
            status: plan_status(&outputs),
            outputs,
            reply: plan.reply,
        }
    }

    fn format_result(&self, result: &ToolCallResult) -> FormattedOutput {
        let tool = format!("{}.{}", result.server_id, result.tool_name);
        let (outcome, text, payload) = match &result.outcome {
            CallOutcome::Success { payload } => {
                let text = content_text(payload).unwrap_or_else(|| payload.to_string());
                (UserOutcome::Success, text, Some(payload.clone()))
            }
            CallOutcome::Failure { kind, detail } => {
                (UserOutcome::from_failure(*kind), failure_text(&tool, *kind, detail), None)
            }
            CallOutcome::Timeout => (UserOutcome::TimedOut, format!("{tool} did not respond in time."), None),
            CallOutcome::Cancelled => (UserOutcome::Cancelled, format!("{tool} was cancelled."), None),
        };

        FormattedOutput {
            request_id: Some(result.request_id.clone()),
            tool,
            outcome,
            text: truncate_chars(&text, self.settings.max_output_chars),
            payload,
            elapsed_ms: result.execution_time_ms,
        }
    }
}

// ─── Formatting ──────────────────────────────────────────────────────────────

/// User-facing text for a failed call. Tool-reported errors are shown as the
/// tool wrote them; protocol and transport details are not.
fn failure_text(tool: &str, kind: FailureKind, detail: &str) -> String {
    match kind {
        FailureKind::Tool => format!("{tool} failed: {detail}"),
        FailureKind::SchemaMismatch => format!("{tool} rejected the arguments: {detail}"),
        FailureKind::SessionUnavailable => format!("{tool} is unavailable right now."),
        FailureKind::UnknownTool => format!("{tool} is not available."),
        FailureKind::DuplicateRequest => format!("{tool} was already running for this request."),
        FailureKind::Transport | FailureKind::Protocol => {
            format!("{tool} could not be reached. Please try again.")
        }
    }
}

fn format_rejection(rejected: &RejectedCall) -> FormattedOutput {
    let (outcome, text) = match &rejected.reason {
        RejectionReason::UnknownTool { suggestions } if suggestions.is_empty() => (
            UserOutcome::ToolUnavailable,
            format!("No tool named '{}' is available.", rejected.name),
        ),
        RejectionReason::UnknownTool { suggestions } => (
            UserOutcome::ToolUnavailable,
            format!(
                "No tool named '{}' is available. Did you mean: {}?",
                rejected.name,
                suggestions.join(", ")
            ),
        ),
        RejectionReason::AmbiguousTool { candidates } => (
            UserOutcome::InvalidRequest,
            format!("'{}' matches several tools: {}.", rejected.name, candidates.join(", ")),
        ),
        RejectionReason::SchemaMismatch { detail } => (
            UserOutcome::InvalidRequest,
            format!("Invalid arguments for '{}': {detail}", rejected.name),
        ),
        RejectionReason::OverLimit { max_calls } => (
            UserOutcome::InvalidRequest,
            format!("'{}' was skipped: at most {max_calls} tools run per request.", rejected.name),
        ),
    };
    FormattedOutput {
        request_id: None,
        tool: rejected.name.clone(),
        outcome,
        text,
        payload: None,
        elapsed_ms: 0,
    }
}

fn plan_status(outputs: &[FormattedOutput]) -> PlanStatus {
    let succeeded = outputs.iter().filter(|o| o.outcome == UserOutcome::Success).count();
    match succeeded {
        0 => PlanStatus::Failed,
        n if n == outputs.len() => PlanStatus::Success,
        _ => PlanStatus::PartialSuccess,
    }
}

fn error_result(error: &ExecutionError) -> ExecutionResult {
    if error.is_timeout() {
        ExecutionResult::Error {
            outcome: UserOutcome::TimedOut,
            message: "Understanding the request took too long. Please try again.".to_string(),
        }
    } else {
        ExecutionResult::Error {
            outcome: UserOutcome::Failed,
            message: "The assistant is unavailable right now. Please try again later.".to_string(),
        }
    }
}

fn result_label(result: &ExecutionResult) -> &'static str {
    match result {
        ExecutionResult::Completed { status: PlanStatus::Success, .. } => "success",
        ExecutionResult::Completed { status: PlanStatus::PartialSuccess, .. } => "partial_success",
        ExecutionResult::Completed { status: PlanStatus::Failed, .. } => "failed",
        ExecutionResult::Clarification { .. } => "clarification",
        ExecutionResult::Reply { .. } => "reply",
        ExecutionResult::Error { .. } => "error",
    }
}

/// Truncate to at most `max_chars` characters, marking the cut.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_end, _)) => format!("{}...", &text[..byte_end]),
        None => text.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
