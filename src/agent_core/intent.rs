//! Intent Resolver: turns an utterance into a validated tool-call plan.
//!
//! The natural-language mapping itself is delegated to an `IntentCapability`
//! (normally the LLM adapter). This module owns everything around it: the
//! capability's timeout, the confidence gate, resolving proposed names
//! against the registry snapshot, and validating arguments against each
//! tool's input schema. Proposed calls that fail any check are dropped from
//! the plan and reported as rejected; nothing invalid reaches the dispatcher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ExecutionError;
use crate::config::IntentSettings;
use crate::inference::errors::InferenceError;
use crate::mcp_client::registry::{RegistrySnapshot, ToolResolution};
use crate::mcp_client::schema;
use crate::mcp_client::types::{ToolCallRequest, ToolDescriptor};

/// The catalog handed to the capability: a registry snapshot.
pub type ToolCatalog = RegistrySnapshot;

// ─── Conversation Context ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
}

/// Prior turns supplied by the caller. The core never stores these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_turn(mut self, role: TurnRole, text: impl Into<String>) -> Self {
        self.turns.push(Turn {
            role,
            text: text.into(),
        });
        self
    }
}

// ─── Capability Boundary ─────────────────────────────────────────────────────

/// One tool invocation proposed by the capability, not yet checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateCall {
    pub name: String,
    pub arguments: Value,
}

/// What the capability returns for one utterance.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Proposal {
    pub calls: Vec<CandidateCall>,
    /// In `[0, 1]`; values outside are clamped.
    pub confidence: f64,
    /// Free text from the model: an answer, a confirmation line, or a
    /// clarifying question.
    pub reply: Option<String>,
}

/// Maps an utterance plus the current tool catalog to candidate calls.
#[async_trait]
pub trait IntentCapability: Send + Sync {
    async fn propose(
        &self,
        utterance: &str,
        catalog: &ToolCatalog,
        context: &ConversationContext,
    ) -> Result<Proposal, InferenceError>;
}

// ─── Plan ────────────────────────────────────────────────────────────────────

/// Why a proposed call was kept out of the plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// No registered tool has this name.
    UnknownTool { suggestions: Vec<String> },
    /// A bare name offered by several servers.
    AmbiguousTool { candidates: Vec<String> },
    /// Arguments did not validate against the input schema.
    SchemaMismatch { detail: String },
    /// The proposal had more calls than a plan may hold.
    OverLimit { max_calls: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedCall {
    pub name: String,
    pub arguments: Value,
    pub reason: RejectionReason,
}

/// The resolver's output for one utterance.
#[derive(Debug, Clone)]
pub struct IntentPlan {
    pub utterance: String,
    /// Validated calls, in proposal order.
    pub resolved_tool_calls: Vec<ToolCallRequest>,
    pub confidence: f64,
    /// Set when confidence was below the threshold; the plan is then empty.
    pub needs_clarification: bool,
    pub rejected: Vec<RejectedCall>,
    pub reply: Option<String>,
}

impl IntentPlan {
    /// No calls to dispatch and nothing rejected.
    pub fn is_empty(&self) -> bool {
        self.resolved_tool_calls.is_empty() && self.rejected.is_empty()
    }
}

// ─── IntentResolver ──────────────────────────────────────────────────────────

pub struct IntentResolver {
    capability: Arc<dyn IntentCapability>,
    settings: IntentSettings,
    /// Deadline for tools without a server-specific call timeout.
    default_call_timeout: Duration,
}

impl IntentResolver {
    pub fn new(
        capability: Arc<dyn IntentCapability>,
        settings: IntentSettings,
        default_call_timeout: Duration,
    ) -> Self {
        Self {
            capability,
            settings,
            default_call_timeout,
        }
    }

    /// Resolve an utterance against a catalog snapshot.
    ///
    /// The only suspension point is the capability call, bounded by the
    /// intent timeout. Everything after it is synchronous.
    pub async fn resolve(
        &self,
        utterance: &str,
        catalog: &ToolCatalog,
        context: &ConversationContext,
    ) -> Result<IntentPlan, ExecutionError> {
        let started = Instant::now();
        let timeout = self.settings.llm_timeout();

        let proposal = tokio::time::timeout(timeout, self.capability.propose(utterance, catalog, context))
            .await
            .map_err(|_| ExecutionError::IntentTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })??;

        let confidence = if proposal.confidence.is_nan() {
            0.0
        } else {
            proposal.confidence.clamp(0.0, 1.0)
        };

        let mut plan = IntentPlan {
            utterance: utterance.to_string(),
            resolved_tool_calls: Vec::new(),
            confidence,
            needs_clarification: false,
            rejected: Vec::new(),
            reply: proposal.reply,
        };

        if confidence < self.settings.confidence_threshold {
            tracing::info!(
                confidence,
                threshold = self.settings.confidence_threshold,
                proposed = proposal.calls.len(),
                "confidence below threshold, asking for clarification"
            );
            plan.needs_clarification = true;
            return Ok(plan);
        }

        for (index, candidate) in proposal.calls.into_iter().enumerate() {
            if index >= self.settings.max_calls {
                plan.rejected.push(RejectedCall {
                    name: candidate.name,
                    arguments: candidate.arguments,
                    reason: RejectionReason::OverLimit {
                        max_calls: self.settings.max_calls,
                    },
                });
                continue;
            }
            match self.check(candidate, catalog) {
                Ok(request) => plan.resolved_tool_calls.push(request),
                Err(rejected) => {
                    tracing::warn!(
                        tool = %rejected.name,
                        reason = ?rejected.reason,
                        "proposed call dropped from plan"
                    );
                    plan.rejected.push(rejected);
                }
            }
        }

        tracing::info!(
            confidence,
            resolved = plan.resolved_tool_calls.len(),
            rejected = plan.rejected.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "intent resolved"
        );
        Ok(plan)
    }

    /// Resolve the name and validate the arguments of one candidate.
    fn check(&self, candidate: CandidateCall, catalog: &ToolCatalog) -> Result<ToolCallRequest, RejectedCall> {
        let CandidateCall { name, arguments } = candidate;
        let arguments = match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        let descriptor = match catalog.resolve(&name) {
            ToolResolution::Exact(tool) => tool,
            ToolResolution::Unprefixed { tool, original } => {
                tracing::debug!(original = %original, resolved = %tool.qualified_name(), "resolved bare tool name");
                tool
            }
            ToolResolution::Ambiguous { candidates, .. } => {
                return Err(RejectedCall {
                    name,
                    arguments,
                    reason: RejectionReason::AmbiguousTool { candidates },
                })
            }
            ToolResolution::NotFound { suggestions, .. } => {
                return Err(RejectedCall {
                    name,
                    arguments,
                    reason: RejectionReason::UnknownTool { suggestions },
                })
            }
        };

        if let Err(detail) = validate_arguments(&descriptor, &arguments) {
            return Err(RejectedCall {
                name,
                arguments,
                reason: RejectionReason::SchemaMismatch { detail },
            });
        }

        let timeout = descriptor.call_timeout.unwrap_or(self.default_call_timeout);
        Ok(ToolCallRequest::new(
            &descriptor.server_id,
            &descriptor.name,
            arguments,
            timeout,
        ))
    }
}

fn validate_arguments(descriptor: &ToolDescriptor, arguments: &Value) -> Result<(), String> {
    if !arguments.is_object() {
        return Err("arguments must be a JSON object".to_string());
    }
    schema::validate(&descriptor.input_schema, arguments).map_err(|v| v.to_string())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
