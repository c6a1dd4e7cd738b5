//! Agent Core: from utterance to formatted tool results.
//!
//! Submodules:
//! - `intent`: Intent Resolver; validates LLM-proposed calls against the registry
//! - `executor`: Execution Service; resolver, dispatcher, result formatting
//! - `errors`: Agent-level error types

pub mod errors;
pub mod executor;
pub mod intent;

// Re-exports for convenience
pub use errors::ExecutionError;
pub use executor::{ExecutionResult, ExecutionService, FormattedOutput, PlanStatus, UserOutcome};
pub use intent::{
    CandidateCall, ConversationContext, IntentCapability, IntentPlan, IntentResolver, Proposal,
    RejectedCall, RejectionReason, ToolCatalog, Turn, TurnRole,
};
