//! Inference Client: the LLM capability behind intent resolution.
//!
//! This module handles all communication with the model endpoint:
//! - Non-streaming chat completions with a model fallback chain
//! - Tool call parsing (native JSON + Pythonic formats) and argument repair
//! - The `IntentCapability` implementation used by the resolver
//!
//! The client speaks the OpenAI Chat Completions API, so switching models is
//! a config change, not a code change.

pub mod capability;
pub mod client;
pub mod config;
pub mod errors;
pub mod response;
pub mod tool_call_parser;
pub mod types;

// Re-exports for convenience
pub use capability::LlmIntentCapability;
pub use client::InferenceClient;
pub use config::{ModelConfig, ModelsConfig, ToolCallFormat};
pub use errors::InferenceError;
pub use types::{ChatMessage, ChatResponse, Role, ToolCall};
