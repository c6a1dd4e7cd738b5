//! LLM-backed intent capability.
//!
//! Sends the utterance, prior turns, and the registry's tools as OpenAI
//! function definitions; reads back tool calls, free text, and a
//! self-reported confidence line.

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::client::InferenceClient;
use super::errors::InferenceError;
use super::types::{ChatMessage, ChatResponse};
use crate::agent_core::intent::{
    CandidateCall, ConversationContext, IntentCapability, Proposal, ToolCatalog, TurnRole,
};

/// Confidence assumed when the model does not report one.
const DEFAULT_CONFIDENCE: f64 = 1.0;

const CONFIDENCE_LABEL: &str = "confidence:";

/// `IntentCapability` over an OpenAI-compatible chat endpoint.
///
/// The client is behind an async mutex: it tracks its position in the
/// fallback chain, so concurrent proposals are serialized.
pub struct LlmIntentCapability {
    client: Mutex<InferenceClient>,
}

impl LlmIntentCapability {
    pub fn new(client: InferenceClient) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }

    fn system_prompt(catalog: &ToolCatalog) -> String {
        format!(
            "You are an assistant that acts by calling tools.\n\
             {summary}\n\
             Call a tool only when the request clearly needs one, using the exact \
             function names given (server.tool) and arguments that match its schema. \
             If the request is ambiguous, call no tool and ask a short clarifying question. \
             If no tool is needed, answer directly.\n\
             End every reply with a line `Confidence: <number between 0 and 1>` \
             stating how sure you are that you understood the request.",
            summary = catalog.capability_summary()
        )
    }

    fn build_messages(utterance: &str, catalog: &ToolCatalog, context: &ConversationContext) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(context.turns.len() + 2);
        messages.push(ChatMessage::system(Self::system_prompt(catalog)));
        messages.extend(context.turns.iter().map(|turn| match turn.role {
            TurnRole::User => ChatMessage::user(turn.text.clone()),
            TurnRole::Assistant => ChatMessage::assistant(turn.text.clone()),
        }));
        messages.push(ChatMessage::user(utterance));
        messages
    }
}

#[async_trait]
impl IntentCapability for LlmIntentCapability {
    async fn propose(
        &self,
        utterance: &str,
        catalog: &ToolCatalog,
        context: &ConversationContext,
    ) -> Result<Proposal, InferenceError> {
        let messages = Self::build_messages(utterance, catalog, context);
        let tools = catalog.to_openai_tools();
        let tools = (!tools.is_empty()).then_some(tools);

        let response = {
            let mut client = self.client.lock().await;
            client.chat_completion(messages, tools).await?
        };
        Ok(to_proposal(response))
    }
}

fn to_proposal(response: ChatResponse) -> Proposal {
    let (reply, confidence) = match response.content.as_deref() {
        Some(text) => split_confidence(text),
        None => (None, None),
    };
    Proposal {
        calls: response
            .tool_calls
            .into_iter()
            .map(|call| CandidateCall {
                name: call.name,
                arguments: call.arguments,
            })
            .collect(),
        confidence: confidence.unwrap_or(DEFAULT_CONFIDENCE),
        reply,
    }
}

/// Separate the last `Confidence: x` line from the reply text.
///
/// Lines that look like the label but carry no number are left in the text.
fn split_confidence(text: &str) -> (Option<String>, Option<f64>) {
    let mut confidence = None;
    let mut kept = Vec::new();

    for line in text.lines() {
        match parse_confidence_line(line) {
            Some(value) => confidence = Some(value),
            None => kept.push(line),
        }
    }

    let reply = kept.join("\n").trim().to_string();
    ((!reply.is_empty()).then_some(reply), confidence)
}

fn parse_confidence_line(line: &str) -> Option<f64> {
    let line = line.trim().trim_matches(|c| c == '*' || c == '`' || c == '_');
    let head = line.get(..CONFIDENCE_LABEL.len())?;
    if !head.eq_ignore_ascii_case(CONFIDENCE_LABEL) {
        return None;
    }
    let raw = line[CONFIDENCE_LABEL.len()..]
        .trim_start_matches(|c| c == '*' || c == '`' || c == '_')
        .trim()
        .trim_end_matches('.');
    let value = match raw.strip_suffix('%') {
        Some(percent) => percent.trim().parse::<f64>().ok()? / 100.0,
        None => raw.parse::<f64>().ok()?,
    };
    value.is_finite().then(|| value.clamp(0.0, 1.0))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
