//! Line-oriented driver.
//!
//! `mcp-dispatch <config.yaml>` connects the configured tool servers, then
//! executes each stdin line as an utterance and prints the result as one
//! line of JSON. Without a `models` section, lines of the form
//! `server.tool {json args}` are dispatched directly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};

use mcp_dispatch::agent_core::{ConversationContext, ExecutionService, IntentResolver, TurnRole};
use mcp_dispatch::config::load_config;
use mcp_dispatch::inference::{InferenceClient, LlmIntentCapability};
use mcp_dispatch::mcp_client::McpClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(path) = std::env::args().nth(1).map(PathBuf::from) else {
        bail!("usage: mcp-dispatch <config.yaml>");
    };
    let config = load_config(&path).with_context(|| format!("loading {}", path.display()))?;
    if let Some(log_file) = mcp_dispatch::init_tracing(&config.logging) {
        eprintln!("logging to {}", log_file.display());
    }

    let client = McpClient::new(&config);
    for (server, error) in client.start_all().await {
        eprintln!("server '{server}' failed to start: {error}");
    }

    let service = match config.models.clone() {
        Some(models) => {
            let inference = InferenceClient::from_config(models).context("building inference client")?;
            let resolver = IntentResolver::new(
                Arc::new(LlmIntentCapability::new(inference)),
                config.intent.clone(),
                config.dispatch.default_timeout(),
            );
            Some(ExecutionService::new(resolver, &client, config.execution.clone()))
        }
        None => None,
    };

    let mut context = ConversationContext::new().with_session(uuid::Uuid::new_v4().to_string());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let output = match &service {
            Some(service) => {
                let result = service.execute(line, &context).await;
                context = context
                    .with_turn(TurnRole::User, line)
                    .with_turn(TurnRole::Assistant, result.assistant_text());
                serde_json::to_string(&result)?
            }
            None => direct_call(&client, line).await,
        };
        println!("{output}");
    }

    client.shutdown_all().await;
    Ok(())
}

/// `server.tool {json}` → one dispatched call, printed as its result.
async fn direct_call(client: &McpClient, line: &str) -> String {
    let (name, args) = line.split_once(char::is_whitespace).unwrap_or((line, "{}"));
    let arguments: serde_json::Value = match serde_json::from_str(args.trim()) {
        Ok(v) => v,
        Err(e) => return serde_json::json!({"error": format!("arguments for {name} are not JSON: {e}")}).to_string(),
    };

    match client.call_tool(name, arguments).await {
        Ok(result) => serde_json::to_value(&result)
            .unwrap_or_else(|e| serde_json::json!({"error": e.to_string()}))
            .to_string(),
        Err(e) => serde_json::json!({"error": e.to_string()}).to_string(),
    }
}
