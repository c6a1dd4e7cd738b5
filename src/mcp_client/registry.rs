//! Tool Registry: aggregated catalog of tools across all live sessions.
//!
//! Readers take an `Arc<RegistrySnapshot>` and work on it without holding any
//! lock. Writers build a new snapshot and swap it in, replacing one server's
//! whole tool set at a time. A reader therefore sees either all of a server's
//! tools from one handshake generation or none of them.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use super::errors::McpError;
use super::types::ToolDescriptor;

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Tools announced by one server during one handshake generation.
#[derive(Debug)]
struct ServerTools {
    generation: u64,
    tools: BTreeMap<String, ToolDescriptor>,
}

/// Immutable view of the registry at one instant.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    servers: BTreeMap<String, Arc<ServerTools>>,
}

impl RegistrySnapshot {
    /// Look up a tool by server and bare tool name.
    pub fn get(&self, server_id: &str, tool_name: &str) -> Option<&ToolDescriptor> {
        self.servers.get(server_id)?.tools.get(tool_name)
    }

    /// Handshake generation whose tools are currently published for a server.
    pub fn generation(&self, server_id: &str) -> Option<u64> {
        self.servers.get(server_id).map(|s| s.generation)
    }

    /// All registered tools, ordered by server then tool name.
    pub fn all_tools(&self) -> Vec<&ToolDescriptor> {
        self.servers
            .values()
            .flat_map(|s| s.tools.values())
            .collect()
    }

    /// Qualified names (`server.tool`) of all registered tools.
    pub fn qualified_names(&self) -> Vec<String> {
        self.all_tools()
            .into_iter()
            .map(ToolDescriptor::qualified_name)
            .collect()
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn tools_for_server(&self, server_id: &str) -> usize {
        self.servers.get(server_id).map_or(0, |s| s.tools.len())
    }

    /// Total number of registered tools.
    pub fn len(&self) -> usize {
        self.servers.values().map(|s| s.tools.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize all tool definitions into OpenAI function-calling format.
    ///
    /// Function names are qualified (`server.tool`) so the model's choice
    /// maps back to exactly one server.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.all_tools()
            .into_iter()
            .map(|tool| {
                let parameters = if tool.input_schema.is_null() {
                    serde_json::json!({"type": "object", "properties": {}})
                } else {
                    tool.input_schema.clone()
                };
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.qualified_name(),
                        "description": tool.description,
                        "parameters": parameters,
                    }
                })
            })
            .collect()
    }

    /// Compact capability summary for the system prompt.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No tools are currently available.".to_string();
        }

        let server_parts: Vec<String> = self
            .servers
            .iter()
            .map(|(id, s)| format!("{id} ({})", s.tools.len()))
            .collect();

        let mut summary = format!(
            "Available capabilities ({} tools across {} servers): {}.",
            self.len(),
            self.servers.len(),
            server_parts.join(", "),
        );

        let read_only: Vec<String> = self
            .all_tools()
            .into_iter()
            .filter(|t| t.idempotent)
            .map(ToolDescriptor::qualified_name)
            .collect();
        if !read_only.is_empty() {
            summary.push_str(&format!(
                "\nSafe to repeat: {}.",
                read_only.join(", ")
            ));
        }

        summary
    }
}

// ─── Tool Resolution ─────────────────────────────────────────────────────────

/// Result of resolving a model-proposed tool name against a snapshot.
///
/// Names are never auto-corrected to a different tool; near misses come back
/// as `NotFound` with suggestions so the caller can flag them.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResolution {
    /// Qualified `server.tool` name found as-is.
    Exact(ToolDescriptor),

    /// Bare tool name that uniquely matched one registered tool.
    Unprefixed {
        tool: ToolDescriptor,
        original: String,
    },

    /// Bare tool name offered by more than one server.
    Ambiguous {
        original: String,
        candidates: Vec<String>,
    },

    /// No match. `suggestions` holds up to 3 similar qualified names.
    NotFound {
        original: String,
        suggestions: Vec<String>,
    },
}

impl ToolResolution {
    /// The resolved descriptor, if resolution succeeded.
    pub fn descriptor(&self) -> Option<&ToolDescriptor> {
        match self {
            Self::Exact(tool) | Self::Unprefixed { tool, .. } => Some(tool),
            Self::Ambiguous { .. } | Self::NotFound { .. } => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.descriptor().is_some()
    }
}

impl RegistrySnapshot {
    /// Resolve a tool name that may be qualified, bare, or hallucinated.
    ///
    /// 1. **Exact:** `server.tool` exists.
    /// 2. **Unprefixed:** a bare name (or a dotted name that is not a
    ///    qualified match) matching exactly one tool across servers.
    /// 3. **Ambiguous / NotFound** otherwise.
    pub fn resolve(&self, name: &str) -> ToolResolution {
        if let Some((server_id, tool_name)) = name.split_once('.') {
            if let Some(tool) = self.get(server_id, tool_name) {
                return ToolResolution::Exact(tool.clone());
            }
        }

        let candidates: Vec<&ToolDescriptor> = self
            .all_tools()
            .into_iter()
            .filter(|t| t.name == name)
            .collect();

        match candidates.as_slice() {
            [tool] => ToolResolution::Unprefixed {
                tool: (*tool).clone(),
                original: name.to_string(),
            },
            [] => ToolResolution::NotFound {
                original: name.to_string(),
                suggestions: self.find_similar(name, 3),
            },
            many => ToolResolution::Ambiguous {
                original: name.to_string(),
                candidates: many.iter().map(|t| t.qualified_name()).collect(),
            },
        }
    }

    /// Up to `max_results` qualified names most similar to `name`.
    ///
    /// Compares tool names only, ignoring any server prefix on the query.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let query = name.rsplit('.').next().unwrap_or(name);

        let mut scored: Vec<(String, f64)> = self
            .all_tools()
            .into_iter()
            .map(|t| (t.qualified_name(), similarity(query, &t.name)))
            .filter(|(_, score)| *score > 0.3)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name).collect()
    }
}

// ─── Edit Distance ───────────────────────────────────────────────────────────

/// Levenshtein edit distance over chars.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Normalized similarity, 0.0 (unrelated) to 1.0 (identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Shared, read-mostly tool catalog.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    inner: RwLock<Arc<RegistrySnapshot>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. Cheap; holds no lock after returning.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Atomically replace one server's tool set.
    ///
    /// The whole set is validated first; on any error nothing is published
    /// and the previous set (if any) stays visible. A generation older than
    /// the one already published is rejected so a slow, superseded handshake
    /// cannot overwrite a newer one.
    pub fn replace_server(
        &self,
        server_id: &str,
        generation: u64,
        tools: Vec<ToolDescriptor>,
    ) -> Result<usize, McpError> {
        let mut by_name = BTreeMap::new();
        let mut seen = HashSet::new();
        for tool in tools {
            if tool.server_id != server_id {
                return Err(McpError::InvalidToolSet {
                    server: server_id.to_string(),
                    reason: format!(
                        "tool '{}' claims server '{}'",
                        tool.name, tool.server_id
                    ),
                });
            }
            if tool.name.trim().is_empty() {
                return Err(McpError::InvalidToolSet {
                    server: server_id.to_string(),
                    reason: "tool with empty name".into(),
                });
            }
            if !seen.insert(tool.name.clone()) {
                return Err(McpError::InvalidToolSet {
                    server: server_id.to_string(),
                    reason: format!("duplicate tool name '{}'", tool.name),
                });
            }
            by_name.insert(tool.name.clone(), tool);
        }

        let count = by_name.len();
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if let Some(current) = guard.generation(server_id) {
            if generation < current {
                return Err(McpError::InvalidToolSet {
                    server: server_id.to_string(),
                    reason: format!(
                        "stale generation {generation} (published: {current})"
                    ),
                });
            }
        }

        let mut servers = guard.servers.clone();
        servers.insert(
            server_id.to_string(),
            Arc::new(ServerTools {
                generation,
                tools: by_name,
            }),
        );
        *guard = Arc::new(RegistrySnapshot { servers });

        tracing::info!(server = %server_id, generation, tool_count = count, "registered tool set");
        Ok(count)
    }

    /// Remove a server's tools. With `Some(generation)`, only removes them if
    /// that generation is still the published one. Returns whether anything
    /// was removed.
    pub fn remove_server(&self, server_id: &str, generation: Option<u64>) -> bool {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());

        match (guard.generation(server_id), generation) {
            (None, _) => return false,
            (Some(current), Some(expected)) if current != expected => return false,
            _ => {}
        }

        let mut servers = guard.servers.clone();
        servers.remove(server_id);
        *guard = Arc::new(RegistrySnapshot { servers });

        tracing::info!(server = %server_id, "removed tool set");
        true
    }

    /// Look up a tool by server and name, cloning the descriptor.
    pub fn get(&self, server_id: &str, tool_name: &str) -> Option<ToolDescriptor> {
        self.snapshot().get(server_id, tool_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(server: &str, name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            server_id: server.to_string(),
            description: format!("{name} tool"),
            input_schema: json!({"type": "object"}),
            output_schema: None,
            idempotent: false,
            call_timeout: None,
        }
    }

    fn sample_registry() -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry
            .replace_server("web", 1, vec![tool("web", "search_web"), tool("web", "fetch_page")])
            .unwrap();
        registry
            .replace_server("crypto", 1, vec![tool("crypto", "get_price")])
            .unwrap();
        registry
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = sample_registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.get("crypto", "get_price").is_some());
        assert!(registry.get("web", "get_price").is_none());

        let snap = registry.snapshot();
        assert_eq!(snap.server_ids(), vec!["crypto", "web"]);
        assert_eq!(snap.tools_for_server("web"), 2);
    }

    #[test]
    fn test_replace_is_whole_set_not_merge() {
        let registry = sample_registry();
        registry
            .replace_server("web", 2, vec![tool("web", "screenshot")])
            .unwrap();

        let snap = registry.snapshot();
        assert_eq!(snap.tools_for_server("web"), 1);
        assert!(snap.get("web", "search_web").is_none());
        assert!(snap.get("web", "screenshot").is_some());
        assert_eq!(snap.generation("web"), Some(2));
    }

    #[test]
    fn test_invalid_tool_set_publishes_nothing() {
        let registry = sample_registry();
        let err = registry
            .replace_server(
                "web",
                2,
                vec![tool("web", "screenshot"), tool("web", "screenshot")],
            )
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidToolSet { .. }));

        let snap = registry.snapshot();
        assert_eq!(snap.tools_for_server("web"), 2);
        assert_eq!(snap.generation("web"), Some(1));

        let err = registry
            .replace_server("web", 3, vec![tool("crypto", "get_price")])
            .unwrap_err();
        assert!(err.to_string().contains("claims server 'crypto'"));
    }

    #[test]
    fn test_stale_generation_rejected() {
        let registry = sample_registry();
        registry.replace_server("web", 5, vec![tool("web", "a")]).unwrap();
        assert!(registry.replace_server("web", 4, vec![tool("web", "b")]).is_err());
        assert!(registry.get("web", "a").is_some());
    }

    #[test]
    fn test_old_snapshot_unaffected_by_swap() {
        let registry = sample_registry();
        let before = registry.snapshot();
        registry.remove_server("web", None);

        assert_eq!(before.tools_for_server("web"), 2);
        assert_eq!(registry.snapshot().tools_for_server("web"), 0);
    }

    #[test]
    fn test_remove_server_checks_generation() {
        let registry = sample_registry();
        assert!(!registry.remove_server("web", Some(7)));
        assert_eq!(registry.len(), 3);
        assert!(registry.remove_server("web", Some(1)));
        assert_eq!(registry.len(), 1);
        assert!(!registry.remove_server("web", None));
    }

    #[test]
    fn test_resolve_exact_and_unprefixed() {
        let snap = sample_registry().snapshot();
        match snap.resolve("crypto.get_price") {
            ToolResolution::Exact(t) => assert_eq!(t.name, "get_price"),
            other => panic!("expected Exact, got {other:?}"),
        }
        match snap.resolve("get_price") {
            ToolResolution::Unprefixed { tool, original } => {
                assert_eq!(tool.server_id, "crypto");
                assert_eq!(original, "get_price");
            }
            other => panic!("expected Unprefixed, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_ambiguous() {
        let registry = sample_registry();
        registry
            .replace_server("mirror", 1, vec![tool("mirror", "search_web")])
            .unwrap();
        match registry.snapshot().resolve("search_web") {
            ToolResolution::Ambiguous { candidates, .. } => {
                assert_eq!(candidates, vec!["mirror.search_web", "web.search_web"]);
            }
            other => panic!("expected Ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_never_autocorrects() {
        let snap = sample_registry().snapshot();
        let resolution = snap.resolve("crypto.get_prices");
        assert!(!resolution.is_resolved());
        match resolution {
            ToolResolution::NotFound { suggestions, .. } => {
                assert_eq!(suggestions.first().map(String::as_str), Some("crypto.get_price"));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_to_openai_tools_uses_qualified_names() {
        let tools = sample_registry().snapshot().to_openai_tools();
        assert_eq!(tools.len(), 3);
        let names: Vec<&str> = tools
            .iter()
            .filter_map(|t| t["function"]["name"].as_str())
            .collect();
        assert!(names.contains(&"crypto.get_price"));
        assert_eq!(tools[0]["type"], "function");
    }

    #[test]
    fn test_capability_summary() {
        assert!(ToolRegistry::new()
            .snapshot()
            .capability_summary()
            .contains("No tools"));

        let registry = ToolRegistry::new();
        let mut price = tool("crypto", "get_price");
        price.idempotent = true;
        registry.replace_server("crypto", 1, vec![price]).unwrap();
        let summary = registry.snapshot().capability_summary();
        assert!(summary.contains("1 tools across 1 servers"));
        assert!(summary.contains("Safe to repeat: crypto.get_price"));
    }

    #[test]
    fn test_levenshtein_and_similarity() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
        assert!((similarity("", "") - 1.0).abs() < f64::EPSILON);
        assert!(similarity("get_price", "get_prices") > 0.8);
    }
}
