//! Core configuration.
//!
//! Every section is defaulted, so an empty document is a valid config with no
//! servers. `load_config` reads YAML with `${VAR}` / `${VAR:-default}`
//! interpolation; the library API itself accepts already-built values.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::config::ModelsConfig;
use crate::mcp_client::types::ServerConfig;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Sections ────────────────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Tool servers, connected in this order.
    pub servers: Vec<ServerConfig>,
    pub session: SessionSettings,
    pub dispatch: DispatchSettings,
    pub intent: IntentSettings,
    pub execution: ExecutionSettings,
    pub logging: LoggingSettings,
    /// LLM endpoints. Absent means no intent capability is configured.
    pub models: Option<ModelsConfig>,
}

/// Session lifecycle timing and health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Transport connect plus initialize and tool listing.
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Consecutive heartbeat failures that move Ready to Degraded.
    pub degrade_threshold: u32,
    /// Consecutive heartbeat failures that close the session.
    pub close_threshold: u32,
    /// How long a closing session waits for in-flight calls.
    pub drain_grace_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub reconnect: BackoffPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 10_000,
            degrade_threshold: 3,
            close_threshold: 6,
            drain_grace_ms: 10_000,
            shutdown_timeout_ms: 5_000,
            reconnect: BackoffPolicy::default(),
        }
    }
}

impl SessionSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Exponential backoff with jitter for reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomized, centred on the nominal value.
    pub jitter: f64,
    /// Reconnect attempts before the server is marked failed.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 30_000,
            jitter: 0.1,
            max_attempts: 5,
        }
    }
}

/// Floor applied after jitter.
const MIN_BACKOFF: Duration = Duration::from_millis(100);

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    ///
    /// `min(base * factor^attempt, max)`, then `± jitter/2` of that, floored
    /// at 100ms.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let nominal = (self.base_delay_ms as f64 * self.factor.powi(exp))
            .min(self.max_delay_ms as f64);
        let spread = nominal * self.jitter * (0.5 - rand::thread_rng().gen::<f64>());
        let millis = (nominal + spread).max(MIN_BACKOFF.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Dispatcher behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Deadline for calls whose server sets no `call_timeout_ms`.
    pub default_timeout_ms: u64,
    /// Retry idempotent calls once on transport failure.
    pub retry_idempotent: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            retry_idempotent: true,
        }
    }
}

impl DispatchSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Intent resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentSettings {
    /// Plans below this confidence become clarification requests.
    pub confidence_threshold: f64,
    /// Timeout for the LLM call, independent of tool deadlines.
    pub llm_timeout_ms: u64,
    /// Upper bound on calls accepted from one proposal.
    pub max_calls: usize,
}

impl Default for IntentSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            llm_timeout_ms: 30_000,
            max_calls: 8,
        }
    }
}

impl IntentSettings {
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }
}

/// Result formatting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Formatted text per tool output is truncated to this many characters.
    pub max_output_chars: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_output_chars: 4_000,
        }
    }
}

/// Log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for `mcp-dispatch.log`. Defaults to the platform data dir.
    pub log_dir: Option<PathBuf>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
    /// Rotated log files kept on startup.
    pub keep_rotated: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_dir: None,
            filter: "mcp_dispatch=info,warn".to_string(),
            json: false,
            keep_rotated: 3,
        }
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

impl CoreConfig {
    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::Invalid { reason });

        let mut seen = HashSet::new();
        for server in &self.servers {
            if let Err(reason) = server.validate_id() {
                return invalid(reason);
            }
            let id = server.server_id.trim();
            if !seen.insert(id) {
                return invalid(format!("duplicate server_id '{id}'"));
            }
            if server.address.trim().is_empty() {
                return invalid(format!("server '{id}' has an empty address"));
            }
        }

        let session = &self.session;
        if session.degrade_threshold == 0 {
            return invalid("session.degrade_threshold must be at least 1".into());
        }
        if session.close_threshold < session.degrade_threshold {
            return invalid("session.close_threshold must be >= degrade_threshold".into());
        }
        if session.heartbeat_interval_ms == 0 {
            return invalid("session.heartbeat_interval_ms must be positive".into());
        }
        let backoff = &session.reconnect;
        if backoff.factor < 1.0 {
            return invalid("session.reconnect.factor must be >= 1.0".into());
        }
        if !(0.0..=1.0).contains(&backoff.jitter) {
            return invalid("session.reconnect.jitter must be within 0.0..=1.0".into());
        }
        if !(0.0..=1.0).contains(&self.intent.confidence_threshold) {
            return invalid("intent.confidence_threshold must be within 0.0..=1.0".into());
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load, interpolate, parse, and validate a YAML config file.
pub fn load_config(path: &Path) -> Result<CoreConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw)
}

/// Parse a YAML config document.
pub fn parse_config(raw: &str) -> Result<CoreConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    let config: CoreConfig = if interpolated.trim().is_empty() {
        CoreConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?
    };
    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
