//! Daemon configuration
//!
//! All options come from the environment; there is no config file parsing
//! here. Every duration-valued option is milliseconds in the environment.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default relay set when `TENEX_RELAYS` is unset.
pub const DEFAULT_RELAYS: &[&str] = &["wss://tenex.chat"];

const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1_800_000;
const DEFAULT_MAX_STEPS: u32 = 20;
const DEFAULT_DELEGATION_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_MAX_CONVERSATION_TOKENS: usize = 64_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
    #[error("relay URL must start with ws:// or wss://: {0:?}")]
    InvalidRelayUrl(String),
}

/// Model routing table: which model serves which role.
#[derive(Debug, Clone)]
pub struct LlmRouting {
    pub agents: String,
    pub analyze: String,
    pub orchestrator: String,
}

impl Default for LlmRouting {
    fn default() -> Self {
        Self {
            agents: "claude-sonnet-4-5".to_string(),
            analyze: "claude-haiku-4-5".to_string(),
            orchestrator: "claude-sonnet-4-5".to_string(),
        }
    }
}

impl LlmRouting {
    /// Resolve a routing role name to a model string.
    ///
    /// Unknown roles fall back to the `agents` model.
    pub fn model_for(&self, role: &str) -> &str {
        match role {
            "analyze" => &self.analyze,
            "orchestrator" => &self.orchestrator,
            _ => &self.agents,
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay URLs for the consolidated subscription.
    pub relays: Vec<String>,
    /// Root of per-project state (`{state_dir}/projects/{slug}/...`).
    pub state_dir: PathBuf,
    /// Global agent definition directory (`{global_dir}/agents/{pubkey}.json`).
    pub global_dir: PathBuf,
    /// Project runtime teardown delay.
    pub idle_timeout: Duration,
    /// Executor step limit per turn.
    pub max_steps: u32,
    /// Default delegation await timeout.
    pub delegation_timeout: Duration,
    /// Conversation pruning threshold, in approximate tokens.
    pub max_conversation_tokens: usize,
    /// Model routing table.
    pub llm: LlmRouting,
    /// Provider credential, if any. Absence is not a config error: the
    /// daemon starts and reports provider failures per turn.
    pub llm_api_key: Option<String>,
}

impl Config {
    /// Read configuration from the environment.
    ///
    /// Unset variables take defaults; set-but-unparsable variables are
    /// `ConfigError` (the daemon exits 2 rather than running with a value
    /// the operator did not intend).
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        let base = std::env::var("TENEX_DIR")
            .map_or_else(|_| PathBuf::from(&home).join(".tenex"), PathBuf::from);

        let relays: Vec<String> = match std::env::var("TENEX_RELAYS") {
            Ok(v) => v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => DEFAULT_RELAYS.iter().map(|s| (*s).to_string()).collect(),
        };
        validate_relays(&relays)?;

        let mut llm = LlmRouting::default();
        if let Ok(v) = std::env::var("TENEX_MODEL_AGENTS") {
            llm.agents = v;
        }
        if let Ok(v) = std::env::var("TENEX_MODEL_ANALYZE") {
            llm.analyze = v;
        }
        if let Ok(v) = std::env::var("TENEX_MODEL_ORCHESTRATOR") {
            llm.orchestrator = v;
        }

        Ok(Self {
            relays,
            state_dir: base.join("projects"),
            global_dir: base.clone(),
            idle_timeout: Duration::from_millis(env_u64(
                "TENEX_IDLE_TIMEOUT_MS",
                DEFAULT_IDLE_TIMEOUT_MS,
            )?),
            max_steps: u32::try_from(env_u64(
                "TENEX_MAX_STEPS",
                u64::from(DEFAULT_MAX_STEPS),
            )?)
            .map_err(|_| ConfigError::InvalidValue {
                var: "TENEX_MAX_STEPS",
                value: "out of range".to_string(),
            })?,
            delegation_timeout: Duration::from_millis(env_u64(
                "TENEX_DELEGATION_TIMEOUT_MS",
                DEFAULT_DELEGATION_TIMEOUT_MS,
            )?),
            max_conversation_tokens: usize::try_from(env_u64(
                "TENEX_MAX_CONVERSATION_TOKENS",
                DEFAULT_MAX_CONVERSATION_TOKENS as u64,
            )?)
            .map_err(|_| ConfigError::InvalidValue {
                var: "TENEX_MAX_CONVERSATION_TOKENS",
                value: "out of range".to_string(),
            })?,
            llm,
            llm_api_key: std::env::var("TENEX_LLM_API_KEY").ok(),
        })
    }

    /// State directory for one project, keyed by its `d` tag.
    pub fn project_dir(&self, project_slug: &str) -> PathBuf {
        self.state_dir.join(project_slug)
    }

    /// Global agent definition directory.
    pub fn agents_dir(&self) -> PathBuf {
        self.global_dir.join("agents")
    }
}

fn env_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue { var, value: v }),
        Err(_) => Ok(default),
    }
}

fn validate_relays(relays: &[String]) -> Result<(), ConfigError> {
    for url in relays {
        if !(url.starts_with("wss://") || url.starts_with("ws://")) {
            return Err(ConfigError::InvalidRelayUrl(url.clone()));
        }
    }
    Ok(())
}
