use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the two subconscious memory modules.
///
/// Per-agent environment keys (`{AGENT}_MEMORY_CREATOR_ENABLED`) take
/// precedence over the global ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryModuleConfig {
    pub creator_enabled: bool,
    pub retriever_enabled: bool,
    pub creator_run_every_n_turns: u64,
    pub retriever_run_every_n_turns: u64,
    pub retriever_max_iterations: usize,
    pub creator_context_messages: usize,
    pub retriever_context_messages: usize,
}

impl Default for MemoryModuleConfig {
    fn default() -> Self {
        Self {
            creator_enabled: true,
            retriever_enabled: true,
            creator_run_every_n_turns: 1,
            retriever_run_every_n_turns: 1,
            retriever_max_iterations: 3,
            creator_context_messages: 10,
            retriever_context_messages: 10,
        }
    }
}

/// Per-agent runtime configuration, resolved from the process environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable identifier, conventionally suffixed `_agent`.
    pub agent_name: String,
    pub agent_display_name: String,
    /// Root directory for the embedded broker and memory store files.
    pub data_dir: PathBuf,
    pub api_gateway_url: String,
    pub gemini_api_key: String,
    pub system_prompt_path: PathBuf,
    pub internal_key_path: PathBuf,
    /// Poll interval of the main loop, seconds.
    pub check_interval_seconds: f64,
    /// 0 = unlimited.
    pub max_conversation_messages: usize,
    pub message_history_retrieval_limit: usize,
    pub log_level: String,
    pub log_format: String,
    pub memory: MemoryModuleConfig,
}

impl AgentConfig {
    /// Resolve configuration from the environment.
    ///
    /// Lookup order for every key is `{AGENT_NAME}_{KEY}` (upper-cased agent
    /// name) then the bare `{KEY}`, so a single process environment can carry
    /// overrides for several agents.
    pub fn from_env(agent_name: &str, agent_display_name: &str) -> Result<Self> {
        let get = |key: &str| -> Option<String> { env_for(agent_name, key) };

        let gemini_api_key = get("GEMINI_API_KEY").context("GEMINI_API_KEY is required")?;

        let memory = MemoryModuleConfig {
            creator_enabled: get("MEMORY_CREATOR_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            retriever_enabled: get("MEMORY_RETRIEVER_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            creator_run_every_n_turns: parse_or(get("MEMORY_CREATOR_RUN_EVERY_N_TURNS"), 1)?,
            retriever_run_every_n_turns: parse_or(get("MEMORY_RETRIEVER_RUN_EVERY_N_TURNS"), 1)?,
            retriever_max_iterations: parse_or(get("MEMORY_RETRIEVER_MAX_ITERATIONS"), 3)?,
            creator_context_messages: parse_or(get("MEMORY_CREATOR_CONTEXT_MESSAGES"), 10)?,
            retriever_context_messages: parse_or(get("MEMORY_RETRIEVER_CONTEXT_MESSAGES"), 10)?,
        };

        Ok(Self {
            agent_name: agent_name.to_string(),
            agent_display_name: agent_display_name.to_string(),
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".to_string())),
            api_gateway_url: get("API_GATEWAY_URL")
                .unwrap_or_else(|| "http://localhost:8000".to_string()),
            gemini_api_key,
            system_prompt_path: PathBuf::from(
                get("SYSTEM_PROMPT_PATH").unwrap_or_else(|| "/app/system_prompt.txt".to_string()),
            ),
            internal_key_path: PathBuf::from(
                get("INTERNAL_KEY_PATH").unwrap_or_else(|| "/shared/internal_api_key".to_string()),
            ),
            check_interval_seconds: parse_or(get("AGENT_CHECK_INTERVAL_SECONDS"), 0.25)?,
            max_conversation_messages: parse_or(get("MAX_CONVERSATION_MESSAGES"), 0)?,
            message_history_retrieval_limit: parse_or(get("MESSAGE_HISTORY_RETRIEVAL_LIMIT"), 500)?,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "INFO".to_string()),
            log_format: get("LOG_FORMAT").unwrap_or_else(|| "text".to_string()),
            memory,
        })
    }

    /// The agent's inbound queue name.
    pub fn queue_name(&self) -> String {
        format!("{}_queue", self.agent_name)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_seconds)
    }

    pub fn broker_path(&self) -> PathBuf {
        self.data_dir.join("notifications.redb")
    }

    pub fn memory_store_path(&self) -> PathBuf {
        self.data_dir.join("memories.redb")
    }

    /// Install the global tracing subscriber per `LOG_LEVEL` / `LOG_FORMAT`.
    ///
    /// A second call fails quietly instead of panicking so tests that build
    /// several configs stay usable.
    pub fn setup_logging(&self) {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.log_level.to_lowercase()));

        let result = if self.log_format.eq_ignore_ascii_case("json") {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .try_init()
        } else {
            tracing_subscriber::fmt().with_env_filter(filter).try_init()
        };
        if result.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    }
}

/// Per-agent override lookup: `{AGENT}_{KEY}` wins over `{KEY}`.
fn env_for(agent_name: &str, key: &str) -> Option<String> {
    let prefixed = format!("{}_{}", agent_name.to_uppercase(), key);
    env::var(&prefixed)
        .or_else(|_| env::var(key))
        .ok()
        .filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid config value '{raw}': {e}")),
    }
}
