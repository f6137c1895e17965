//! Typed view of the gateway's environment variables.
//!
//! Call [`crate::load_and_apply`] first so `.env` / XDG values are visible,
//! then build [`Settings::from_env`]. Unset variables fall back to defaults;
//! malformed numbers fall back to defaults as well (the server should come up
//! with a bad knob, not crash).

use std::str::FromStr;
use std::time::Duration;

/// How the tool circuit breaker combines decisions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BreakerMode {
    /// One breaker per tool.
    #[default]
    Default,
    /// Composite: evaluate sub-breakers, most restrictive decision wins.
    Composite,
}

impl FromStr for BreakerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "composite" => Ok(Self::Composite),
            _ => Err(format!(
                "unknown TOOL_CIRCUIT_BREAKER_MODE: {s} (use default or composite)"
            )),
        }
    }
}

/// Resolved configuration for one gateway process.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Listen address, `RELAY_ADDR`.
    pub addr: String,
    /// SQLite file for conversations/messages/plans/users, `RELAY_DB_PATH`.
    pub db_path: String,
    /// Directory for chunked uploads, `RELAY_UPLOAD_DIR`.
    pub upload_dir: String,
    /// Global cap on open SSE streams, `MAX_SSE_CONNECTIONS`.
    pub max_sse_connections: usize,
    /// Per-user cap on open SSE streams, `MAX_SSE_CONNECTIONS_PER_USER`.
    pub max_sse_connections_per_user: usize,
    /// In-flight upstream LLM call cap, `LLM_MAX_CONCURRENT`.
    pub llm_max_concurrent: usize,
    /// Upstream LLM requests per minute, `LLM_MAX_RPM`.
    pub llm_max_rpm: u32,
    /// Per-request upstream timeout, `LLM_TIMEOUT` (seconds).
    pub llm_timeout: Duration,
    /// `OLLAMA_API_URL`.
    pub ollama_api_url: String,
    /// `OLLAMA_MODEL`.
    pub ollama_model: String,
    /// `ARK_API_KEY`; the volcano model type is disabled when absent.
    pub ark_api_key: Option<String>,
    /// `ARK_API_URL`.
    pub ark_api_url: String,
    /// `ARK_EMBEDDING_API_URL` (recognized; embeddings are optional).
    pub ark_embedding_api_url: Option<String>,
    /// `ARK_EMBEDDING_MODEL`.
    pub ark_embedding_model: Option<String>,
    /// `TAVILY_API_KEY`; the web search tool degrades to disabled when absent.
    pub tavily_api_key: Option<String>,
    /// `TOOL_CIRCUIT_BREAKER_MODE`.
    pub breaker_mode: BreakerMode,
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3000".to_string(),
            db_path: "relay.db".to_string(),
            upload_dir: "uploads".to_string(),
            max_sse_connections: 100,
            max_sse_connections_per_user: 5,
            llm_max_concurrent: 3,
            llm_max_rpm: 60,
            llm_timeout: Duration::from_secs(120),
            ollama_api_url: "http://127.0.0.1:11434".to_string(),
            ollama_model: "qwen2.5:7b".to_string(),
            ark_api_key: None,
            ark_api_url: "https://ark.cn-beijing.volces.com/api/v3".to_string(),
            ark_embedding_api_url: None,
            ark_embedding_model: None,
            tavily_api_key: None,
            breaker_mode: BreakerMode::Default,
        }
    }
}

impl Settings {
    /// Reads every recognized variable from the process environment.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            addr: var("RELAY_ADDR").unwrap_or(d.addr),
            db_path: var("RELAY_DB_PATH").unwrap_or(d.db_path),
            upload_dir: var("RELAY_UPLOAD_DIR").unwrap_or(d.upload_dir),
            max_sse_connections: parsed_or("MAX_SSE_CONNECTIONS", d.max_sse_connections),
            max_sse_connections_per_user: parsed_or(
                "MAX_SSE_CONNECTIONS_PER_USER",
                d.max_sse_connections_per_user,
            ),
            llm_max_concurrent: parsed_or("LLM_MAX_CONCURRENT", d.llm_max_concurrent),
            llm_max_rpm: parsed_or("LLM_MAX_RPM", d.llm_max_rpm),
            llm_timeout: Duration::from_secs(parsed_or("LLM_TIMEOUT", 120)),
            ollama_api_url: var("OLLAMA_API_URL").unwrap_or(d.ollama_api_url),
            ollama_model: var("OLLAMA_MODEL").unwrap_or(d.ollama_model),
            ark_api_key: var("ARK_API_KEY"),
            ark_api_url: var("ARK_API_URL").unwrap_or(d.ark_api_url),
            ark_embedding_api_url: var("ARK_EMBEDDING_API_URL"),
            ark_embedding_model: var("ARK_EMBEDDING_MODEL"),
            tavily_api_key: var("TAVILY_API_KEY"),
            breaker_mode: var("TOOL_CIRCUIT_BREAKER_MODE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.breaker_mode),
        }
    }
}
