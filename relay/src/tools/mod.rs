//! Tool runtime: plugin model, registry, rate limiting, caching, circuit
//! breaking, fallback chains, execution pipeline, and orchestration.
//!
//! A tool is a [`ToolPlugin`]: metadata, a Function-Calling JSON schema, and
//! `validate`/`execute`, plus optional per-tool rate-limit, cache, breaker,
//! and fallback configuration. The [`ToolExecutor`] owns the pipeline that
//! applies all of those around a call.

pub mod breaker;
pub mod builtin;
pub mod cache;
mod executor;
mod fallback;
pub mod orchestrator;
pub mod protocol;
pub mod rate_limit;
mod registry;

pub use executor::{ExecuteOptions, ToolExecutor, ToolMetricsSnapshot};
pub use registry::ToolRegistry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Errors surfaced by the tool pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("tool disabled: {0}")]
    Disabled(String),
    #[error("tool rate limited: {0}")]
    RateLimited(String),
    #[error("circuit open for tool: {0}")]
    CircuitOpen(String),
    #[error("invalid params: {0}")]
    Validation(String),
    #[error("tool {tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },
    #[error("tool execution failed: {0}")]
    Execution(String),
}

/// Identity and switch state of one plugin.
#[derive(Clone, Debug)]
pub struct ToolMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub enabled: bool,
}

/// Per-tool concurrency and rate bounds.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub max_concurrent: usize,
    pub max_per_minute: u32,
    pub timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_per_minute: 60,
            timeout: Duration::from_secs(30),
        }
    }
}

/// How cache keys are derived for one tool.
#[derive(Clone)]
pub enum CacheKeyStrategy {
    /// Digest of the normalized params.
    ParamsHash,
    /// Digest of the params plus the calling user id.
    UserScoped,
    /// Caller-provided key function.
    Custom(Arc<dyn Fn(&Value, &ToolContext) -> String + Send + Sync>),
}

impl std::fmt::Debug for CacheKeyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKeyStrategy::ParamsHash => write!(f, "ParamsHash"),
            CacheKeyStrategy::UserScoped => write!(f, "UserScoped"),
            CacheKeyStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Result caching for one tool; entries are written after successes only.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub key_strategy: CacheKeyStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            key_strategy: CacheKeyStrategy::ParamsHash,
        }
    }
}

/// Failure-threshold circuit breaker settings for one tool.
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// Probe budget while half-open.
    pub half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max: 1,
        }
    }
}

/// Ordered degradation strategies tried after the primary execution fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FallbackStrategy {
    /// Serve a fresh cache hit.
    Cache,
    /// Serve an expired cache hit (requires `allow_stale_cache`).
    StaleCache,
    /// Invoke a named alternate tool through the executor.
    FallbackTool,
    /// Re-invoke the same plugin with simplified params, bypassing the breaker.
    Simplified,
    /// Return the configured default response.
    Default,
}

impl FallbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::Cache => "cache",
            FallbackStrategy::StaleCache => "stale-cache",
            FallbackStrategy::FallbackTool => "fallback-tool",
            FallbackStrategy::Simplified => "simplified",
            FallbackStrategy::Default => "default",
        }
    }
}

/// Canned response for [`FallbackStrategy::Default`].
#[derive(Clone, Debug)]
pub struct DefaultResponse {
    pub data: Value,
    pub message: Option<String>,
}

/// Hystrix-style fallback chain configuration.
#[derive(Clone, Debug)]
pub struct FallbackConfig {
    pub chain: Vec<FallbackStrategy>,
    pub allow_stale_cache: bool,
    pub fallback_tool: Option<String>,
    /// Merged over the original params for [`FallbackStrategy::Simplified`].
    pub simplified_params: Option<Value>,
    pub default_response: Option<DefaultResponse>,
    /// Upper bound for each strategy attempt.
    pub fallback_timeout: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            chain: vec![],
            allow_stale_cache: false,
            fallback_tool: None,
            simplified_params: None,
            default_response: None,
            fallback_timeout: Duration::from_secs(10),
        }
    }
}

/// Per-call context handed to every tool execution.
#[derive(Clone, Debug, Default)]
pub struct ToolContext {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub request_id: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Outcome of one tool invocation, primary or degraded.
#[derive(Clone, Debug, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub from_cache: bool,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_by: Option<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            message: None,
            error: None,
            from_cache: false,
            degraded: false,
            degraded_by: None,
            duration_ms: 0,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            message: None,
            error: Some(error.into()),
            from_cache: false,
            degraded: false,
            degraded_by: None,
            duration_ms: 0,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A registered tool.
#[async_trait]
pub trait ToolPlugin: Send + Sync {
    fn metadata(&self) -> ToolMetadata;

    /// Function-Calling schema exposed to the LLM:
    /// `{"type":"function","function":{"name","description","parameters"}}`.
    fn schema(&self) -> Value;

    fn rate_limit(&self) -> Option<RateLimitConfig> {
        None
    }

    fn cache(&self) -> Option<CacheConfig> {
        None
    }

    fn breaker(&self) -> Option<BreakerConfig> {
        None
    }

    fn fallback(&self) -> Option<FallbackConfig> {
        None
    }

    /// Cheap structural validation before execution.
    fn validate(&self, _params: &Value) -> Result<(), ToolError> {
        Ok(())
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError>;

    /// Called once at registration.
    async fn on_init(&self) -> Result<(), ToolError> {
        Ok(())
    }
}

/// One completed call, kept per request to cap consecutive errors and feed
/// orchestration.
#[derive(Clone, Debug)]
pub struct ToolCallRecord {
    pub tool: String,
    pub params: Value,
    pub result: Option<ToolResult>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}
