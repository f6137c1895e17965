//! Web search tool backed by the Tavily API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{
    BreakerConfig, CacheConfig, DefaultResponse, FallbackConfig, FallbackStrategy,
    RateLimitConfig, ToolContext, ToolError, ToolMetadata, ToolPlugin, ToolResult,
};

const TAVILY_SEARCH_URL: &str = "https://api.tavily.com/search";
const MAX_RESULTS_CAP: u64 = 10;

fn search_url() -> String {
    std::env::var("TAVILY_SEARCH_URL").unwrap_or_else(|_| TAVILY_SEARCH_URL.to_string())
}

/// `web_search`: query → `{results: [{title, url, content}]}`.
pub struct WebSearchTool {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl WebSearchTool {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl ToolPlugin for WebSearchTool {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "web_search".into(),
            version: "1.0.0".into(),
            description: "Search the web for up-to-date information".into(),
            enabled: self.api_key.is_some(),
        }
    }

    fn schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": "web_search",
                "description": "Search the web and return titled results with URLs. \
                                Use for current events or facts outside your knowledge.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Search query" },
                        "max_results": {
                            "type": "integer",
                            "description": "Number of results (1-10, default 5)"
                        }
                    },
                    "required": ["query"]
                }
            }
        })
    }

    fn rate_limit(&self) -> Option<RateLimitConfig> {
        Some(RateLimitConfig {
            max_concurrent: 4,
            max_per_minute: 30,
            timeout: Duration::from_secs(10),
        })
    }

    fn cache(&self) -> Option<CacheConfig> {
        Some(CacheConfig {
            enabled: true,
            ttl: Duration::from_secs(300),
            key_strategy: crate::tools::CacheKeyStrategy::ParamsHash,
        })
    }

    fn breaker(&self) -> Option<BreakerConfig> {
        Some(BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_max: 1,
        })
    }

    fn fallback(&self) -> Option<FallbackConfig> {
        Some(FallbackConfig {
            chain: vec![
                FallbackStrategy::Cache,
                FallbackStrategy::StaleCache,
                FallbackStrategy::Default,
            ],
            allow_stale_cache: true,
            default_response: Some(DefaultResponse {
                data: json!({ "results": [] }),
                message: Some("Search is temporarily unavailable.".into()),
            }),
            ..FallbackConfig::default()
        })
    }

    fn validate(&self, params: &Value) -> Result<(), ToolError> {
        let query = params.get("query").and_then(Value::as_str).unwrap_or("");
        if query.trim().is_empty() {
            return Err(ToolError::Validation("query must not be empty".into()));
        }
        Ok(())
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let Some(api_key) = &self.api_key else {
            return Err(ToolError::Execution("search api key not configured".into()));
        };
        let query = params.get("query").and_then(Value::as_str).unwrap_or("");
        let max_results = params
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(5)
            .clamp(1, MAX_RESULTS_CAP);

        let response = self
            .client
            .post(search_url())
            .json(&json!({
                "api_key": api_key,
                "query": query,
                "max_results": max_results,
                "search_depth": "basic",
            }))
            .send()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Execution(format!(
                "search api error {status}: {body}"
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let results: Vec<Value> = body
            .get("results")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| {
                        json!({
                            "title": item.get("title").and_then(Value::as_str).unwrap_or("(untitled)"),
                            "url": item.get("url").and_then(Value::as_str).unwrap_or(""),
                            "content": item.get("content").and_then(Value::as_str).unwrap_or(""),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ToolResult::ok(json!({ "results": results })))
    }
}
