//! Fallback chain: ordered degradation strategies after a failed execution.
//!
//! The first strategy that yields a value wins; the result is marked
//! `degraded=true` with `degraded_by` naming the strategy. Each attempt is
//! bounded by the configured fallback timeout. With no fallback configured,
//! the original failure is returned unchanged.

use std::sync::Arc;

use serde_json::Value;

use super::cache::{effective_config, ToolCache};
use super::executor::{ExecuteOptions, ToolExecutor};
use super::{FallbackStrategy, ToolContext, ToolPlugin, ToolResult};

impl ToolExecutor {
    /// Walks the plugin's fallback chain. Returns the winning degraded result
    /// or the original failure.
    pub(super) async fn run_fallback(
        &self,
        plugin: &Arc<dyn ToolPlugin>,
        params: &Value,
        ctx: &ToolContext,
        failure: ToolResult,
    ) -> ToolResult {
        let Some(config) = plugin.fallback() else {
            return failure;
        };
        let tool = plugin.metadata().name;

        for strategy in &config.chain {
            let attempt = tokio::time::timeout(
                config.fallback_timeout,
                self.try_strategy(*strategy, plugin, &tool, params, ctx, &config),
            )
            .await;
            match attempt {
                Ok(Some(mut result)) => {
                    result.degraded = true;
                    result.degraded_by = Some(strategy.as_str().to_string());
                    tracing::info!(
                        tool = %tool,
                        strategy = strategy.as_str(),
                        "fallback strategy produced a degraded result"
                    );
                    return result;
                }
                Ok(None) => continue,
                Err(_) => {
                    tracing::warn!(
                        tool = %tool,
                        strategy = strategy.as_str(),
                        "fallback strategy timed out"
                    );
                }
            }
        }
        failure
    }

    async fn try_strategy(
        &self,
        strategy: FallbackStrategy,
        plugin: &Arc<dyn ToolPlugin>,
        tool: &str,
        params: &Value,
        ctx: &ToolContext,
        config: &super::FallbackConfig,
    ) -> Option<ToolResult> {
        match strategy {
            FallbackStrategy::Cache => {
                let key = self.fallback_cache_key(plugin, tool, params, ctx)?;
                let mut hit = self.cache.get(&key)?;
                hit.from_cache = true;
                Some(hit)
            }
            FallbackStrategy::StaleCache => {
                if !config.allow_stale_cache {
                    return None;
                }
                let key = self.fallback_cache_key(plugin, tool, params, ctx)?;
                let mut hit = self.cache.get_stale(&key)?;
                hit.from_cache = true;
                Some(hit)
            }
            FallbackStrategy::FallbackTool => {
                let alternate = config.fallback_tool.as_deref()?;
                if alternate == tool {
                    tracing::warn!(tool, "fallback tool is the tool itself, skipping");
                    return None;
                }
                // Re-entrant: the alternate runs through its own full
                // pipeline.
                let default_opts = ExecuteOptions::default();
                let result = self.execute(alternate, params.clone(), ctx, &default_opts).await;
                result.success.then_some(result)
            }
            FallbackStrategy::Simplified => {
                let simplified = config.simplified_params.as_ref()?;
                let merged = merge_params(params, simplified);
                // Direct plugin call: the breaker stays out of the way so a
                // degraded probe cannot re-trip it.
                match plugin.execute(merged, ctx).await {
                    Ok(result) if result.success => Some(result),
                    Ok(_) | Err(_) => None,
                }
            }
            FallbackStrategy::Default => {
                let default = config.default_response.as_ref()?;
                let mut result = ToolResult::ok(default.data.clone());
                result.message = default.message.clone();
                Some(result)
            }
        }
    }

    fn fallback_cache_key(
        &self,
        plugin: &Arc<dyn ToolPlugin>,
        tool: &str,
        params: &Value,
        ctx: &ToolContext,
    ) -> Option<String> {
        let cfg = effective_config(plugin.cache())?;
        Some(ToolCache::key(tool, params, ctx, &cfg.key_strategy))
    }
}

/// Overlays `simplified` on top of `params` (top-level keys).
fn merge_params(params: &Value, simplified: &Value) -> Value {
    match (params.as_object(), simplified.as_object()) {
        (Some(base), Some(overlay)) => {
            let mut merged = base.clone();
            for (k, v) in overlay {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => simplified.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::breaker::CircuitBreaker;
    use crate::tools::{
        CacheConfig, DefaultResponse, FallbackConfig, ToolError, ToolMetadata, ToolRegistry,
    };
    use async_trait::async_trait;
    use serde_json::json;

    #[test]
    fn merge_overlays_top_level_keys() {
        let merged = merge_params(&json!({ "q": "x", "depth": 3 }), &json!({ "depth": 1 }));
        assert_eq!(merged, json!({ "q": "x", "depth": 1 }));
    }

    struct PrimaryDown {
        fallback: FallbackConfig,
    }

    #[async_trait]
    impl ToolPlugin for PrimaryDown {
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata {
                name: "primary".into(),
                version: "1".into(),
                description: String::new(),
                enabled: true,
            }
        }
        fn schema(&self) -> Value {
            json!({ "type": "function", "function": { "name": "primary", "parameters": {} } })
        }
        fn cache(&self) -> Option<CacheConfig> {
            Some(CacheConfig::default())
        }
        fn fallback(&self) -> Option<FallbackConfig> {
            Some(self.fallback.clone())
        }
        async fn execute(&self, _p: Value, _c: &ToolContext) -> Result<ToolResult, ToolError> {
            Err(ToolError::Execution("always down".into()))
        }
    }

    struct Backup;

    #[async_trait]
    impl ToolPlugin for Backup {
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata {
                name: "backup".into(),
                version: "1".into(),
                description: String::new(),
                enabled: true,
            }
        }
        fn schema(&self) -> Value {
            json!({ "type": "function", "function": { "name": "backup", "parameters": {} } })
        }
        async fn execute(&self, _p: Value, _c: &ToolContext) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::ok(json!({ "via": "backup" })))
        }
    }

    #[tokio::test]
    async fn fallback_tool_reenters_the_executor() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(Arc::new(PrimaryDown {
                fallback: FallbackConfig {
                    chain: vec![FallbackStrategy::FallbackTool],
                    fallback_tool: Some("backup".into()),
                    ..FallbackConfig::default()
                },
            }))
            .await
            .unwrap();
        registry.register(Arc::new(Backup)).await.unwrap();
        let ex = ToolExecutor::new(registry, Arc::new(CircuitBreaker::new()));

        let r = ex
            .execute(
                "primary",
                json!({}),
                &ToolContext::default(),
                &ExecuteOptions::default(),
            )
            .await;
        assert!(r.success);
        assert_eq!(r.degraded_by.as_deref(), Some("fallback-tool"));
        assert_eq!(r.data["via"], "backup");
    }

    #[tokio::test]
    async fn stale_cache_requires_opt_in() {
        tokio::time::pause();
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(Arc::new(PrimaryDown {
                fallback: FallbackConfig {
                    chain: vec![FallbackStrategy::StaleCache],
                    allow_stale_cache: false,
                    ..FallbackConfig::default()
                },
            }))
            .await
            .unwrap();
        let ex = ToolExecutor::new(registry, Arc::new(CircuitBreaker::new()));

        // Seed a stale entry directly.
        let ctx = ToolContext::default();
        let key = ToolCache::key(
            "primary",
            &json!({}),
            &ctx,
            &crate::tools::CacheKeyStrategy::ParamsHash,
        );
        ex.cache()
            .put(key, ToolResult::ok(json!({ "old": true })), std::time::Duration::from_secs(1));
        tokio::time::advance(std::time::Duration::from_secs(2)).await;

        let r = ex
            .execute("primary", json!({}), &ctx, &ExecuteOptions::default())
            .await;
        assert!(!r.success, "stale cache must not serve without allow_stale_cache");
    }

    #[tokio::test]
    async fn default_fallback_carries_message() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(Arc::new(PrimaryDown {
                fallback: FallbackConfig {
                    chain: vec![FallbackStrategy::Default],
                    default_response: Some(DefaultResponse {
                        data: json!({ "ok": true }),
                        message: Some("default fallback".into()),
                    }),
                    ..FallbackConfig::default()
                },
            }))
            .await
            .unwrap();
        let ex = ToolExecutor::new(registry, Arc::new(CircuitBreaker::new()));
        let r = ex
            .execute(
                "primary",
                json!({}),
                &ToolContext::default(),
                &ExecuteOptions {
                    skip_cache: true,
                    ..ExecuteOptions::default()
                },
            )
            .await;
        assert!(r.success && r.degraded);
        assert_eq!(r.message.as_deref(), Some("default fallback"));
    }
}
