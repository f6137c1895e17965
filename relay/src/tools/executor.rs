//! Tool executor: the pipeline every tool call goes through.
//!
//! Order of operations: lookup → metrics → cache → breaker → rate limit →
//! validate → timed execution → breaker/cache bookkeeping → fallback chain.
//! A rate-limit denial fails immediately (no fallback); a breaker denial and
//! an execution error both enter the fallback chain.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use super::breaker::{BreakerDecision, BreakerPolicy, BreakerStatus};
use super::cache::{effective_config, ToolCache};
use super::rate_limit::ToolRateLimiter;
use super::{RateLimitConfig, ToolContext, ToolError, ToolRegistry, ToolResult};

/// Per-call overrides.
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    pub skip_cache: bool,
    pub skip_rate_limit: bool,
    pub timeout: Option<Duration>,
}

#[derive(Default)]
struct MetricsEntry {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    degraded: AtomicU64,
    rate_limited: AtomicU64,
    breaker_denied: AtomicU64,
    duration_total_ms: AtomicU64,
}

/// Point-in-time view of one tool's counters for `/api/tool-system/status`.
#[derive(Clone, Debug, Serialize)]
pub struct ToolMetricsSnapshot {
    pub tool: String,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub degraded: u64,
    pub rate_limited: u64,
    pub breaker_denied: u64,
    pub avg_duration_ms: u64,
    pub active: usize,
    pub breaker_status: BreakerStatus,
}

/// Validates, guards, times, and (on failure) degrades tool calls.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    pub(super) limiter: ToolRateLimiter,
    pub(super) cache: ToolCache,
    pub(super) breaker: Arc<dyn BreakerPolicy>,
    metrics: DashMap<String, MetricsEntry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, breaker: Arc<dyn BreakerPolicy>) -> Self {
        Self {
            registry,
            limiter: ToolRateLimiter::new(),
            cache: ToolCache::new(),
            breaker,
            metrics: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<dyn BreakerPolicy> {
        &self.breaker
    }

    pub fn cache(&self) -> &ToolCache {
        &self.cache
    }

    /// Runs one tool call through the full pipeline. Never panics and never
    /// returns `Err`: failures come back as unsuccessful [`ToolResult`]s so
    /// they can flow to the LLM as messages.
    pub fn execute<'a>(
        &'a self,
        tool: &'a str,
        params: Value,
        ctx: &'a ToolContext,
        opts: &'a ExecuteOptions,
    ) -> Pin<Box<dyn Future<Output = ToolResult> + Send + 'a>> {
        Box::pin(async move {
        let started = Instant::now();

        let Some(plugin) = self.registry.get(tool) else {
            return ToolResult::fail(ToolError::NotFound(tool.to_string()).to_string());
        };
        if !plugin.metadata().enabled {
            return ToolResult::fail(ToolError::Disabled(tool.to_string()).to_string());
        }

        self.entry(tool).total.fetch_add(1, Ordering::Relaxed);

        let cache_cfg = effective_config(plugin.cache());
        let cache_key = cache_cfg
            .as_ref()
            .map(|cfg| ToolCache::key(tool, &params, ctx, &cfg.key_strategy));

        if !opts.skip_cache {
            if let Some(key) = cache_key.as_deref() {
                if let Some(mut hit) = self.cache.get(key) {
                    self.entry(tool).cache_hits.fetch_add(1, Ordering::Relaxed);
                    hit.from_cache = true;
                    hit.duration_ms = started.elapsed().as_millis() as u64;
                    return hit;
                }
            }
        }

        let breaker_cfg = plugin.breaker();
        if let Some(cfg) = &breaker_cfg {
            if let BreakerDecision::Deny { reason } = self.breaker.check(tool, cfg) {
                self.entry(tool).breaker_denied.fetch_add(1, Ordering::Relaxed);
                let failure = ToolResult::fail(reason);
                return self
                    .finish(tool, started, self.run_fallback(&plugin, &params, ctx, failure).await)
                    .await;
            }
        }

        let _permit = if opts.skip_rate_limit {
            None
        } else if let Some(rate_cfg) = plugin.rate_limit() {
            match self.limiter.acquire(tool, &rate_cfg) {
                Ok(permit) => Some(permit),
                Err(reason) => {
                    // Rate denial is a plain failure; the fallback chain is
                    // reserved for upstream trouble, not local back-pressure.
                    self.entry(tool).rate_limited.fetch_add(1, Ordering::Relaxed);
                    return self
                        .finish(
                            tool,
                            started,
                            ToolResult::fail(
                                ToolError::RateLimited(reason.to_string()).to_string(),
                            ),
                        )
                        .await;
                }
            }
        } else {
            None
        };

        if let Err(e) = plugin.validate(&params) {
            if let Some(cfg) = &breaker_cfg {
                self.breaker.record_failure(tool, cfg);
            }
            return self.finish(tool, started, ToolResult::fail(e.to_string())).await;
        }

        let timeout = opts
            .timeout
            .or_else(|| plugin.rate_limit().map(|r| r.timeout))
            .unwrap_or(RateLimitConfig::default().timeout);

        let executed = tokio::time::timeout(timeout, plugin.execute(params.clone(), ctx)).await;
        match executed {
            Ok(Ok(mut result)) => {
                if breaker_cfg.is_some() {
                    self.breaker.record_success(tool);
                }
                if result.success {
                    if let (Some(key), Some(cfg)) = (cache_key, &cache_cfg) {
                        self.cache.put(key, result.clone(), cfg.ttl);
                    }
                }
                result.from_cache = false;
                self.finish(tool, started, result).await
            }
            Ok(Err(e)) => {
                if let Some(cfg) = &breaker_cfg {
                    self.breaker.record_failure(tool, cfg);
                }
                let failure = ToolResult::fail(e.to_string());
                let result = self.run_fallback(&plugin, &params, ctx, failure).await;
                self.finish(tool, started, result).await
            }
            Err(_) => {
                if let Some(cfg) = &breaker_cfg {
                    self.breaker.record_failure(tool, cfg);
                }
                let failure = ToolResult::fail(
                    ToolError::Timeout {
                        tool: tool.to_string(),
                        timeout,
                    }
                    .to_string(),
                );
                let result = self.run_fallback(&plugin, &params, ctx, failure).await;
                self.finish(tool, started, result).await
            }
        }
        })
    }

    /// Metrics for every tool the executor has seen, plus registered-but-idle
    /// tools.
    pub fn metrics_snapshot(&self) -> Vec<ToolMetricsSnapshot> {
        let mut names = self.registry.names();
        for entry in self.metrics.iter() {
            if !names.contains(entry.key()) {
                names.push(entry.key().clone());
            }
        }
        names.sort();
        names
            .into_iter()
            .map(|tool| {
                let (total, succeeded, failed, cache_hits, degraded, rate_limited, breaker_denied, duration_total) =
                    match self.metrics.get(&tool) {
                        Some(m) => (
                            m.total.load(Ordering::Relaxed),
                            m.succeeded.load(Ordering::Relaxed),
                            m.failed.load(Ordering::Relaxed),
                            m.cache_hits.load(Ordering::Relaxed),
                            m.degraded.load(Ordering::Relaxed),
                            m.rate_limited.load(Ordering::Relaxed),
                            m.breaker_denied.load(Ordering::Relaxed),
                            m.duration_total_ms.load(Ordering::Relaxed),
                        ),
                        None => (0, 0, 0, 0, 0, 0, 0, 0),
                    };
                let finished = succeeded + failed;
                ToolMetricsSnapshot {
                    active: self.limiter.active(&tool),
                    breaker_status: self.breaker.status(&tool),
                    tool,
                    total,
                    succeeded,
                    failed,
                    cache_hits,
                    degraded,
                    rate_limited,
                    breaker_denied,
                    avg_duration_ms: if finished == 0 { 0 } else { duration_total / finished },
                }
            })
            .collect()
    }

    async fn finish(&self, tool: &str, started: Instant, mut result: ToolResult) -> ToolResult {
        result.duration_ms = started.elapsed().as_millis() as u64;
        let entry = self.entry(tool);
        entry
            .duration_total_ms
            .fetch_add(result.duration_ms, Ordering::Relaxed);
        if result.success {
            entry.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            entry.failed.fetch_add(1, Ordering::Relaxed);
        }
        if result.degraded {
            entry.degraded.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn entry(&self, tool: &str) -> dashmap::mapref::one::Ref<'_, String, MetricsEntry> {
        self.metrics
            .entry(tool.to_string())
            .or_default()
            .downgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::breaker::CircuitBreaker;
    use crate::tools::{
        BreakerConfig, CacheConfig, DefaultResponse, FallbackConfig, FallbackStrategy,
        ToolMetadata, ToolPlugin,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Behavior {
        fail: bool,
        delay: Duration,
        calls: AtomicUsize,
    }

    struct TestTool {
        name: &'static str,
        behavior: Arc<Behavior>,
        cache: Option<CacheConfig>,
        breaker: Option<BreakerConfig>,
        fallback: Option<FallbackConfig>,
        rate: Option<RateLimitConfig>,
    }

    impl TestTool {
        fn new(name: &'static str, fail: bool) -> Self {
            Self {
                name,
                behavior: Arc::new(Behavior {
                    fail,
                    delay: Duration::ZERO,
                    calls: AtomicUsize::new(0),
                }),
                cache: None,
                breaker: None,
                fallback: None,
                rate: None,
            }
        }
    }

    #[async_trait]
    impl ToolPlugin for TestTool {
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata {
                name: self.name.to_string(),
                version: "1.0.0".into(),
                description: "test".into(),
                enabled: true,
            }
        }

        fn schema(&self) -> Value {
            json!({ "type": "function", "function": { "name": self.name, "parameters": {} } })
        }

        fn rate_limit(&self) -> Option<RateLimitConfig> {
            self.rate.clone()
        }

        fn cache(&self) -> Option<CacheConfig> {
            self.cache.clone()
        }

        fn breaker(&self) -> Option<BreakerConfig> {
            self.breaker.clone()
        }

        fn fallback(&self) -> Option<FallbackConfig> {
            self.fallback.clone()
        }

        async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            self.behavior.calls.fetch_add(1, Ordering::SeqCst);
            if !self.behavior.delay.is_zero() {
                tokio::time::sleep(self.behavior.delay).await;
            }
            if self.behavior.fail {
                return Err(ToolError::Execution("primary blew up".into()));
            }
            Ok(ToolResult::ok(json!({ "echo": params })))
        }
    }

    async fn executor_with(tools: Vec<TestTool>) -> ToolExecutor {
        let registry = Arc::new(ToolRegistry::new());
        for tool in tools {
            registry.register(Arc::new(tool)).await.unwrap();
        }
        ToolExecutor::new(registry, Arc::new(CircuitBreaker::new()))
    }

    #[tokio::test]
    async fn unknown_tool_fails_without_panicking() {
        let ex = executor_with(vec![]).await;
        let r = ex
            .execute("nope", json!({}), &ToolContext::default(), &ExecuteOptions::default())
            .await;
        assert!(!r.success);
        assert!(r.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn success_writes_cache_and_second_call_hits_it() {
        let mut tool = TestTool::new("echo", false);
        tool.cache = Some(CacheConfig::default());
        let ex = executor_with(vec![tool]).await;
        let ctx = ToolContext::default();

        let first = ex
            .execute("echo", json!({"q": 1}), &ctx, &ExecuteOptions::default())
            .await;
        assert!(first.success);
        assert!(!first.from_cache);

        let second = ex
            .execute("echo", json!({"q": 1}), &ctx, &ExecuteOptions::default())
            .await;
        assert!(second.from_cache);
        assert_eq!(second.data, first.data);
    }

    #[tokio::test]
    async fn fallback_default_wins_when_everything_else_fails() {
        let mut tool = TestTool::new("broken", true);
        tool.fallback = Some(FallbackConfig {
            chain: vec![
                FallbackStrategy::Cache,
                FallbackStrategy::StaleCache,
                FallbackStrategy::Default,
            ],
            allow_stale_cache: true,
            default_response: Some(DefaultResponse {
                data: json!({ "ok": true }),
                message: Some("default fallback".into()),
            }),
            ..FallbackConfig::default()
        });
        let ex = executor_with(vec![tool]).await;
        let r = ex
            .execute(
                "broken",
                json!({}),
                &ToolContext::default(),
                &ExecuteOptions {
                    skip_cache: true,
                    ..ExecuteOptions::default()
                },
            )
            .await;
        assert!(r.success);
        assert!(r.degraded);
        assert_eq!(r.degraded_by.as_deref(), Some("default"));
        assert_eq!(r.data, json!({ "ok": true }));
        assert_eq!(r.message.as_deref(), Some("default fallback"));
    }

    #[tokio::test]
    async fn open_breaker_degrades_to_cached_value() {
        let mut tool = TestTool::new("flaky", false);
        tool.cache = Some(CacheConfig::default());
        tool.breaker = Some(BreakerConfig::default());
        tool.fallback = Some(FallbackConfig {
            chain: vec![FallbackStrategy::Cache, FallbackStrategy::Default],
            default_response: Some(DefaultResponse {
                data: json!({ "ok": false }),
                message: None,
            }),
            ..FallbackConfig::default()
        });
        let ex = executor_with(vec![tool]).await;
        let ctx = ToolContext::default();

        // Seed the cache with a successful primary call.
        let seeded = ex
            .execute("flaky", json!({ "answer": 42 }), &ctx, &ExecuteOptions::default())
            .await;
        assert!(seeded.success);

        ex.breaker().force_open("flaky");
        let r = ex
            .execute(
                "flaky",
                json!({ "answer": 42 }),
                &ctx,
                &ExecuteOptions {
                    skip_cache: true,
                    ..ExecuteOptions::default()
                },
            )
            .await;
        assert!(r.success);
        assert!(r.degraded);
        assert_eq!(r.degraded_by.as_deref(), Some("cache"));
        assert!(r.from_cache);
        assert_eq!(r.data["echo"]["answer"], 42);
    }

    #[tokio::test]
    async fn rate_limit_denial_fails_without_fallback() {
        let mut tool = TestTool::new("slow", false);
        tool.behavior = Arc::new(Behavior {
            fail: false,
            delay: Duration::from_millis(100),
            calls: AtomicUsize::new(0),
        });
        tool.rate = Some(RateLimitConfig {
            max_concurrent: 1,
            max_per_minute: 100,
            timeout: Duration::from_secs(5),
        });
        tool.fallback = Some(FallbackConfig {
            chain: vec![FallbackStrategy::Default],
            default_response: Some(DefaultResponse {
                data: json!({ "should": "not appear" }),
                message: None,
            }),
            ..FallbackConfig::default()
        });
        let ex = Arc::new(executor_with(vec![tool]).await);

        let busy = {
            let ex = Arc::clone(&ex);
            tokio::spawn(async move {
                ex.execute("slow", json!({}), &ToolContext::default(), &ExecuteOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let denied = ex
            .execute("slow", json!({}), &ToolContext::default(), &ExecuteOptions::default())
            .await;
        assert!(!denied.success);
        assert!(!denied.degraded, "rate denial must not enter fallback");
        assert!(denied.error.unwrap().contains("rate limited"));
        busy.await.unwrap();
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures() {
        let mut tool = TestTool::new("down", true);
        tool.breaker = Some(BreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            half_open_max: 1,
        });
        let behavior = Arc::clone(&tool.behavior);
        let ex = executor_with(vec![tool]).await;
        let ctx = ToolContext::default();

        for _ in 0..2 {
            let r = ex
                .execute("down", json!({}), &ctx, &ExecuteOptions::default())
                .await;
            assert!(!r.success);
        }
        assert_eq!(ex.breaker().status("down"), BreakerStatus::Open);

        // The open circuit short-circuits: the plugin is not called again.
        let calls_before = behavior.calls.load(Ordering::SeqCst);
        let r = ex
            .execute("down", json!({}), &ctx, &ExecuteOptions::default())
            .await;
        assert!(!r.success);
        assert_eq!(behavior.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn metrics_count_calls_and_cache_hits() {
        let mut tool = TestTool::new("echo", false);
        tool.cache = Some(CacheConfig::default());
        let ex = executor_with(vec![tool]).await;
        let ctx = ToolContext::default();
        for _ in 0..3 {
            ex.execute("echo", json!({"q": 1}), &ctx, &ExecuteOptions::default())
                .await;
        }
        let snap = ex
            .metrics_snapshot()
            .into_iter()
            .find(|s| s.tool == "echo")
            .unwrap();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.succeeded, 1, "cache hits return before finish counters");
    }
}
