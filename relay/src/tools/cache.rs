//! TTL result cache for tool executions.
//!
//! Entries are written only after successful executions. `get` serves fresh
//! entries; `get_stale` also serves expired ones and is used exclusively by
//! the fallback chain.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::{CacheConfig, CacheKeyStrategy, ToolContext, ToolResult};

struct Entry {
    result: ToolResult,
    stored_at: Instant,
    ttl: Duration,
}

impl Entry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) <= self.ttl
    }
}

/// Process-local tool result cache.
#[derive(Default)]
pub struct ToolCache {
    entries: DashMap<String, Arc<Entry>>,
}

impl ToolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the cache key for a call according to the tool's strategy.
    pub fn key(
        tool: &str,
        params: &serde_json::Value,
        ctx: &ToolContext,
        strategy: &CacheKeyStrategy,
    ) -> String {
        match strategy {
            CacheKeyStrategy::ParamsHash => digest(&format!("{tool}:{params}")),
            CacheKeyStrategy::UserScoped => digest(&format!("{tool}:{}:{params}", ctx.user_id)),
            CacheKeyStrategy::Custom(f) => format!("{tool}:{}", f(params, ctx)),
        }
    }

    /// Fresh hit or nothing. Expired entries stay for [`ToolCache::get_stale`].
    pub fn get(&self, key: &str) -> Option<ToolResult> {
        let entry = self.entries.get(key)?;
        entry
            .is_fresh(Instant::now())
            .then(|| entry.result.clone())
    }

    /// Any hit, fresh or expired. Only the fallback chain calls this.
    pub fn get_stale(&self, key: &str) -> Option<ToolResult> {
        self.entries.get(key).map(|e| e.result.clone())
    }

    /// Stores one successful result.
    pub fn put(&self, key: String, result: ToolResult, ttl: Duration) {
        self.entries.insert(
            key,
            Arc::new(Entry {
                result,
                stored_at: Instant::now(),
                ttl,
            }),
        );
    }

    /// Drops expired entries. Stale entries are still useful to the fallback
    /// chain, so this is only called from periodic maintenance with a grace
    /// multiplier applied by the caller.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_fresh(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves the effective cache config for a call, if caching applies.
pub fn effective_config(config: Option<CacheConfig>) -> Option<CacheConfig> {
    config.filter(|c| c.enabled)
}

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(user: &str) -> ToolContext {
        ToolContext {
            user_id: user.to_string(),
            ..ToolContext::default()
        }
    }

    #[tokio::test]
    async fn fresh_hit_then_expiry_then_stale_hit() {
        tokio::time::pause();
        let cache = ToolCache::new();
        cache.put("k".into(), ToolResult::ok(json!({"answer": 42})), Duration::from_secs(60));

        assert_eq!(cache.get("k").unwrap().data["answer"], 42);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("k").is_none());
        assert_eq!(cache.get_stale("k").unwrap().data["answer"], 42);
    }

    #[test]
    fn params_hash_keys_differ_by_params_not_user() {
        let a = ToolCache::key("t", &json!({"q": 1}), &ctx("u1"), &CacheKeyStrategy::ParamsHash);
        let b = ToolCache::key("t", &json!({"q": 1}), &ctx("u2"), &CacheKeyStrategy::ParamsHash);
        let c = ToolCache::key("t", &json!({"q": 2}), &ctx("u1"), &CacheKeyStrategy::ParamsHash);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn user_scoped_keys_differ_by_user() {
        let a = ToolCache::key("t", &json!({"q": 1}), &ctx("u1"), &CacheKeyStrategy::UserScoped);
        let b = ToolCache::key("t", &json!({"q": 1}), &ctx("u2"), &CacheKeyStrategy::UserScoped);
        assert_ne!(a, b);
    }

    #[test]
    fn custom_key_generator_is_used_verbatim() {
        let strategy = CacheKeyStrategy::Custom(Arc::new(|params, _ctx| {
            params["q"].as_str().unwrap_or("none").to_string()
        }));
        let k = ToolCache::key("t", &json!({"q": "x"}), &ctx("u"), &strategy);
        assert_eq!(k, "t:x");
    }

    #[tokio::test]
    async fn purge_drops_expired_only() {
        tokio::time::pause();
        let cache = ToolCache::new();
        cache.put("old".into(), ToolResult::ok(json!(1)), Duration::from_secs(1));
        cache.put("new".into(), ToolResult::ok(json!(2)), Duration::from_secs(600));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get("new").is_some());
    }
}
