//! Per-tool concurrency and rate-per-minute limiter.
//!
//! Works like the LLM queue's gate but keyed by tool name and without a wait
//! queue: a denied acquire is returned to the caller immediately (the
//! executor treats it as a failure without fallback).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::RateLimitConfig;

const RPM_WINDOW: Duration = Duration::from_secs(60);

#[derive(Default)]
struct ToolState {
    active: usize,
    window: VecDeque<Instant>,
}

/// Why an acquire was denied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DenyReason {
    Concurrency { active: usize, max: usize },
    RatePerMinute { recent: usize, max: u32 },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::Concurrency { active, max } => {
                write!(f, "concurrency limit reached ({active}/{max})")
            }
            DenyReason::RatePerMinute { recent, max } => {
                write!(f, "rate limit reached ({recent} in the last minute, max {max})")
            }
        }
    }
}

/// Releases the concurrency slot when dropped.
pub struct ToolPermit {
    state: Arc<Mutex<ToolState>>,
}

impl Drop for ToolPermit {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.active = state.active.saturating_sub(1);
        }
    }
}

/// Per-tool limiter table.
#[derive(Default)]
pub struct ToolRateLimiter {
    states: DashMap<String, Arc<Mutex<ToolState>>>,
}

impl ToolRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants a permit or returns the limit that was hit.
    pub fn acquire(&self, tool: &str, config: &RateLimitConfig) -> Result<ToolPermit, DenyReason> {
        let state = self
            .states
            .entry(tool.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ToolState::default())))
            .clone();
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());

        let cutoff = Instant::now() - RPM_WINDOW;
        while guard.window.front().is_some_and(|t| *t < cutoff) {
            guard.window.pop_front();
        }

        if guard.active >= config.max_concurrent {
            return Err(DenyReason::Concurrency {
                active: guard.active,
                max: config.max_concurrent,
            });
        }
        if guard.window.len() >= config.max_per_minute as usize {
            return Err(DenyReason::RatePerMinute {
                recent: guard.window.len(),
                max: config.max_per_minute,
            });
        }

        guard.active += 1;
        guard.window.push_back(Instant::now());
        drop(guard);
        Ok(ToolPermit { state })
    }

    /// Current in-flight count for one tool.
    pub fn active(&self, tool: &str) -> usize {
        self.states
            .get(tool)
            .and_then(|s| s.lock().ok().map(|g| g.active))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_concurrent: usize, max_per_minute: u32) -> RateLimitConfig {
        RateLimitConfig {
            max_concurrent,
            max_per_minute,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn concurrency_denial_and_release() {
        let limiter = ToolRateLimiter::new();
        let cfg = config(1, 100);
        let permit = limiter.acquire("t", &cfg).unwrap();
        assert!(matches!(
            limiter.acquire("t", &cfg),
            Err(DenyReason::Concurrency { .. })
        ));
        drop(permit);
        assert!(limiter.acquire("t", &cfg).is_ok());
    }

    #[tokio::test]
    async fn rpm_denial_clears_after_window() {
        tokio::time::pause();
        let limiter = ToolRateLimiter::new();
        let cfg = config(10, 2);
        drop(limiter.acquire("t", &cfg).unwrap());
        drop(limiter.acquire("t", &cfg).unwrap());
        assert!(matches!(
            limiter.acquire("t", &cfg),
            Err(DenyReason::RatePerMinute { .. })
        ));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.acquire("t", &cfg).is_ok());
    }

    #[tokio::test]
    async fn tools_are_limited_independently() {
        let limiter = ToolRateLimiter::new();
        let cfg = config(1, 100);
        let _a = limiter.acquire("a", &cfg).unwrap();
        assert!(limiter.acquire("b", &cfg).is_ok());
        assert_eq!(limiter.active("a"), 1);
        assert_eq!(limiter.active("b"), 0);
    }
}
