//! Per-tool circuit breaker.
//!
//! Closed → open when consecutive failures reach the threshold; open rejects
//! until the reset timeout elapses, then half-open admits a bounded number of
//! probes. A probe success closes the circuit, a probe failure reopens it.
//! The composite form layers a process-wide breaker over the per-tool one
//! and returns the most restrictive decision.

use std::sync::Mutex;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use super::BreakerConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of consulting the breaker before an execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    Deny { reason: String },
}

/// Breaker surface the executor depends on; lets the composite form swap in.
pub trait BreakerPolicy: Send + Sync {
    fn check(&self, tool: &str, config: &BreakerConfig) -> BreakerDecision;
    fn record_success(&self, tool: &str);
    fn record_failure(&self, tool: &str, config: &BreakerConfig);
    fn status(&self, tool: &str) -> BreakerStatus;
    /// Trips the circuit immediately (admin/testing hook).
    fn force_open(&self, tool: &str);
}

struct ToolState {
    status: BreakerStatus,
    consecutive_failures: u32,
    half_open_probes: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

impl Default for ToolState {
    fn default() -> Self {
        Self {
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            half_open_probes: 0,
            opened_at: None,
            last_failure_at: None,
            last_success_at: None,
        }
    }
}

/// One breaker state per tool name.
#[derive(Default)]
pub struct CircuitBreaker {
    states: DashMap<String, Mutex<ToolState>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, tool: &str, f: impl FnOnce(&mut ToolState) -> R) -> R {
        let entry = self
            .states
            .entry(tool.to_string())
            .or_insert_with(|| Mutex::new(ToolState::default()));
        let mut guard = entry.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

impl BreakerPolicy for CircuitBreaker {
    fn check(&self, tool: &str, config: &BreakerConfig) -> BreakerDecision {
        self.with_state(tool, |state| match state.status {
            BreakerStatus::Closed => BreakerDecision::Allow,
            BreakerStatus::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed() >= config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    state.status = BreakerStatus::HalfOpen;
                    state.half_open_probes = 1;
                    tracing::info!(tool, "circuit half-open, admitting probe");
                    BreakerDecision::Allow
                } else {
                    BreakerDecision::Deny {
                        reason: format!("circuit open for {tool}"),
                    }
                }
            }
            BreakerStatus::HalfOpen => {
                if state.half_open_probes < config.half_open_max {
                    state.half_open_probes += 1;
                    BreakerDecision::Allow
                } else {
                    BreakerDecision::Deny {
                        reason: format!("circuit half-open for {tool}, probe budget used"),
                    }
                }
            }
        })
    }

    fn record_success(&self, tool: &str) {
        self.with_state(tool, |state| {
            if state.status != BreakerStatus::Closed {
                tracing::info!(tool, "circuit closed after successful probe");
            }
            state.status = BreakerStatus::Closed;
            state.consecutive_failures = 0;
            state.half_open_probes = 0;
            state.opened_at = None;
            state.last_success_at = Some(Instant::now());
        });
    }

    fn record_failure(&self, tool: &str, config: &BreakerConfig) {
        self.with_state(tool, |state| {
            state.last_failure_at = Some(Instant::now());
            match state.status {
                BreakerStatus::HalfOpen => {
                    state.status = BreakerStatus::Open;
                    state.opened_at = Some(Instant::now());
                    state.half_open_probes = 0;
                    tracing::warn!(tool, "probe failed, circuit reopened");
                }
                BreakerStatus::Closed => {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= config.failure_threshold {
                        state.status = BreakerStatus::Open;
                        state.opened_at = Some(Instant::now());
                        tracing::warn!(
                            tool,
                            failures = state.consecutive_failures,
                            "failure threshold reached, circuit opened"
                        );
                    }
                }
                BreakerStatus::Open => {}
            }
        });
    }

    fn status(&self, tool: &str) -> BreakerStatus {
        self.with_state(tool, |state| state.status)
    }

    fn force_open(&self, tool: &str) {
        self.with_state(tool, |state| {
            state.status = BreakerStatus::Open;
            state.opened_at = Some(Instant::now());
            state.half_open_probes = 0;
        });
    }
}

const GLOBAL_KEY: &str = "__process__";

/// Per-tool breaker plus a process-wide safety net with a scaled threshold;
/// the most restrictive decision wins.
pub struct CompositeBreaker {
    per_tool: CircuitBreaker,
    global: CircuitBreaker,
    global_scale: u32,
}

impl CompositeBreaker {
    pub fn new() -> Self {
        Self {
            per_tool: CircuitBreaker::new(),
            global: CircuitBreaker::new(),
            global_scale: 4,
        }
    }

    fn global_config(&self, config: &BreakerConfig) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: config.failure_threshold.saturating_mul(self.global_scale),
            ..config.clone()
        }
    }
}

impl Default for CompositeBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerPolicy for CompositeBreaker {
    fn check(&self, tool: &str, config: &BreakerConfig) -> BreakerDecision {
        if let deny @ BreakerDecision::Deny { .. } = self.per_tool.check(tool, config) {
            return deny;
        }
        self.global.check(GLOBAL_KEY, &self.global_config(config))
    }

    fn record_success(&self, tool: &str) {
        self.per_tool.record_success(tool);
        self.global.record_success(GLOBAL_KEY);
    }

    fn record_failure(&self, tool: &str, config: &BreakerConfig) {
        self.per_tool.record_failure(tool, config);
        self.global
            .record_failure(GLOBAL_KEY, &self.global_config(config));
    }

    fn status(&self, tool: &str) -> BreakerStatus {
        match self.per_tool.status(tool) {
            BreakerStatus::Closed => self.global.status(GLOBAL_KEY),
            other => other,
        }
    }

    fn force_open(&self, tool: &str) {
        self.per_tool.force_open(tool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(threshold: u32, reset_secs: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(reset_secs),
            half_open_max: 1,
        }
    }

    #[tokio::test]
    async fn opens_at_threshold_within_one_call() {
        let b = CircuitBreaker::new();
        let cfg = config(3, 30);
        for _ in 0..2 {
            b.record_failure("t", &cfg);
            assert_eq!(b.status("t"), BreakerStatus::Closed);
        }
        b.record_failure("t", &cfg);
        assert_eq!(b.status("t"), BreakerStatus::Open);
        assert!(matches!(b.check("t", &cfg), BreakerDecision::Deny { .. }));
    }

    #[tokio::test]
    async fn half_open_after_reset_then_success_closes() {
        tokio::time::pause();
        let b = CircuitBreaker::new();
        let cfg = config(1, 30);
        b.record_failure("t", &cfg);
        assert_eq!(b.status("t"), BreakerStatus::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(b.check("t", &cfg), BreakerDecision::Allow);
        assert_eq!(b.status("t"), BreakerStatus::HalfOpen);
        // Probe budget of one: the next check is denied.
        assert!(matches!(b.check("t", &cfg), BreakerDecision::Deny { .. }));

        b.record_success("t");
        assert_eq!(b.status("t"), BreakerStatus::Closed);
        assert_eq!(b.check("t", &cfg), BreakerDecision::Allow);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        tokio::time::pause();
        let b = CircuitBreaker::new();
        let cfg = config(1, 30);
        b.record_failure("t", &cfg);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(b.check("t", &cfg), BreakerDecision::Allow);
        b.record_failure("t", &cfg);
        assert_eq!(b.status("t"), BreakerStatus::Open);
        assert!(matches!(b.check("t", &cfg), BreakerDecision::Deny { .. }));
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let b = CircuitBreaker::new();
        let cfg = config(3, 30);
        b.record_failure("t", &cfg);
        b.record_failure("t", &cfg);
        b.record_success("t");
        b.record_failure("t", &cfg);
        b.record_failure("t", &cfg);
        assert_eq!(b.status("t"), BreakerStatus::Closed);
    }

    #[tokio::test]
    async fn composite_returns_most_restrictive() {
        let b = CompositeBreaker::new();
        let cfg = config(2, 30);
        b.force_open("t");
        assert!(matches!(b.check("t", &cfg), BreakerDecision::Deny { .. }));
        // Another tool is unaffected by the per-tool trip.
        assert_eq!(b.check("other", &cfg), BreakerDecision::Allow);
    }

    #[tokio::test]
    async fn composite_global_net_trips_across_tools() {
        let b = CompositeBreaker::new();
        let cfg = config(100, 30); // per-tool threshold never reached
        for i in 0..400 {
            b.record_failure(&format!("tool-{}", i % 7), &cfg);
        }
        assert!(matches!(b.check("fresh", &cfg), BreakerDecision::Deny { .. }));
    }
}
