//! In-process gate in front of upstream LLM APIs.
//!
//! Admits work by priority (role + offset), bounded by a concurrency cap and
//! a sliding 60-second request window, with a per-item timeout. Latency-
//! sensitive callers (multi-agent hosts) outrank background work; among equal
//! priorities, arrival order wins. The queue is advisory: callers whose rate
//! is bounded elsewhere may set `skip_rate_limit`.

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::llm::LlmError;

const RPM_WINDOW: Duration = Duration::from_secs(60);
const RPM_RETRY_PAUSE: Duration = Duration::from_secs(1);
const LATENCY_SAMPLES: usize = 256;

/// Queue limits, from `LLM_MAX_CONCURRENT` / `LLM_MAX_RPM` / `LLM_TIMEOUT`.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_rpm: u32,
    pub timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_rpm: 60,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Caller role; determines base priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueRole {
    Host,
    Planner,
    Critic,
    Reporter,
    Single,
}

impl QueueRole {
    pub fn base_priority(&self) -> i32 {
        match self {
            QueueRole::Host => 100,
            QueueRole::Planner => 80,
            QueueRole::Critic => 60,
            QueueRole::Reporter => 40,
            QueueRole::Single => 50,
        }
    }
}

/// Per-call scheduling options.
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    pub role: Option<QueueRole>,
    pub priority_offset: i32,
    /// Bypass the RPM window (concurrency and ordering still apply).
    pub skip_rate_limit: bool,
    /// Overrides the queue-wide timeout for this item.
    pub timeout: Option<Duration>,
    /// Fires when the client goes away; fails the caller with `Cancelled`.
    pub cancel: Option<CancellationToken>,
}

impl EnqueueOptions {
    pub fn role(role: QueueRole) -> Self {
        Self {
            role: Some(role),
            ..Self::default()
        }
    }

    fn priority(&self) -> i32 {
        self.role.unwrap_or(QueueRole::Single).base_priority() + self.priority_offset
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("llm request timed out after {0:?}")]
    Timeout(Duration),
    #[error("llm request cancelled")]
    Cancelled,
    #[error(transparent)]
    Upstream(#[from] LlmError),
}

/// Waiting-set key: highest priority first, then arrival order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct WaitKey {
    priority: i32,
    seq: u64,
}

impl Ord for WaitKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for WaitKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    waiting: BTreeSet<WaitKey>,
    active: usize,
    window: VecDeque<Instant>,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time view for `/api/metrics`.
#[derive(Clone, Debug, Serialize)]
pub struct QueueMetricsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub active: usize,
    pub waiting: usize,
    pub requests_last_minute: usize,
    pub p95_latency_ms: u64,
}

/// Priority + concurrency + RPM + timeout gate; see module docs.
pub struct LlmQueue {
    config: QueueConfig,
    state: Mutex<State>,
    notify: Notify,
    seq: AtomicU64,
    counters: Counters,
    latencies: Mutex<VecDeque<u64>>,
}

impl LlmQueue {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(State {
                waiting: BTreeSet::new(),
                active: 0,
                window: VecDeque::new(),
            }),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            counters: Counters::default(),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_SAMPLES)),
        })
    }

    /// Runs `execute` once a slot is available, by priority then arrival.
    ///
    /// Timeout frees the slot and discards the in-flight work (dropping the
    /// future aborts the underlying HTTP call); cancellation does the same
    /// and fails the caller with [`QueueError::Cancelled`].
    pub async fn enqueue<T, F>(&self, opts: EnqueueOptions, execute: F) -> Result<T, QueueError>
    where
        F: Future<Output = Result<T, LlmError>>,
    {
        let key = WaitKey {
            priority: opts.priority(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };
        self.lock_state().waiting.insert(key);

        if let Err(e) = self.wait_for_turn(key, &opts).await {
            self.lock_state().waiting.remove(&key);
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        let timeout = opts.timeout.unwrap_or(self.config.timeout);
        let started = Instant::now();
        let result = match &opts.cancel {
            Some(cancel) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(QueueError::Cancelled),
                    r = tokio::time::timeout(timeout, execute) => flatten(r, timeout),
                }
            }
            None => flatten(tokio::time::timeout(timeout, execute).await, timeout),
        };

        {
            let mut state = self.lock_state();
            state.active = state.active.saturating_sub(1);
        }
        self.notify.notify_waiters();

        match &result {
            Ok(_) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                self.record_latency(started.elapsed());
            }
            Err(QueueError::Timeout(_)) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(QueueError::Cancelled) => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            Err(QueueError::Upstream(_)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    pub fn metrics(&self) -> QueueMetricsSnapshot {
        let (active, waiting, recent) = {
            let mut state = self.lock_state();
            let cutoff = Instant::now() - RPM_WINDOW;
            while state.window.front().is_some_and(|t| *t < cutoff) {
                state.window.pop_front();
            }
            (state.active, state.waiting.len(), state.window.len())
        };
        QueueMetricsSnapshot {
            processed: self.counters.processed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            active,
            waiting,
            requests_last_minute: recent,
            p95_latency_ms: self.p95_latency_ms(),
        }
    }

    async fn wait_for_turn(&self, key: WaitKey, opts: &EnqueueOptions) -> Result<(), QueueError> {
        enum Step {
            Run,
            Wait,
            RpmPause,
        }
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.lock_state();
                let cutoff = Instant::now() - RPM_WINDOW;
                while state.window.front().is_some_and(|t| *t < cutoff) {
                    state.window.pop_front();
                }
                if state.waiting.first() != Some(&key) || state.active >= self.config.max_concurrent
                {
                    Step::Wait
                } else if !opts.skip_rate_limit
                    && state.window.len() >= self.config.max_rpm as usize
                {
                    Step::RpmPause
                } else {
                    state.waiting.remove(&key);
                    state.active += 1;
                    if !opts.skip_rate_limit {
                        state.window.push_back(Instant::now());
                    }
                    Step::Run
                }
            };

            match step {
                Step::Run => {
                    // The next-best waiter may now be eligible (its earlier
                    // check saw this key at the head); let it re-check.
                    self.notify.notify_waiters();
                    return Ok(());
                }
                Step::RpmPause => {
                    self.cancellable_sleep(RPM_RETRY_PAUSE, opts).await?;
                }
                Step::Wait => match &opts.cancel {
                    Some(cancel) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                            _ = &mut notified => {}
                        }
                    }
                    None => notified.await,
                },
            }
        }
    }

    async fn cancellable_sleep(
        &self,
        duration: Duration,
        opts: &EnqueueOptions,
    ) -> Result<(), QueueError> {
        match &opts.cancel {
            Some(cancel) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(QueueError::Cancelled),
                    _ = tokio::time::sleep(duration) => Ok(()),
                }
            }
            None => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }

    fn record_latency(&self, elapsed: Duration) {
        let mut samples = match self.latencies.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if samples.len() == LATENCY_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(elapsed.as_millis() as u64);
    }

    fn p95_latency_ms(&self) -> u64 {
        let samples = match self.latencies.lock() {
            Ok(g) => g.iter().copied().collect::<Vec<_>>(),
            Err(_) => return 0,
        };
        if samples.is_empty() {
            return 0;
        }
        let mut sorted = samples;
        sorted.sort_unstable();
        sorted[(sorted.len() * 95 / 100).min(sorted.len() - 1)]
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn flatten<T>(
    r: Result<Result<T, LlmError>, tokio::time::error::Elapsed>,
    timeout: Duration,
) -> Result<T, QueueError> {
    match r {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(QueueError::Upstream(e)),
        Err(_) => Err(QueueError::Timeout(timeout)),
    }
}
