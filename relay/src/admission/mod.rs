//! SSE admission limiter and wait queue.
//!
//! Bounds concurrent streaming connections globally and per user, and hands
//! waiting callers a resumable queue token. Tokens are admitted strictly in
//! FIFO order as slots free; forged tokens are punished with a cooldown.
//! Everything is process-local: each gateway process guards its own
//! resources, and no cross-process coordination is attempted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Knobs for the limiter. Populated from `MAX_SSE_CONNECTIONS` /
/// `MAX_SSE_CONNECTIONS_PER_USER`; the rest have fixed defaults.
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub max_connections: usize,
    pub max_per_user: usize,
    /// Estimated slots released per second, used for retry-after hints.
    pub release_per_sec: u32,
    pub token_ttl: Duration,
    /// Jitter added to retry hints, sampled uniformly from this range (ms).
    pub retry_jitter_ms: (u64, u64),
    pub abuse_window: Duration,
    pub abuse_threshold: u32,
    pub abuse_cooldown: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_per_user: 5,
            release_per_sec: 5,
            token_ttl: Duration::from_secs(180),
            retry_jitter_ms: (300, 1000),
            abuse_window: Duration::from_secs(10),
            abuse_threshold: 3,
            abuse_cooldown: Duration::from_secs(30),
        }
    }
}

/// Result of one [`AdmissionLimiter::acquire`] call.
pub enum AcquireOutcome {
    /// A slot was granted. Dropping the guard releases it.
    Admitted(SlotGuard),
    /// No slot; the caller holds a place in the FIFO queue.
    Queued {
        token: String,
        position: usize,
        retry_after_secs: u64,
    },
    /// The caller presented forged tokens and is cooling down.
    Rejected { cooldown_secs: u64 },
}

struct WaitEntry {
    token: String,
    expires_at: Instant,
}

struct AbuseRecord {
    window_start: Instant,
    count: u32,
    cooldown_until: Option<Instant>,
}

struct Inner {
    active_total: usize,
    active_per_user: HashMap<String, usize>,
    fifo: VecDeque<WaitEntry>,
    /// Tokens that expired while queued; presenting one is a fresh caller,
    /// never abuse. Entries are retained for one extra TTL.
    expired: HashMap<String, Instant>,
    abuse: HashMap<String, AbuseRecord>,
}

/// Logical permit for one open SSE connection. Dropping it releases both the
/// global and the per-user counter exactly once, on every exit path.
pub struct SlotGuard {
    inner: Arc<Mutex<Inner>>,
    user_id: String,
    released: bool,
}

impl SlotGuard {
    /// Releases the slot now instead of at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(e) => {
                tracing::error!("admission state lock failed (poisoned?): {}", e);
                return;
            }
        };
        inner.active_total = inner.active_total.saturating_sub(1);
        if let Some(count) = inner.active_per_user.get_mut(&self.user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.active_per_user.remove(&self.user_id);
            }
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Caps concurrent SSE streams and schedules fairness for waiters.
pub struct AdmissionLimiter {
    config: AdmissionConfig,
    inner: Arc<Mutex<Inner>>,
}

impl AdmissionLimiter {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner {
                active_total: 0,
                active_per_user: HashMap::new(),
                fifo: VecDeque::new(),
                expired: HashMap::new(),
                abuse: HashMap::new(),
            })),
        }
    }

    /// Tries to admit `user_id`, optionally resuming a queued token.
    ///
    /// Order of evaluation:
    /// 1. capacity available and the caller is not behind anyone → admitted;
    /// 2. token currently queued → refreshed, position and retry hint returned;
    /// 3. forged token → counted; at the threshold the user cools down;
    /// 4. otherwise a fresh token is minted and appended to the queue.
    pub fn acquire(&self, user_id: &str, existing_token: Option<&str>) -> AcquireOutcome {
        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(e) => {
                tracing::error!("admission state lock failed (poisoned?): {}", e);
                return AcquireOutcome::Rejected {
                    cooldown_secs: self.config.abuse_cooldown.as_secs(),
                };
            }
        };
        self.clean_expired(&mut inner, now);

        if let Some(until) = inner
            .abuse
            .get(user_id)
            .and_then(|r| r.cooldown_until)
            .filter(|until| *until > now)
        {
            return AcquireOutcome::Rejected {
                cooldown_secs: (until - now).as_secs().max(1),
            };
        }

        let free = self.config.max_connections.saturating_sub(inner.active_total);
        let user_active = inner.active_per_user.get(user_id).copied().unwrap_or(0);
        let user_ok = user_active < self.config.max_per_user;

        match existing_token {
            Some(token) => {
                let position = inner.fifo.iter().position(|e| e.token == token);
                match position {
                    // Queued token at the head of the released capacity: admit.
                    Some(pos) if user_ok && pos < free => {
                        inner.fifo.remove(pos);
                        self.admit(&mut inner, user_id)
                    }
                    // Still waiting: refresh expiry and report position.
                    Some(pos) => {
                        let ttl = self.config.token_ttl;
                        if let Some(entry) = inner.fifo.get_mut(pos) {
                            entry.expires_at = now + ttl;
                        }
                        AcquireOutcome::Queued {
                            token: token.to_string(),
                            position: pos,
                            retry_after_secs: self.retry_after(pos),
                        }
                    }
                    // Recently expired: a fresh caller, not an abuser.
                    None if inner.expired.remove(token).is_some() => {
                        self.enqueue_or_admit(&mut inner, user_id, now, free, user_ok)
                    }
                    // Never issued: count toward the abuse threshold.
                    None => self.record_abuse(&mut inner, user_id, now, free, user_ok),
                }
            }
            None => self.enqueue_or_admit(&mut inner, user_id, now, free, user_ok),
        }
    }

    /// Removes a token from the queue (client gave up or was admitted elsewhere).
    pub fn release_token(&self, token: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fifo.retain(|e| e.token != token);
        }
    }

    /// Currently admitted stream count.
    pub fn active_count(&self) -> usize {
        self.inner.lock().map(|i| i.active_total).unwrap_or(0)
    }

    /// Currently queued waiter count.
    pub fn queued_count(&self) -> usize {
        self.inner.lock().map(|i| i.fifo.len()).unwrap_or(0)
    }

    fn admit(&self, inner: &mut Inner, user_id: &str) -> AcquireOutcome {
        inner.active_total += 1;
        *inner
            .active_per_user
            .entry(user_id.to_string())
            .or_insert(0) += 1;
        AcquireOutcome::Admitted(SlotGuard {
            inner: Arc::clone(&self.inner),
            user_id: user_id.to_string(),
            released: false,
        })
    }

    fn enqueue_or_admit(
        &self,
        inner: &mut Inner,
        user_id: &str,
        now: Instant,
        free: usize,
        user_ok: bool,
    ) -> AcquireOutcome {
        // Waiters get first claim on free slots; a fresh caller may only take
        // capacity the queue cannot absorb.
        if user_ok && inner.fifo.len() < free {
            return self.admit(inner, user_id);
        }
        let token = uuid::Uuid::new_v4().to_string();
        inner.fifo.push_back(WaitEntry {
            token: token.clone(),
            expires_at: now + self.config.token_ttl,
        });
        let position = inner.fifo.len() - 1;
        AcquireOutcome::Queued {
            retry_after_secs: self.retry_after(position),
            token,
            position,
        }
    }

    fn record_abuse(
        &self,
        inner: &mut Inner,
        user_id: &str,
        now: Instant,
        free: usize,
        user_ok: bool,
    ) -> AcquireOutcome {
        let window = self.config.abuse_window;
        let record = inner
            .abuse
            .entry(user_id.to_string())
            .or_insert(AbuseRecord {
                window_start: now,
                count: 0,
                cooldown_until: None,
            });
        if now - record.window_start > window {
            record.window_start = now;
            record.count = 0;
        }
        record.count += 1;
        if record.count >= self.config.abuse_threshold {
            record.cooldown_until = Some(now + self.config.abuse_cooldown);
            tracing::warn!(user_id, "invalid queue tokens over threshold, cooling down");
            return AcquireOutcome::Rejected {
                cooldown_secs: self.config.abuse_cooldown.as_secs(),
            };
        }
        self.enqueue_or_admit(inner, user_id, now, free, user_ok)
    }

    fn retry_after(&self, position: usize) -> u64 {
        let rate = self.config.release_per_sec.max(1) as usize;
        let base = position.div_ceil(rate) as u64;
        let (lo, hi) = self.config.retry_jitter_ms;
        let jitter_ms = rand::thread_rng().gen_range(lo..=hi.max(lo));
        base + jitter_ms.div_ceil(1000).max(1)
    }

    /// Lazy cleanup, run on every acquire: expired waiters move to the
    /// `expired` set, stale abuse windows and old expired markers go away.
    fn clean_expired(&self, inner: &mut Inner, now: Instant) {
        let ttl = self.config.token_ttl;
        let mut kept = VecDeque::with_capacity(inner.fifo.len());
        while let Some(entry) = inner.fifo.pop_front() {
            if entry.expires_at <= now {
                inner.expired.insert(entry.token, now + ttl);
            } else {
                kept.push_back(entry);
            }
        }
        inner.fifo = kept;
        inner.expired.retain(|_, keep_until| *keep_until > now);
        let window = self.config.abuse_window;
        inner.abuse.retain(|_, r| {
            r.cooldown_until.is_some_and(|u| u > now) || now - r.window_start <= window
        });
    }
}
