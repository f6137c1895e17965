//! Adaptive SSE writer: per-character typewriter vs. whole-chunk emission.
//!
//! A spawned task owns the emission loop; the handler pushes text deltas and
//! events through a channel, so event order is FIFO no matter how modes
//! switch. When the pending buffer grows past the backpressure threshold the
//! writer switches to chunk mode, and switches back once it drains below
//! half the threshold. Every write checks the sink first; a closed sink
//! stops the writer and the handler proceeds to cleanup.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stream_event::{heartbeat_frame, sse_frame, ChatEvent};
use tokio::sync::{mpsc, oneshot};

use crate::message::Source;

/// Emission mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// One frame per character, cumulative content, configurable delay.
    Character,
    /// Whole pending segment per frame with a minimal pause.
    Chunk,
}

/// Writer knobs.
#[derive(Clone, Debug)]
pub struct WriterConfig {
    pub char_delay: Duration,
    pub chunk_pause: Duration,
    pub backpressure_threshold: usize,
    pub adaptive: bool,
    /// Pins the mode regardless of buffer depth.
    pub forced_mode: Option<WriteMode>,
    /// Process-wide switch counter (the per-writer count is also kept);
    /// feeds the metrics endpoint.
    pub switch_counter: Option<Arc<AtomicU64>>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            char_delay: Duration::from_millis(30),
            chunk_pause: Duration::from_millis(5),
            backpressure_threshold: 500,
            adaptive: true,
            forced_mode: None,
            switch_counter: None,
        }
    }
}

/// Transport the writer emits into (the HTTP response body, in production).
#[async_trait]
pub trait SseSink: Send + Sync {
    /// Sends one framed SSE chunk; returns false once the client is gone.
    async fn send_frame(&self, frame: String) -> bool;
    fn is_closed(&self) -> bool;
}

/// Production sink: frames flow through a channel into the response body.
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl SseSink for ChannelSink {
    async fn send_frame(&self, frame: String) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Capturing sink for tests and offline runs.
#[derive(Default)]
pub struct CollectorSink {
    frames: std::sync::Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    /// Parsed JSON payloads of the captured data frames.
    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.frames()
            .iter()
            .filter_map(|f| f.strip_prefix("data: "))
            .filter_map(|s| serde_json::from_str(s.trim()).ok())
            .collect()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SseSink for CollectorSink {
    async fn send_frame(&self, frame: String) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if let Ok(mut frames) = self.frames.lock() {
            frames.push(frame);
        }
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

enum Cmd {
    Text {
        delta: String,
        thinking: Option<String>,
        sources: Vec<Source>,
    },
    Event(ChatEvent),
    Reset,
    Flush(oneshot::Sender<()>),
}

/// Handle used by request handlers; the emission loop runs in its own task.
pub struct AdaptiveSseWriter {
    tx: mpsc::UnboundedSender<Cmd>,
    sink: Arc<dyn SseSink>,
    stopped: Arc<AtomicBool>,
    switches: Arc<AtomicU64>,
}

impl AdaptiveSseWriter {
    pub fn spawn(sink: Arc<dyn SseSink>, config: WriterConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicBool::new(false));
        let switches = Arc::new(AtomicU64::new(0));
        let task = WriterTask {
            rx,
            sink: Arc::clone(&sink),
            config,
            stopped: Arc::clone(&stopped),
            switches: Arc::clone(&switches),
        };
        tokio::spawn(task.run());
        Self {
            tx,
            sink,
            stopped,
            switches,
        }
    }

    /// Appends a content delta; `thinking`/`sources` are the latest snapshots
    /// to attach to emitted frames. An empty delta refreshes metadata only.
    pub fn push_text(
        &self,
        delta: impl Into<String>,
        thinking: Option<String>,
        sources: Vec<Source>,
    ) {
        let _ = self.tx.send(Cmd::Text {
            delta: delta.into(),
            thinking,
            sources,
        });
    }

    /// Emits a structured event after draining pending content.
    pub fn send_event(&self, event: ChatEvent) {
        let _ = self.tx.send(Cmd::Event(event));
    }

    /// Drops buffered content and starts a fresh accumulated segment
    /// (used between tool re-invocations).
    pub fn reset(&self) {
        let _ = self.tx.send(Cmd::Reset);
    }

    /// Waits until everything pushed so far has been emitted.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Cmd::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Sends a heartbeat comment directly (bypasses content ordering; SSE
    /// comments carry no data).
    pub async fn heartbeat(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.sink.send_frame(heartbeat_frame().to_string()).await
    }

    pub fn is_closed(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) || self.sink.is_closed()
    }

    /// Times the writer flipped between character and chunk mode.
    pub fn mode_switches(&self) -> u64 {
        self.switches.load(Ordering::SeqCst)
    }
}

struct WriterTask {
    rx: mpsc::UnboundedReceiver<Cmd>,
    sink: Arc<dyn SseSink>,
    config: WriterConfig,
    stopped: Arc<AtomicBool>,
    switches: Arc<AtomicU64>,
}

struct EmitState {
    pending: VecDeque<char>,
    cumulative: String,
    thinking: Option<String>,
    sources: Vec<Source>,
    meta_dirty: bool,
    mode: WriteMode,
}

impl WriterTask {
    async fn run(mut self) {
        let mut state = EmitState {
            pending: VecDeque::new(),
            cumulative: String::new(),
            thinking: None,
            sources: vec![],
            meta_dirty: false,
            mode: self.config.forced_mode.unwrap_or(WriteMode::Character),
        };

        loop {
            // Drain every queued command before emitting, so bursts pile into
            // `pending` and the backpressure check sees the real depth.
            let cmd = if state.pending.is_empty() && !state.meta_dirty {
                match self.rx.recv().await {
                    Some(c) => Some(c),
                    None => break,
                }
            } else {
                match self.rx.try_recv() {
                    Ok(c) => Some(c),
                    Err(mpsc::error::TryRecvError::Empty) => None,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.drain(&mut state).await;
                        break;
                    }
                }
            };

            if let Some(cmd) = cmd {
                match cmd {
                    Cmd::Text {
                        delta,
                        thinking,
                        sources,
                    } => {
                        state.thinking = thinking;
                        state.sources = sources;
                        if delta.is_empty() {
                            state.meta_dirty = true;
                        } else {
                            state.pending.extend(delta.chars());
                        }
                    }
                    Cmd::Event(event) => {
                        if !self.drain(&mut state).await {
                            break;
                        }
                        if !self.emit_frame(sse_frame(&event)).await {
                            break;
                        }
                    }
                    Cmd::Reset => {
                        if !self.drain(&mut state).await {
                            break;
                        }
                        state.cumulative.clear();
                        state.thinking = None;
                        state.meta_dirty = false;
                    }
                    Cmd::Flush(ack) => {
                        if !self.drain(&mut state).await {
                            break;
                        }
                        let _ = ack.send(());
                    }
                }
                continue;
            }

            if !self.emit_step(&mut state).await {
                break;
            }
        }
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn adapt(&mut self, state: &mut EmitState) {
        let target = match self.config.forced_mode {
            Some(mode) => mode,
            None if !self.config.adaptive => state.mode,
            None => {
                if state.pending.len() > self.config.backpressure_threshold {
                    WriteMode::Chunk
                } else if state.pending.len() < self.config.backpressure_threshold / 2 {
                    WriteMode::Character
                } else {
                    state.mode
                }
            }
        };
        if target != state.mode {
            state.mode = target;
            self.switches.fetch_add(1, Ordering::SeqCst);
            if let Some(counter) = &self.config.switch_counter {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            tracing::debug!(mode = ?target, "sse writer switched mode");
        }
    }

    async fn emit_step(&mut self, state: &mut EmitState) -> bool {
        if state.pending.is_empty() {
            if state.meta_dirty {
                state.meta_dirty = false;
                return self.emit_content(state).await;
            }
            return true;
        }
        self.adapt(state);
        match state.mode {
            WriteMode::Character => {
                if let Some(c) = state.pending.pop_front() {
                    state.cumulative.push(c);
                }
                state.meta_dirty = false;
                if !self.emit_content(state).await {
                    return false;
                }
                tokio::time::sleep(self.config.char_delay).await;
            }
            WriteMode::Chunk => {
                state.cumulative.extend(state.pending.drain(..));
                state.meta_dirty = false;
                if !self.emit_content(state).await {
                    return false;
                }
                tokio::time::sleep(self.config.chunk_pause).await;
            }
        }
        true
    }

    /// Flushes everything pending as one chunk (mode switches don't reorder).
    async fn drain(&mut self, state: &mut EmitState) -> bool {
        if state.pending.is_empty() && !state.meta_dirty {
            return true;
        }
        state.cumulative.extend(state.pending.drain(..));
        state.meta_dirty = false;
        self.emit_content(state).await
    }

    async fn emit_content(&self, state: &EmitState) -> bool {
        self.emit_frame(sse_frame(&ChatEvent::Content {
            content: state.cumulative.clone(),
            thinking: state.thinking.clone(),
            sources: state.sources.clone(),
        }))
        .await
    }

    async fn emit_frame(&self, frame: String) -> bool {
        if self.sink.is_closed() {
            return false;
        }
        self.sink.send_frame(frame).await
    }
}
