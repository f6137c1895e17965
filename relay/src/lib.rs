//! relay: LLM request gateway core.
//!
//! Mediates between concurrent chat clients and upstream LLM/search
//! providers: SSE admission with a fair wait queue, a priority-gated LLM
//! request queue, a tool runtime (registry, rate limits, cache, circuit
//! breaker, fallback chains, orchestration), the streaming response
//! pipeline with adaptive typewriter output and partial-output recovery,
//! multi-agent sessions with resumable checkpoints, and a map-reduce
//! pipeline for long documents.
//!
//! The HTTP surface lives in the `serve` crate; wire-level SSE event shapes
//! live in `stream-event`. Storage backends sit behind the traits in
//! [`repo`], with SQLite/filesystem/in-memory reference implementations.

pub mod admission;
pub mod archival;
pub mod llm;
pub mod longtext;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod repo;
pub mod services;
pub mod session;
pub mod stream;
pub mod tools;

pub use admission::{AcquireOutcome, AdmissionConfig, AdmissionLimiter, SlotGuard};
pub use llm::{ArkClient, LlmClient, LlmError, MockLlm, MockTurn, OllamaClient};
pub use message::{ChatMessage, ChatRole, Source, TokenUsage};
pub use metrics::MetricsSnapshot;
pub use queue::{EnqueueOptions, LlmQueue, QueueConfig, QueueError, QueueRole};
pub use services::{BuildError, Services};
pub use session::{AgentSession, AgentSessionStore, MultiAgentWorkflow, WorkflowRequest};
pub use stream::{
    AdaptiveSseWriter, ChannelSink, ChatStreamHandler, ChatTurnRequest, CollectorSink, SseSink,
    WriteMode, WriterConfig,
};
pub use tools::{
    ExecuteOptions, ToolContext, ToolError, ToolExecutor, ToolPlugin, ToolRegistry, ToolResult,
};
