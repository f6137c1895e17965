//! Streaming pipeline: SSE sink abstraction, adaptive writer, thinking-tag
//! extraction, progress checkpoints, and the per-request chat handler.

pub mod handler;
pub mod progress;
pub mod think;
pub mod writer;

pub use handler::{ChatStreamHandler, ChatTurnOutcome, ChatTurnRequest, MultiToolManager};
pub use progress::{InMemoryProgressStore, ProgressStatus, StreamProgress, StreamProgressStore};
pub use think::split_thinking;
pub use writer::{
    AdaptiveSseWriter, ChannelSink, CollectorSink, SseSink, WriteMode, WriterConfig,
};
