//! Long-text map-reduce pipeline: structural chunking, per-chunk JSON
//! extraction, deduplicating merge, and a final streamed report.

pub mod extract;
pub mod pipeline;
pub mod splitter;

pub use extract::{merge_extractions, parse_extraction, ExtractedRisk, ExtractedTask, Extraction};
pub use pipeline::{LongTextOptions, LongTextPipeline, PipelineOutcome};
pub use splitter::{split_structural, Chunk, SplitConfig};
