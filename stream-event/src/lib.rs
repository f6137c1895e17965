//! SSE event grammar for the relay chat stream.
//!
//! This crate defines the wire shape of every event the gateway emits on
//! `/api/chat` and the SSE framing (`data: <JSON>\n\n`, heartbeat comments).
//! It does not depend on `relay`; the core builds [`ChatEvent`] values and the
//! server writes [`frame`] output to the response body.

pub mod event;
pub mod frame;

pub use event::{ChatEvent, ChunkingStage, Source};
pub use frame::{heartbeat_frame, sse_frame};
