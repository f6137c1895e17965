//! Client-facing event types for one chat stream.
//!
//! The grammar is heterogeneous on the wire: some events carry a `type` tag
//! (`init`, `resume`, `chunking_*`), the content frame and the terminal frame
//! do not. [`ChatEvent::to_value`] builds the exact shape for each.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One cited source attached to an assistant answer (from the search tool).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
}

/// Stage of the long-text map-reduce pipeline, for `chunking_progress`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkingStage {
    Map,
    Reduce,
    Final,
}

impl ChunkingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkingStage::Map => "map",
            ChunkingStage::Reduce => "reduce",
            ChunkingStage::Final => "final",
        }
    }
}

/// Every event the gateway can emit on an open chat stream.
#[derive(Clone, Debug)]
pub enum ChatEvent {
    /// First event on every stream: ids the client needs to resume or poll.
    Init {
        conversation_id: String,
        assistant_message_id: String,
    },
    /// Cumulative assistant text; `thinking` and `sources` ride along when present.
    Content {
        content: String,
        thinking: Option<String>,
        sources: Vec<Source>,
    },
    /// Notice that a tool is being executed on the model's behalf.
    ToolCall { tool: String, params: Value },
    /// Long-text pipeline opening totals.
    ChunkingInit {
        total_chunks: usize,
        estimated_seconds: u64,
    },
    /// Long-text pipeline stage progress.
    ChunkingProgress {
        stage: ChunkingStage,
        chunk_index: Option<usize>,
        total_chunks: Option<usize>,
    },
    /// Per-chunk summary after a map step.
    ChunkingChunk {
        chunk_index: usize,
        chunk_summary: String,
    },
    /// Multi-agent session resumed from a checkpoint.
    Resume {
        resumed_from_round: u32,
        continue_from_round: u32,
    },
    /// Multi-agent session ran all rounds.
    SessionComplete { rounds: u32 },
    /// Terminal frame; the stream closes after this.
    Done {
        assistant_message_id: String,
        sources: Vec<Source>,
    },
    /// In-stream error report; the stream closes after this.
    Error {
        error: String,
        message: Option<String>,
    },
}

impl ChatEvent {
    /// Serializes this event to its wire JSON shape.
    pub fn to_value(&self) -> Value {
        match self {
            ChatEvent::Init {
                conversation_id,
                assistant_message_id,
            } => json!({
                "type": "init",
                "conversationId": conversation_id,
                "assistantMessageId": assistant_message_id,
            }),
            ChatEvent::Content {
                content,
                thinking,
                sources,
            } => {
                let mut obj = json!({ "content": content });
                if let Some(t) = thinking {
                    obj["thinking"] = json!(t);
                }
                if !sources.is_empty() {
                    obj["sources"] = json!(sources);
                }
                obj
            }
            ChatEvent::ToolCall { tool, params } => {
                let mut call = json!({ "tool": tool });
                if let (Some(call_obj), Some(params_obj)) =
                    (call.as_object_mut(), params.as_object())
                {
                    for (k, v) in params_obj {
                        call_obj.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
                json!({ "content": "正在执行工具...", "toolCall": call })
            }
            ChatEvent::ChunkingInit {
                total_chunks,
                estimated_seconds,
            } => json!({
                "type": "chunking_init",
                "totalChunks": total_chunks,
                "estimatedSeconds": estimated_seconds,
            }),
            ChatEvent::ChunkingProgress {
                stage,
                chunk_index,
                total_chunks,
            } => {
                let mut obj = json!({
                    "type": "chunking_progress",
                    "stage": stage.as_str(),
                });
                if let Some(i) = chunk_index {
                    obj["chunkIndex"] = json!(i);
                }
                if let Some(n) = total_chunks {
                    obj["totalChunks"] = json!(n);
                }
                obj
            }
            ChatEvent::ChunkingChunk {
                chunk_index,
                chunk_summary,
            } => json!({
                "type": "chunking_chunk",
                "chunkIndex": chunk_index,
                "chunkSummary": chunk_summary,
            }),
            ChatEvent::Resume {
                resumed_from_round,
                continue_from_round,
            } => json!({
                "type": "resume",
                "resumedFromRound": resumed_from_round,
                "continueFromRound": continue_from_round,
            }),
            ChatEvent::SessionComplete { rounds } => json!({
                "type": "session_complete",
                "rounds": rounds,
            }),
            ChatEvent::Done {
                assistant_message_id,
                sources,
            } => {
                let mut obj = json!({
                    "done": true,
                    "assistantMessageId": assistant_message_id,
                });
                if !sources.is_empty() {
                    obj["sources"] = json!(sources);
                }
                obj
            }
            ChatEvent::Error { error, message } => {
                let mut obj = json!({ "error": error });
                if let Some(m) = message {
                    obj["message"] = json!(m);
                }
                obj
            }
        }
    }

    /// True for events after which the stream must close.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Done { .. } | ChatEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_carries_type_and_ids() {
        let v = ChatEvent::Init {
            conversation_id: "c1".into(),
            assistant_message_id: "m1".into(),
        }
        .to_value();
        assert_eq!(v["type"], "init");
        assert_eq!(v["conversationId"], "c1");
        assert_eq!(v["assistantMessageId"], "m1");
    }

    #[test]
    fn content_omits_empty_optionals() {
        let v = ChatEvent::Content {
            content: "hello".into(),
            thinking: None,
            sources: vec![],
        }
        .to_value();
        assert_eq!(v["content"], "hello");
        assert!(v.get("thinking").is_none());
        assert!(v.get("sources").is_none());
        assert!(v.get("type").is_none());
    }

    #[test]
    fn content_includes_thinking_and_sources() {
        let v = ChatEvent::Content {
            content: "x".into(),
            thinking: Some("hmm".into()),
            sources: vec![Source {
                title: "t".into(),
                url: "https://example.com".into(),
            }],
        }
        .to_value();
        assert_eq!(v["thinking"], "hmm");
        assert_eq!(v["sources"][0]["url"], "https://example.com");
    }

    #[test]
    fn tool_call_merges_params_without_clobbering_tool() {
        let v = ChatEvent::ToolCall {
            tool: "web_search".into(),
            params: serde_json::json!({ "query": "rust", "tool": "ignored" }),
        }
        .to_value();
        assert_eq!(v["content"], "正在执行工具...");
        assert_eq!(v["toolCall"]["tool"], "web_search");
        assert_eq!(v["toolCall"]["query"], "rust");
    }

    #[test]
    fn done_is_terminal() {
        let ev = ChatEvent::Done {
            assistant_message_id: "m1".into(),
            sources: vec![],
        };
        assert!(ev.is_terminal());
        let v = ev.to_value();
        assert_eq!(v["done"], true);
        assert!(v.get("sources").is_none());
    }

    #[test]
    fn chunking_progress_map_stage() {
        let v = ChatEvent::ChunkingProgress {
            stage: ChunkingStage::Map,
            chunk_index: Some(2),
            total_chunks: Some(7),
        }
        .to_value();
        assert_eq!(v["type"], "chunking_progress");
        assert_eq!(v["stage"], "map");
        assert_eq!(v["chunkIndex"], 2);
        assert_eq!(v["totalChunks"], 7);
    }

    #[test]
    fn resume_names_both_rounds() {
        let v = ChatEvent::Resume {
            resumed_from_round: 2,
            continue_from_round: 3,
        }
        .to_value();
        assert_eq!(v["type"], "resume");
        assert_eq!(v["resumedFromRound"], 2);
        assert_eq!(v["continueFromRound"], 3);
    }
}
