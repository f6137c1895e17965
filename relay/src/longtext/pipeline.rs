//! The long-text pipeline: split → map → reduce → final streamed report.
//!
//! Map calls go through the LLM queue with `skip_rate_limit` (the pipeline
//! is sequential, so its rate is already bounded); the final report streams
//! through the adaptive writer and is persisted like any assistant turn.
//! Client disconnect between chunks aborts without persisting.

use std::sync::Arc;

use stream_event::{ChatEvent, ChunkingStage};
use tokio::sync::mpsc;

use super::extract::{merge_extractions, parse_extraction, Extraction};
use super::splitter::{split_structural, SplitConfig};
use crate::llm::{LlmClient, ProviderRequest};
use crate::message::{ChatMessage, ChatRole};
use crate::queue::{EnqueueOptions, LlmQueue, QueueRole};
use crate::repo::{ConversationRepo, MessageRepo, StoredMessage};
use crate::stream::handler::ChatTurnRequest;
use crate::stream::progress::StreamProgressStore;
use crate::stream::think::split_thinking;
use crate::stream::writer::AdaptiveSseWriter;

/// Seconds of provider time budgeted per chunk, for the client's estimate.
const ESTIMATED_SECS_PER_CHUNK: u64 = 8;

const MAP_PROMPT: &str = "You are analyzing one segment of a long plan document. Extract what \
this segment states into JSON of the shape {\"extracted\": {\"goals\": [], \"milestones\": [], \
\"tasks\": [{\"title\": \"\", \"owner\": \"\", \"deadline\": \"\", \"dependsOn\": []}], \
\"metrics\": [], \"risks\": [{\"risk\": \"\", \"mitigation\": \"\"}], \"unknowns\": []}}. \
Output only the JSON object. Segment:\n\n";

const REDUCE_PROMPT: &str = "You are writing the final review of a long plan document. The \
structured findings below were merged from every segment. Write a clear report covering goals, \
milestones, tasks with owners and deadlines, metrics, risks with mitigations, and open \
questions. Findings:\n\n";

/// Caller-supplied splitter overrides (`longTextOptions` on the request).
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LongTextOptions {
    pub max_chunk_size: Option<usize>,
    pub target_chunk_size: Option<usize>,
    pub overlap: Option<usize>,
    pub max_chunks: Option<usize>,
}

impl LongTextOptions {
    fn split_config(&self) -> SplitConfig {
        let d = SplitConfig::default();
        SplitConfig {
            max_chunk_size: self.max_chunk_size.unwrap_or(d.max_chunk_size),
            target_chunk_size: self.target_chunk_size.unwrap_or(d.target_chunk_size),
            overlap: self.overlap.unwrap_or(d.overlap),
            max_chunks: self.max_chunks.unwrap_or(d.max_chunks),
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Clone, Debug, Default)]
pub struct PipelineOutcome {
    pub completed: bool,
    pub chunks: usize,
    pub report: String,
    pub persisted: bool,
}

/// Map-reduce analysis over one long document.
pub struct LongTextPipeline {
    queue: Arc<LlmQueue>,
    conversations: Arc<dyn ConversationRepo>,
    messages: Arc<dyn MessageRepo>,
    progress: Arc<dyn StreamProgressStore>,
}

impl LongTextPipeline {
    pub fn new(
        queue: Arc<LlmQueue>,
        conversations: Arc<dyn ConversationRepo>,
        messages: Arc<dyn MessageRepo>,
        progress: Arc<dyn StreamProgressStore>,
    ) -> Self {
        Self {
            queue,
            conversations,
            messages,
            progress,
        }
    }

    pub async fn run(
        &self,
        llm: &Arc<dyn LlmClient>,
        request: &ChatTurnRequest,
        document: &str,
        options: &LongTextOptions,
        writer: &AdaptiveSseWriter,
    ) -> PipelineOutcome {
        let chunks = split_structural(document, &options.split_config());
        let total = chunks.len();
        let mut outcome = PipelineOutcome {
            chunks: total,
            ..PipelineOutcome::default()
        };

        writer.send_event(ChatEvent::ChunkingInit {
            total_chunks: total,
            estimated_seconds: total as u64 * ESTIMATED_SECS_PER_CHUNK,
        });

        // Map: sequential per-chunk extraction.
        let mut extractions: Vec<Extraction> = Vec::new();
        for chunk in &chunks {
            if writer.is_closed() || request.cancel.is_cancelled() {
                tracing::debug!(chunk = chunk.index, "client gone, aborting pipeline");
                return outcome;
            }
            writer.send_event(ChatEvent::ChunkingProgress {
                stage: ChunkingStage::Map,
                chunk_index: Some(chunk.index),
                total_chunks: Some(total),
            });

            let extraction = match self.map_chunk(llm, request, &chunk.text).await {
                Ok(extraction) => extraction,
                Err(e) => {
                    // A failed chunk contributes nothing; the stream goes on.
                    tracing::warn!(chunk = chunk.index, error = %e, "map step failed");
                    Extraction::default()
                }
            };
            writer.send_event(ChatEvent::ChunkingChunk {
                chunk_index: chunk.index,
                chunk_summary: format!("{} items extracted", extraction.item_count()),
            });
            if !extraction.is_empty() {
                extractions.push(extraction);
            }
        }

        if writer.is_closed() || request.cancel.is_cancelled() {
            return outcome;
        }

        // Reduce: pure merge, no provider call.
        writer.send_event(ChatEvent::ChunkingProgress {
            stage: ChunkingStage::Reduce,
            chunk_index: None,
            total_chunks: Some(total),
        });
        let merged = merge_extractions(extractions);

        // Final: stream the report.
        writer.send_event(ChatEvent::ChunkingProgress {
            stage: ChunkingStage::Final,
            chunk_index: None,
            total_chunks: Some(total),
        });
        let report = match self.final_report(llm, request, &merged, writer).await {
            Ok(report) => report,
            Err(e) => {
                if !writer.is_closed() {
                    writer.send_event(ChatEvent::Error {
                        error: e,
                        message: None,
                    });
                }
                return outcome;
            }
        };

        if writer.is_closed() {
            return outcome;
        }

        let split = split_thinking(&report);
        outcome.report = split.content.clone();
        outcome.persisted = self.persist(request, &split).await;
        outcome.completed = true;
        writer.send_event(ChatEvent::Done {
            assistant_message_id: request.assistant_message_id.clone(),
            sources: vec![],
        });
        outcome
    }

    async fn map_chunk(
        &self,
        llm: &Arc<dyn LlmClient>,
        request: &ChatTurnRequest,
        chunk_text: &str,
    ) -> Result<Extraction, String> {
        let messages = vec![ChatMessage::user(format!("{MAP_PROMPT}{chunk_text}"))];
        let opts = EnqueueOptions {
            role: Some(QueueRole::Single),
            skip_rate_limit: true,
            cancel: Some(request.cancel.clone()),
            ..EnqueueOptions::default()
        };
        let outcome = self
            .queue
            .enqueue(
                opts,
                llm.stream_chat(
                    ProviderRequest {
                        messages,
                        tools: vec![],
                        model: None,
                    },
                    None,
                ),
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok(parse_extraction(&outcome.content).unwrap_or_default())
    }

    async fn final_report(
        &self,
        llm: &Arc<dyn LlmClient>,
        request: &ChatTurnRequest,
        merged: &Extraction,
        writer: &AdaptiveSseWriter,
    ) -> Result<String, String> {
        let findings =
            serde_json::to_string_pretty(merged).map_err(|e| e.to_string())?;
        let messages = vec![ChatMessage::user(format!("{REDUCE_PROMPT}{findings}"))];
        let opts = EnqueueOptions {
            role: Some(QueueRole::Single),
            skip_rate_limit: true,
            cancel: Some(request.cancel.clone()),
            ..EnqueueOptions::default()
        };

        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
        let call = llm.stream_chat(
            ProviderRequest {
                messages,
                tools: vec![],
                model: None,
            },
            Some(delta_tx),
        );
        let forward = async {
            let mut cumulative = String::new();
            let mut visible_len = 0usize;
            while let Some(delta) = delta_rx.recv().await {
                cumulative.push_str(&delta);
                let split = split_thinking(&cumulative);
                if split.content.len() >= visible_len {
                    let visible_delta = split.content[visible_len..].to_string();
                    visible_len = split.content.len();
                    writer.push_text(visible_delta, split.thinking, vec![]);
                } else {
                    visible_len = split.content.len();
                }
            }
        };
        let (result, ()) = tokio::join!(self.queue.enqueue(opts, call), forward);
        result.map(|o| o.content).map_err(|e| e.to_string())
    }

    async fn persist(
        &self,
        request: &ChatTurnRequest,
        split: &crate::stream::think::ThinkingSplit,
    ) -> bool {
        let mut message = StoredMessage::new(
            &request.conversation_id,
            &request.user_id,
            ChatRole::Assistant,
            &split.content,
        );
        message.id = request.assistant_message_id.clone();
        message.thinking = split.thinking.clone();
        message.client_id = request.client_assistant_message_id.clone();
        match self.messages.save(&message).await {
            Ok(_) => {
                if let Err(e) = self
                    .conversations
                    .record_message_append(&request.conversation_id)
                    .await
                {
                    tracing::warn!("message count bump failed: {}", e);
                }
                if let Err(e) = self
                    .progress
                    .mark_completed(
                        &request.assistant_message_id,
                        &split.content,
                        split.thinking.as_deref(),
                        &[],
                    )
                    .await
                {
                    tracing::warn!("progress completion failed: {}", e);
                }
                true
            }
            Err(e) => {
                tracing::error!("pipeline report persist failed: {}", e);
                false
            }
        }
    }
}
