//! Per-request streaming chat handler.
//!
//! Drives one `/api/chat` turn: provider call through the LLM queue, live
//! delta forwarding into the adaptive writer, thinking-tag extraction,
//! tool-call detection and dispatch, recursive re-invocation with the tool
//! result appended, and persistence (final on completion, partial on error
//! or disconnect). After the stream is open, errors are reported in-stream
//! and never propagate to the HTTP caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stream_event::ChatEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::progress::StreamProgressStore;
use super::think::{split_thinking, ThinkingSplit};
use super::writer::AdaptiveSseWriter;
use crate::llm::{LlmClient, ProviderOutcome, ProviderRequest};
use crate::message::{ChatMessage, ChatRole, Source, TokenUsage};
use crate::queue::{EnqueueOptions, LlmQueue, QueueError, QueueRole};
use crate::repo::{ConversationRepo, MessageRepo, StoredMessage};
use crate::tools::protocol::{extract_inline_tool_calls, AdapterRegistry};
use crate::tools::{ExecuteOptions, ToolCallRecord, ToolContext, ToolExecutor};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
const PROGRESS_CHARS: usize = 100;

/// Per-request tool bookkeeping: bounds recursion and consecutive errors.
pub struct MultiToolManager {
    max_iterations: u32,
    max_consecutive_errors: u32,
    iterations: u32,
    consecutive_errors: u32,
    pub records: Vec<ToolCallRecord>,
}

impl Default for MultiToolManager {
    fn default() -> Self {
        Self::new(5, 2)
    }
}

impl MultiToolManager {
    pub fn new(max_iterations: u32, max_consecutive_errors: u32) -> Self {
        Self {
            max_iterations,
            max_consecutive_errors,
            iterations: 0,
            consecutive_errors: 0,
            records: Vec::new(),
        }
    }

    /// Claims the next LLM round; false once the iteration budget is spent.
    pub fn begin_iteration(&mut self) -> bool {
        self.iterations += 1;
        self.iterations <= self.max_iterations
    }

    pub fn record(&mut self, record: ToolCallRecord) {
        if record.success {
            self.consecutive_errors = 0;
        } else {
            self.consecutive_errors += 1;
        }
        self.records.push(record);
    }

    pub fn errors_exceeded(&self) -> bool {
        self.consecutive_errors >= self.max_consecutive_errors
    }
}

/// Inputs for one chat turn (admission already granted by the route).
#[derive(Clone)]
pub struct ChatTurnRequest {
    pub user_id: String,
    pub conversation_id: String,
    pub assistant_message_id: String,
    pub request_id: String,
    /// Conversation history including the latest user message.
    pub messages: Vec<ChatMessage>,
    pub client_assistant_message_id: Option<String>,
    pub cancel: CancellationToken,
    pub role: QueueRole,
}

/// What the turn produced (for callers that embed the handler, e.g. the
/// multi-agent workflow and tests).
#[derive(Clone, Debug, Default)]
pub struct ChatTurnOutcome {
    pub content: String,
    pub thinking: Option<String>,
    pub sources: Vec<Source>,
    pub persisted: bool,
    pub completed: bool,
}

/// Streaming pipeline over one provider, tool runtime, and repositories.
pub struct ChatStreamHandler {
    queue: Arc<LlmQueue>,
    executor: Arc<ToolExecutor>,
    adapters: Arc<AdapterRegistry>,
    conversations: Arc<dyn ConversationRepo>,
    messages: Arc<dyn MessageRepo>,
    progress: Arc<dyn StreamProgressStore>,
}

impl ChatStreamHandler {
    pub fn new(
        queue: Arc<LlmQueue>,
        executor: Arc<ToolExecutor>,
        adapters: Arc<AdapterRegistry>,
        conversations: Arc<dyn ConversationRepo>,
        messages: Arc<dyn MessageRepo>,
        progress: Arc<dyn StreamProgressStore>,
    ) -> Self {
        Self {
            queue,
            executor,
            adapters,
            conversations,
            messages,
            progress,
        }
    }

    /// Runs the full turn loop. Never returns an error: failures are
    /// reported in-stream and reflected in the outcome.
    pub async fn run(
        &self,
        llm: &Arc<dyn LlmClient>,
        request: &ChatTurnRequest,
        writer: &AdaptiveSseWriter,
    ) -> ChatTurnOutcome {
        let mut msgs = request.messages.clone();
        let schemas = self.executor.registry().enabled_schemas();
        let mut sources: Vec<Source> = Vec::new();
        let mut manager = MultiToolManager::default();
        let mut outcome = ChatTurnOutcome::default();

        loop {
            if writer.is_closed() {
                tracing::debug!(request_id = %request.request_id, "client gone before provider round");
                return outcome;
            }
            if !manager.begin_iteration() {
                writer.send_event(ChatEvent::Error {
                    error: "tool iteration limit reached".into(),
                    message: None,
                });
                return outcome;
            }

            let round = self
                .stream_one_round(llm, request, &msgs, &schemas, &sources, writer)
                .await;
            let provider = match round {
                Ok(p) => p,
                Err((partial, err)) => {
                    tracing::warn!(request_id = %request.request_id, error = %err, "provider round failed");
                    if !writer.is_closed() {
                        writer.send_event(ChatEvent::Error {
                            error: err.to_string(),
                            message: None,
                        });
                    }
                    let split = split_thinking(&partial);
                    outcome.content = split.content.clone();
                    outcome.thinking = split.thinking.clone();
                    outcome.persisted = self
                        .persist_partial(request, &split, &sources, &err.to_string())
                        .await;
                    return outcome;
                }
            };

            let (clean_content, inline_calls) = extract_inline_tool_calls(&provider.content);
            let mut raw_calls = provider.tool_calls.clone();
            raw_calls.extend(inline_calls);
            let split = split_thinking(&clean_content);

            if raw_calls.is_empty() {
                outcome.content = split.content.clone();
                outcome.thinking = split.thinking.clone();
                outcome.sources = sources.clone();
                outcome.persisted = self
                    .persist_final(request, &split, &sources, provider.usage)
                    .await;
                outcome.completed = true;
                writer.send_event(ChatEvent::Done {
                    assistant_message_id: request.assistant_message_id.clone(),
                    sources: sources.clone(),
                });
                return outcome;
            }

            self.dispatch_tool_calls(
                request,
                &raw_calls,
                &split,
                &mut msgs,
                &mut sources,
                &mut manager,
                writer,
            )
            .await;

            if manager.errors_exceeded() {
                writer.send_event(ChatEvent::Error {
                    error: "tool execution kept failing".into(),
                    message: None,
                });
                outcome.persisted = self
                    .persist_partial(request, &split, &sources, "tool execution kept failing")
                    .await;
                return outcome;
            }

            // Accumulated text resets; the next provider round starts fresh
            // with the tool results appended to the message list.
            writer.reset();
        }
    }

    /// One provider call through the queue, with live delta forwarding and
    /// throttled progress checkpoints. On failure returns the partial text.
    async fn stream_one_round(
        &self,
        llm: &Arc<dyn LlmClient>,
        request: &ChatTurnRequest,
        msgs: &[ChatMessage],
        schemas: &[serde_json::Value],
        sources: &[Source],
        writer: &AdaptiveSseWriter,
    ) -> Result<ProviderOutcome, (String, QueueError)> {
        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
        let provider_request = ProviderRequest {
            messages: msgs.to_vec(),
            tools: schemas.to_vec(),
            model: None,
        };
        let opts = EnqueueOptions {
            role: Some(request.role),
            cancel: Some(request.cancel.clone()),
            ..EnqueueOptions::default()
        };

        let call = llm.stream_chat(provider_request, Some(delta_tx));
        let queued = self.queue.enqueue(opts, call);

        let forward = async {
            let mut cumulative = String::new();
            let mut visible_len = 0usize;
            let mut checkpoint_len = 0usize;
            let mut checkpoint_at = Instant::now();
            while let Some(delta) = delta_rx.recv().await {
                cumulative.push_str(&delta);
                let split = split_thinking(&cumulative);
                if split.content.len() >= visible_len {
                    let visible_delta = split.content[visible_len..].to_string();
                    visible_len = split.content.len();
                    writer.push_text(visible_delta, split.thinking.clone(), sources.to_vec());
                } else {
                    visible_len = split.content.len();
                }
                let due = checkpoint_at.elapsed() >= PROGRESS_INTERVAL
                    || cumulative.len() - checkpoint_len >= PROGRESS_CHARS;
                if due {
                    checkpoint_len = cumulative.len();
                    checkpoint_at = Instant::now();
                    if let Err(e) = self
                        .progress
                        .upsert(
                            &request.assistant_message_id,
                            &split.content,
                            split.thinking.as_deref(),
                            sources,
                        )
                        .await
                    {
                        tracing::warn!("progress checkpoint failed: {}", e);
                    }
                }
            }
            cumulative
        };

        let (result, cumulative) = tokio::join!(queued, forward);
        result.map_err(|e| (cumulative, e))
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool_calls(
        &self,
        request: &ChatTurnRequest,
        raw_calls: &[serde_json::Value],
        split: &ThinkingSplit,
        msgs: &mut Vec<ChatMessage>,
        sources: &mut Vec<Source>,
        manager: &mut MultiToolManager,
        writer: &AdaptiveSseWriter,
    ) {
        for raw in raw_calls {
            if writer.is_closed() {
                return;
            }
            let parsed = match self.adapters.find(raw).map(|a| (a.parse(raw), a)) {
                Some((Ok(parsed), adapter)) => (parsed, adapter),
                Some((Err(e), _)) => {
                    tracing::warn!("tool call parse failed: {}", e);
                    self.append_tool_failure(msgs, split, "unknown", &e.to_string(), manager);
                    continue;
                }
                None => {
                    tracing::warn!("no protocol adapter for tool call shape");
                    self.append_tool_failure(
                        msgs,
                        split,
                        "unknown",
                        "unrecognized tool call shape",
                        manager,
                    );
                    continue;
                }
            };
            let (call, adapter) = parsed;

            writer.send_event(ChatEvent::ToolCall {
                tool: call.tool.clone(),
                params: call.params.clone(),
            });

            let ctx = ToolContext {
                user_id: request.user_id.clone(),
                conversation_id: Some(request.conversation_id.clone()),
                request_id: request.request_id.clone(),
                timestamp: Some(Utc::now()),
            };
            let result = self
                .executor
                .execute(&call.tool, call.params.clone(), &ctx, &ExecuteOptions::default())
                .await;
            let formatted = adapter.format_result(&call.tool, &result);
            for source in formatted.sources {
                if !sources.iter().any(|s| s.url == source.url) {
                    sources.push(source);
                }
            }

            let assistant_text = if split.content.is_empty() {
                format!("(calling tool {})", call.tool)
            } else {
                split.content.clone()
            };
            msgs.push(ChatMessage::assistant(assistant_text));
            msgs.push(ChatMessage::user(formatted.text));
            manager.record(ToolCallRecord {
                tool: call.tool,
                params: call.params,
                success: result.success,
                result: Some(result),
                timestamp: Utc::now(),
            });
        }
    }

    fn append_tool_failure(
        &self,
        msgs: &mut Vec<ChatMessage>,
        split: &ThinkingSplit,
        tool: &str,
        error: &str,
        manager: &mut MultiToolManager,
    ) {
        let assistant_text = if split.content.is_empty() {
            format!("(calling tool {tool})")
        } else {
            split.content.clone()
        };
        msgs.push(ChatMessage::assistant(assistant_text));
        msgs.push(ChatMessage::user(format!("Tool {tool} failed: {error}")));
        manager.record(ToolCallRecord {
            tool: tool.to_string(),
            params: serde_json::Value::Null,
            success: false,
            result: None,
            timestamp: Utc::now(),
        });
    }

    async fn persist_final(
        &self,
        request: &ChatTurnRequest,
        split: &ThinkingSplit,
        sources: &[Source],
        usage: Option<TokenUsage>,
    ) -> bool {
        let mut message = StoredMessage::new(
            &request.conversation_id,
            &request.user_id,
            ChatRole::Assistant,
            &split.content,
        );
        message.id = request.assistant_message_id.clone();
        message.thinking = split.thinking.clone();
        message.sources = sources.to_vec();
        message.token_usage = usage;
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
                        sources,
                    )
                    .await
                {
                    tracing::warn!("progress completion failed: {}", e);
                }
                true
            }
            Err(e) => {
                tracing::error!("assistant message persist failed: {}", e);
                false
            }
        }
    }

    /// Saves whatever accumulated before a failure or disconnect, so the UI
    /// can recover it. No-op when nothing accumulated.
    async fn persist_partial(
        &self,
        request: &ChatTurnRequest,
        split: &ThinkingSplit,
        sources: &[Source],
        error: &str,
    ) -> bool {
        if let Err(e) = self.progress.mark_error(&request.assistant_message_id, error).await {
            tracing::warn!("progress error mark failed: {}", e);
        }
        if split.content.is_empty() && split.thinking.is_none() {
            return false;
        }
        let mut message = StoredMessage::new(
            &request.conversation_id,
            &request.user_id,
            ChatRole::Assistant,
            &split.content,
        );
        message.id = request.assistant_message_id.clone();
        message.thinking = split.thinking.clone();
        message.sources = sources.to_vec();
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
                true
            }
            Err(e) => {
                tracing::error!("partial message persist failed: {}", e);
                false
            }
        }
    }
}
