//! Scripted LLM client for tests and offline runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{FinishReason, LlmClient, LlmError, ProviderOutcome, ProviderRequest};

/// One scripted turn: streamed in fixed-size pieces, then returned whole.
#[derive(Clone, Debug)]
pub struct MockTurn {
    pub content: String,
    pub tool_calls: Vec<Value>,
    pub finish_reason: FinishReason,
}

impl MockTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: vec![],
            finish_reason: FinishReason::Stop,
        }
    }

    /// A turn that requests one OpenAI-shaped tool call.
    pub fn tool_call(name: &str, arguments: Value) -> Self {
        Self {
            content: String::new(),
            tool_calls: vec![serde_json::json!({
                "id": format!("call_{name}"),
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": arguments.to_string(),
                },
            })],
            finish_reason: FinishReason::ToolCalls,
        }
    }
}

/// Plays back scripted turns in order; repeats the last one when exhausted.
pub struct MockLlm {
    turns: Mutex<VecDeque<MockTurn>>,
    /// Streaming piece size in characters.
    chunk_chars: usize,
    /// Pause between streamed pieces; zero by default.
    chunk_delay: Duration,
}

impl MockLlm {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            chunk_chars: 8,
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn with_chunking(mut self, chunk_chars: usize, chunk_delay: Duration) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self.chunk_delay = chunk_delay;
        self
    }

    fn next_turn(&self) -> MockTurn {
        let mut turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        if turns.len() > 1 {
            turns.pop_front().unwrap_or_else(|| MockTurn::text(""))
        } else {
            turns.front().cloned().unwrap_or_else(|| MockTurn::text(""))
        }
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream_chat(
        &self,
        _request: ProviderRequest,
        delta_tx: Option<mpsc::Sender<String>>,
    ) -> Result<ProviderOutcome, LlmError> {
        let turn = self.next_turn();
        if let Some(tx) = delta_tx {
            let chars: Vec<char> = turn.content.chars().collect();
            for piece in chars.chunks(self.chunk_chars) {
                let _ = tx.send(piece.iter().collect()).await;
                if !self.chunk_delay.is_zero() {
                    tokio::time::sleep(self.chunk_delay).await;
                }
            }
        }
        Ok(ProviderOutcome {
            content: turn.content,
            tool_calls: turn.tool_calls,
            finish_reason: turn.finish_reason,
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn streams_content_in_pieces_and_returns_whole() {
        let llm = MockLlm::new(vec![MockTurn::text("hello world")]).with_chunking(4, Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = llm
            .stream_chat(ProviderRequest::default(), Some(tx))
            .await
            .unwrap();
        assert_eq!(outcome.content, "hello world");
        let mut streamed = String::new();
        while let Ok(piece) = rx.try_recv() {
            streamed.push_str(&piece);
        }
        assert_eq!(streamed, "hello world");
    }

    #[tokio::test]
    async fn plays_turns_in_order_then_repeats_last() {
        let llm = MockLlm::new(vec![MockTurn::text("one"), MockTurn::text("two")]);
        let first = llm.stream_chat(ProviderRequest::default(), None).await.unwrap();
        let second = llm.stream_chat(ProviderRequest::default(), None).await.unwrap();
        let third = llm.stream_chat(ProviderRequest::default(), None).await.unwrap();
        assert_eq!(first.content, "one");
        assert_eq!(second.content, "two");
        assert_eq!(third.content, "two");
    }
}
