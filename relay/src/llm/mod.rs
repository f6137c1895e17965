//! Upstream LLM client abstraction.
//!
//! The streaming handler depends on a client that streams assistant text
//! deltas and returns the completed turn (content, raw tool calls, finish
//! reason, usage). Implementations: [`ArkClient`] (Volcengine, OpenAI
//! compatible), [`OllamaClient`] (local, OpenAI-compatible endpoint), and
//! [`MockLlm`] for tests.
//!
//! Tool calls are returned in the provider's native raw shape; the protocol
//! adapters own normalization.

mod ark;
mod http;
mod mock;
mod ollama;
pub mod sse;

pub use ark::ArkClient;
pub use mock::{MockLlm, MockTurn};
pub use ollama::OllamaClient;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::message::{ChatMessage, TokenUsage};

/// Errors from one upstream completion call.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("malformed stream data: {0}")]
    Parse(String),
}

/// Why the provider stopped generating.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

impl FinishReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "stop" => FinishReason::Stop,
            "tool_calls" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// One request to an upstream provider.
#[derive(Clone, Debug, Default)]
pub struct ProviderRequest {
    pub messages: Vec<ChatMessage>,
    /// Function-calling schemas from the tool registry, provider-shaped.
    pub tools: Vec<Value>,
    /// Overrides the client's default model when set.
    pub model: Option<String>,
}

/// The completed turn after the provider stream ends.
#[derive(Clone, Debug)]
pub struct ProviderOutcome {
    /// Full assistant text for this turn.
    pub content: String,
    /// Raw tool calls in the provider's native shape, assembled from deltas.
    pub tool_calls: Vec<Value>,
    pub finish_reason: FinishReason,
    pub usage: Option<TokenUsage>,
}

/// Streaming chat client for one provider.
///
/// `delta_tx`, when present, receives assistant text deltas as they arrive;
/// the full turn is returned at the end either way. Dropping the returned
/// future aborts the underlying HTTP request.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Short provider name for logs and metrics.
    fn name(&self) -> &str;

    async fn stream_chat(
        &self,
        request: ProviderRequest,
        delta_tx: Option<mpsc::Sender<String>>,
    ) -> Result<ProviderOutcome, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_parses_known_values() {
        assert_eq!(FinishReason::parse("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(
            FinishReason::parse("content_filter"),
            FinishReason::Other("content_filter".to_string())
        );
    }
}
