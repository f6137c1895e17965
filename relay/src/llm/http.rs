//! Shared streaming transport for OpenAI-compatible chat-completions APIs.

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::sse::{data_payload, LineBuffer, ToolCallAccumulator};
use super::{FinishReason, LlmError, ProviderOutcome};
use crate::message::TokenUsage;

/// POSTs `body` to `url` and consumes the SSE response into one outcome.
///
/// Content deltas are forwarded to `delta_tx` as they arrive; fragmented
/// `delta.tool_calls` entries are assembled. Lines that are not `data:`
/// frames and the `[DONE]` terminator are ignored; one malformed JSON frame
/// is logged and skipped rather than failing the stream.
pub(crate) async fn stream_chat_completions(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: Value,
    delta_tx: Option<mpsc::Sender<String>>,
) -> Result<ProviderOutcome, LlmError> {
    let mut request = client.post(url).json(&body);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    let response = request
        .send()
        .await
        .map_err(|e| LlmError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Provider {
            status: status.as_u16(),
            body,
        });
    }

    let mut stream = response.bytes_stream();
    let mut lines = LineBuffer::new();
    let mut content = String::new();
    let mut calls = ToolCallAccumulator::new();
    let mut finish_reason = FinishReason::Stop;
    let mut usage = None;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| LlmError::Transport(e.to_string()))?;
        for line in lines.push(&chunk) {
            let Some(payload) = data_payload(&line) else {
                continue;
            };
            let frame: Value = match serde_json::from_str(payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("skipping malformed stream frame: {}", e);
                    continue;
                }
            };
            apply_frame(
                &frame,
                &mut content,
                &mut calls,
                &mut finish_reason,
                &mut usage,
                delta_tx.as_ref(),
            )
            .await;
        }
    }

    let tool_calls = calls.finish();
    if !tool_calls.is_empty() && finish_reason == FinishReason::Stop {
        finish_reason = FinishReason::ToolCalls;
    }
    Ok(ProviderOutcome {
        content,
        tool_calls,
        finish_reason,
        usage,
    })
}

async fn apply_frame(
    frame: &Value,
    content: &mut String,
    calls: &mut ToolCallAccumulator,
    finish_reason: &mut FinishReason,
    usage: &mut Option<TokenUsage>,
    delta_tx: Option<&mpsc::Sender<String>>,
) {
    if let Some(u) = frame.get("usage").filter(|u| !u.is_null()) {
        *usage = Some(TokenUsage {
            prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
            completion_tokens: u
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        });
    }
    let Some(choice) = frame
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        return;
    };
    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        *finish_reason = FinishReason::parse(reason);
    }
    let Some(delta) = choice.get("delta") else {
        return;
    };
    if let Some(tool_deltas) = delta.get("tool_calls").and_then(Value::as_array) {
        calls.push(tool_deltas);
    }
    if let Some(text) = delta.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            content.push_str(text);
            if let Some(tx) = delta_tx {
                let _ = tx.send(text.to_string()).await;
            }
        }
    }
}

/// Builds the chat-completions request body shared by both providers.
pub(crate) fn completions_body(
    model: &str,
    messages: &[crate::message::ChatMessage],
    tools: &[Value],
) -> Value {
    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.to_vec());
    }
    body
}
