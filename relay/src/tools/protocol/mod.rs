//! Protocol adapters: normalize provider-native tool-call shapes.
//!
//! Each provider streams tool calls in its own shape; an adapter declares
//! `can_handle`, parses the raw value into a normalized call, and formats a
//! tool result back into text (plus sources) for the follow-up message. New
//! providers register new adapters without touching the streaming loop.

mod ollama;
pub mod repair;
mod volcano;

pub use ollama::OllamaAdapter;
pub use repair::parse_lenient;
pub use volcano::VolcanoAdapter;

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::ToolResult;
use crate::message::Source;

/// A normalized tool invocation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedToolCall {
    pub tool: String,
    pub params: Value,
}

/// Tool result rendered for the follow-up user message.
#[derive(Clone, Debug, Default)]
pub struct FormattedResult {
    pub text: String,
    pub sources: Vec<Source>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("unrecognized tool call shape")]
    Unrecognized,
    #[error("tool call missing name")]
    MissingName,
    #[error("unparseable tool arguments: {0}")]
    BadArguments(String),
}

/// One provider's tool-call dialect.
pub trait ProtocolAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn can_handle(&self, raw: &Value) -> bool;
    fn parse(&self, raw: &Value) -> Result<ParsedToolCall, AdapterError>;

    /// Renders an executed result as text for the LLM, extracting sources
    /// when the data carries search hits.
    fn format_result(&self, tool: &str, result: &ToolResult) -> FormattedResult {
        format_generic(tool, result)
    }
}

/// Ordered adapter registry; first `can_handle` wins.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn ProtocolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both built-in adapters, volcano first (it also accepts the
    /// OpenAI-compatible shape).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(VolcanoAdapter));
        registry.register(Arc::new(OllamaAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        self.adapters.push(adapter);
    }

    pub fn find(&self, raw: &Value) -> Option<Arc<dyn ProtocolAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.can_handle(raw))
            .map(Arc::clone)
    }
}

static INLINE_TOOL_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").expect("static regex"));

/// Extracts `<tool_call>{...}</tool_call>` blocks from assistant text.
///
/// Returns the text with the blocks removed and the raw JSON values found.
/// Unparseable blocks are dropped (the text keeps flowing).
pub fn extract_inline_tool_calls(text: &str) -> (String, Vec<Value>) {
    let mut calls = Vec::new();
    let cleaned = INLINE_TOOL_CALL.replace_all(text, |caps: &regex::Captures<'_>| {
        if let Some(v) = parse_lenient(&caps[1]) {
            calls.push(v);
        } else {
            tracing::warn!("dropping unparseable inline tool call");
        }
        String::new()
    });
    (cleaned.trim().to_string(), calls)
}

/// Shared result rendering: search-shaped data becomes a numbered list with
/// sources; anything else is compact JSON or the failure message.
pub(crate) fn format_generic(tool: &str, result: &ToolResult) -> FormattedResult {
    if !result.success {
        let reason = result
            .error
            .as_deref()
            .or(result.message.as_deref())
            .unwrap_or("unknown error");
        return FormattedResult {
            text: format!("Tool {tool} failed: {reason}"),
            sources: vec![],
        };
    }

    if let Some(results) = result.data.get("results").and_then(Value::as_array) {
        let mut text = String::new();
        let mut sources = Vec::new();
        for (i, item) in results.iter().enumerate() {
            let title = item
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("(untitled)");
            let url = item.get("url").and_then(Value::as_str).unwrap_or("");
            let snippet = item
                .get("content")
                .or_else(|| item.get("snippet"))
                .and_then(Value::as_str)
                .unwrap_or("");
            text.push_str(&format!("[{}] {}\n", i + 1, title));
            if !url.is_empty() {
                text.push_str(&format!("    {url}\n"));
                sources.push(Source {
                    title: title.to_string(),
                    url: url.to_string(),
                });
            }
            if !snippet.is_empty() {
                text.push_str(&format!("    {}\n", snippet.replace('\n', " ")));
            }
        }
        if text.is_empty() {
            text = "No results.".to_string();
        }
        return FormattedResult { text, sources };
    }

    let text = match &result.data {
        Value::String(s) => s.clone(),
        Value::Null => result.message.clone().unwrap_or_else(|| "OK".to_string()),
        other => serde_json::to_string(other).unwrap_or_else(|_| "OK".to_string()),
    };
    FormattedResult {
        text,
        sources: vec![],
    }
}

/// Parses arguments that may arrive as a JSON string or an object.
pub(crate) fn arguments_value(raw: &Value) -> Result<Value, AdapterError> {
    match raw {
        Value::String(s) if s.trim().is_empty() => Ok(Value::Object(Default::default())),
        Value::String(s) => {
            parse_lenient(s).ok_or_else(|| AdapterError::BadArguments(s.clone()))
        }
        Value::Null => Ok(Value::Object(Default::default())),
        other => Ok(other.clone()),
    }
}
