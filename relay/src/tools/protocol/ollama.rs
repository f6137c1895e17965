//! Ollama-style tool calls: `tool_calls[]` entries with `function.name` and
//! object arguments, or in-text `<tool_call>{"name": ..., "args": ...}</tool_call>`
//! blocks (already extracted into raw values by the streaming loop).

use serde_json::Value;

use super::{arguments_value, AdapterError, ParsedToolCall, ProtocolAdapter};

pub struct OllamaAdapter;

impl ProtocolAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        "ollama"
    }

    fn can_handle(&self, raw: &Value) -> bool {
        raw.get("name").and_then(Value::as_str).is_some()
            || raw.pointer("/function/name").is_some()
    }

    fn parse(&self, raw: &Value) -> Result<ParsedToolCall, AdapterError> {
        // Structured tool_calls entry.
        if let Some(function) = raw.get("function") {
            let tool = function
                .get("name")
                .and_then(Value::as_str)
                .ok_or(AdapterError::MissingName)?
                .to_string();
            let params = match function.get("arguments") {
                Some(args) => arguments_value(args)?,
                None => Value::Object(Default::default()),
            };
            return Ok(ParsedToolCall { tool, params });
        }

        // Inline block: {"name": "...", "args": {...}} (also accepts
        // "arguments" as some templates emit that key).
        let tool = raw
            .get("name")
            .and_then(Value::as_str)
            .ok_or(AdapterError::Unrecognized)?
            .to_string();
        let params = match raw.get("args").or_else(|| raw.get("arguments")) {
            Some(args) => arguments_value(args)?,
            None => Value::Object(Default::default()),
        };
        Ok(ParsedToolCall { tool, params })
    }
}
