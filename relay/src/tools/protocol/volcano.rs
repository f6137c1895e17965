//! Volcengine-style tool calls: OpenAI-compatible `function.name/arguments`
//! plus the legacy in-house `{tool, query, options}` shape.

use serde_json::Value;

use super::{arguments_value, AdapterError, ParsedToolCall, ProtocolAdapter};

pub struct VolcanoAdapter;

impl ProtocolAdapter for VolcanoAdapter {
    fn name(&self) -> &str {
        "volcano"
    }

    fn can_handle(&self, raw: &Value) -> bool {
        raw.pointer("/function/name").is_some()
            || raw.get("tool").and_then(Value::as_str).is_some()
    }

    fn parse(&self, raw: &Value) -> Result<ParsedToolCall, AdapterError> {
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

        // Legacy: {"tool": "...", "query": "...", "options": {...}}
        let tool = raw
            .get("tool")
            .and_then(Value::as_str)
            .ok_or(AdapterError::Unrecognized)?
            .to_string();
        let mut params = serde_json::Map::new();
        if let Some(query) = raw.get("query") {
            params.insert("query".to_string(), query.clone());
        }
        if let Some(options) = raw.get("options").and_then(Value::as_object) {
            for (k, v) in options {
                params.insert(k.clone(), v.clone());
            }
        }
        Ok(ParsedToolCall {
            tool,
            params: Value::Object(params),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_openai_shape_with_string_arguments() {
        let raw = json!({
            "id": "call_1",
            "function": { "name": "web_search", "arguments": "{\"query\": \"rust\"}" }
        });
        let call = VolcanoAdapter.parse(&raw).unwrap();
        assert_eq!(call.tool, "web_search");
        assert_eq!(call.params["query"], "rust");
    }

    #[test]
    fn parses_openai_shape_with_object_arguments() {
        let raw = json!({ "function": { "name": "t", "arguments": { "a": 1 } } });
        let call = VolcanoAdapter.parse(&raw).unwrap();
        assert_eq!(call.params["a"], 1);
    }

    #[test]
    fn repairs_sloppy_string_arguments() {
        let raw = json!({ "function": { "name": "t", "arguments": "{query: \"x\",}" } });
        let call = VolcanoAdapter.parse(&raw).unwrap();
        assert_eq!(call.params["query"], "x");
    }

    #[test]
    fn parses_legacy_shape_merging_options() {
        let raw = json!({ "tool": "web_search", "query": "rust", "options": { "depth": 2 } });
        let call = VolcanoAdapter.parse(&raw).unwrap();
        assert_eq!(call.tool, "web_search");
        assert_eq!(call.params, json!({ "query": "rust", "depth": 2 }));
    }

    #[test]
    fn rejects_unknown_shape() {
        assert!(!VolcanoAdapter.can_handle(&json!({ "other": 1 })));
        assert!(VolcanoAdapter.parse(&json!({ "other": 1 })).is_err());
    }
}
