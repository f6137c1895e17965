//! Line-buffered parsing of provider SSE streams.
//!
//! Providers emit `data: <JSON>` lines terminated by `data: [DONE]`. Bytes
//! arrive in arbitrary chunk boundaries; [`LineBuffer`] reassembles lines,
//! [`data_payload`] filters the frames, and [`ToolCallAccumulator`] merges
//! fragmented `delta.tool_calls[]` entries into complete calls.

use serde_json::Value;

/// Reassembles `\n`-terminated lines from an arbitrary byte chunking.
#[derive(Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every complete line it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(idx) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=idx).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// Whatever is left after the stream ended (a final unterminated line).
    pub fn finish(self) -> Option<String> {
        let rest = self.pending.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// Extracts the JSON payload of one SSE line.
///
/// Returns `None` for lines that are not `data:`-prefixed (comments, blank
/// keep-alives, `event:` fields) and for the `[DONE]` terminator.
pub fn data_payload(line: &str) -> Option<&str> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    Some(payload)
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Merges OpenAI-style streamed tool-call fragments, keyed by `index`.
///
/// A provider streams `{index, id?, function: {name?, arguments: "...part"}}`
/// fragments; arguments concatenate across deltas. [`finish`] yields the
/// completed calls in index order, in the provider's native raw shape.
#[derive(Default)]
pub struct ToolCallAccumulator {
    calls: Vec<PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one `delta.tool_calls` array.
    pub fn push(&mut self, deltas: &[Value]) {
        for delta in deltas {
            let index = delta
                .get("index")
                .and_then(Value::as_u64)
                .unwrap_or(self.calls.len().saturating_sub(1).max(0) as u64)
                as usize;
            while self.calls.len() <= index {
                self.calls.push(PartialCall::default());
            }
            let call = &mut self.calls[index];
            if let Some(id) = delta.get("id").and_then(Value::as_str) {
                call.id = Some(id.to_string());
            }
            if let Some(function) = delta.get("function") {
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    call.name = Some(name.to_string());
                }
                if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                    call.arguments.push_str(args);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Returns the assembled calls; fragments that never received a function
    /// name are dropped.
    pub fn finish(self) -> Vec<Value> {
        self.calls
            .into_iter()
            .filter_map(|c| {
                let name = c.name?;
                Some(serde_json::json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": name, "arguments": c.arguments },
                }))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_handles_split_lines() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        let lines = buf.push(b": 1}\ndata: next");
        assert_eq!(lines, vec!["data: {\"a\": 1}".to_string()]);
        assert_eq!(buf.finish().as_deref(), Some("data: next"));
    }

    #[test]
    fn line_buffer_strips_carriage_returns() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"data: x\r\n\r\n");
        assert_eq!(lines, vec!["data: x".to_string(), "".to_string()]);
    }

    #[test]
    fn data_payload_filters_non_data_and_done() {
        assert_eq!(data_payload("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(data_payload("data: [DONE]"), None);
        assert_eq!(data_payload(": keep-alive"), None);
        assert_eq!(data_payload("event: ping"), None);
        assert_eq!(data_payload(""), None);
    }

    #[test]
    fn accumulator_merges_argument_fragments() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&[serde_json::json!({
            "index": 0,
            "id": "call_1",
            "function": { "name": "web_search", "arguments": "{\"que" }
        })]);
        acc.push(&[serde_json::json!({
            "index": 0,
            "function": { "arguments": "ry\": \"rust\"}" }
        })]);
        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["function"]["name"], "web_search");
        assert_eq!(calls[0]["function"]["arguments"], "{\"query\": \"rust\"}");
        assert_eq!(calls[0]["id"], "call_1");
    }

    #[test]
    fn accumulator_keeps_parallel_calls_in_index_order() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&[
            serde_json::json!({ "index": 0, "function": { "name": "a", "arguments": "{}" } }),
            serde_json::json!({ "index": 1, "function": { "name": "b", "arguments": "{}" } }),
        ]);
        let calls = acc.finish();
        assert_eq!(calls[0]["function"]["name"], "a");
        assert_eq!(calls[1]["function"]["name"], "b");
    }

    #[test]
    fn accumulator_drops_nameless_fragments() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&[serde_json::json!({ "index": 0, "function": { "arguments": "{}" } })]);
        assert!(acc.finish().is_empty());
    }
}
