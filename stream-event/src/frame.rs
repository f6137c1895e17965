//! SSE framing: `data: <JSON>\n\n` lines and heartbeat comments.

use crate::event::ChatEvent;

/// Serializes an event into one SSE data frame.
pub fn sse_frame(event: &ChatEvent) -> String {
    let json = serde_json::to_string(&event.to_value())
        .expect("event value serialization is infallible");
    format!("data: {json}\n\n")
}

/// An SSE comment line; keeps intermediaries from closing an idle stream.
pub fn heartbeat_frame() -> &'static str {
    ": heartbeat\n\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_data_prefixed_and_double_newline_terminated() {
        let f = sse_frame(&ChatEvent::Content {
            content: "hi".into(),
            thinking: None,
            sources: vec![],
        });
        assert!(f.starts_with("data: "));
        assert!(f.ends_with("\n\n"));
        let json: serde_json::Value =
            serde_json::from_str(f.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn heartbeat_is_a_comment_line() {
        assert!(heartbeat_frame().starts_with(':'));
        assert!(heartbeat_frame().ends_with("\n\n"));
    }
}
