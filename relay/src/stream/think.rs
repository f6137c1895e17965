//! `<think>…</think>` prefix extraction.
//!
//! Reasoning models prefix their output with a thinking block. The block is
//! carried to the client in a separate `thinking` field and never persisted
//! into user-visible content. Extraction works on the cumulative text, so a
//! still-open block (no closing tag yet) counts as all thinking.

const OPEN: &str = "<think>";
const CLOSE: &str = "</think>";

/// Split of one accumulated assistant text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThinkingSplit {
    /// User-visible content with the thinking block removed.
    pub content: String,
    pub thinking: Option<String>,
}

/// Splits a `<think>` prefix off the accumulated text.
pub fn split_thinking(text: &str) -> ThinkingSplit {
    let trimmed = text.trim_start();
    if !trimmed.starts_with(OPEN) {
        return ThinkingSplit {
            content: text.to_string(),
            thinking: None,
        };
    }
    let inner = &trimmed[OPEN.len()..];
    match inner.find(CLOSE) {
        Some(end) => ThinkingSplit {
            content: inner[end + CLOSE.len()..].trim_start().to_string(),
            thinking: Some(inner[..end].trim().to_string()),
        },
        // Streaming: the block is still open, everything so far is thinking.
        None => ThinkingSplit {
            content: String::new(),
            thinking: Some(inner.trim_start().to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_has_no_thinking() {
        let s = split_thinking("hello");
        assert_eq!(s.content, "hello");
        assert_eq!(s.thinking, None);
    }

    #[test]
    fn closed_block_is_extracted() {
        let s = split_thinking("<think>weigh the options</think>The answer is 4.");
        assert_eq!(s.content, "The answer is 4.");
        assert_eq!(s.thinking.as_deref(), Some("weigh the options"));
    }

    #[test]
    fn open_block_is_all_thinking() {
        let s = split_thinking("<think>still reason");
        assert_eq!(s.content, "");
        assert_eq!(s.thinking.as_deref(), Some("still reason"));
    }

    #[test]
    fn leading_whitespace_before_tag_is_tolerated() {
        let s = split_thinking("\n <think>a</think>b");
        assert_eq!(s.content, "b");
        assert_eq!(s.thinking.as_deref(), Some("a"));
    }

    #[test]
    fn tag_mid_text_is_not_a_prefix() {
        let s = split_thinking("answer <think>not a prefix</think>");
        assert_eq!(s.content, "answer <think>not a prefix</think>");
        assert_eq!(s.thinking, None);
    }
}
