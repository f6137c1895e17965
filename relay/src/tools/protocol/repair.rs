//! Tolerant JSON parsing for model-produced text.
//!
//! Models emit almost-JSON: trailing commas, unbalanced braces at a stream
//! cutoff, bare identifier keys, markdown fences. [`parse_lenient`] tries the
//! strict parser first and then applies repairs. Unrepairable input yields
//! `None`; callers treat that as "contributes nothing".

use serde_json::Value;

/// Parses `input` as JSON, repairing common model mistakes.
pub fn parse_lenient(input: &str) -> Option<Value> {
    let trimmed = strip_fences(input.trim());
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    let candidate = extract_json_region(trimmed).unwrap_or(trimmed);
    if let Ok(v) = serde_json::from_str(candidate) {
        return Some(v);
    }
    let repaired = close_unbalanced(&strip_trailing_commas(&quote_bare_keys(candidate)));
    serde_json::from_str(&repaired).ok()
}

/// Drops a surrounding markdown code fence (``` or ```json).
fn strip_fences(s: &str) -> &str {
    let s = s.trim();
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\n', '\r']);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Finds the first `{`/`[` and returns the text from there to the last
/// matching-kind closer (or to the end, leaving balancing to the repairs).
fn extract_json_region(s: &str) -> Option<&str> {
    let start = s.find(['{', '['])?;
    let open = s.as_bytes()[start];
    let close = if open == b'{' { '}' } else { ']' };
    let end = s.rfind(close).filter(|e| *e > start).map(|e| e + 1);
    Some(match end {
        Some(e) => &s[start..e],
        None => &s[start..],
    })
}

/// Walks the input outside of string literals.
fn walk(s: &str, mut f: impl FnMut(usize, char, bool)) {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            f(i, c, true);
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => {
                in_string = !in_string;
            }
            _ => {}
        }
        f(i, c, in_string || c == '"');
    }
}

/// Quotes identifier-like keys: `{foo: 1}` → `{"foo": 1}`.
fn quote_bare_keys(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 16);
    let chars: Vec<char> = s.chars().collect();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        if (c == '{' || c == ',') && !in_string {
            out.push(c);
            i += 1;
            // Skip whitespace, then collect a bare identifier followed by ':'.
            let mut j = i;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            let ident_start = j;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            let mut k = j;
            while k < chars.len() && chars[k].is_whitespace() {
                k += 1;
            }
            if j > ident_start && k < chars.len() && chars[k] == ':' {
                out.extend(chars[i..ident_start].iter());
                out.push('"');
                out.extend(chars[ident_start..j].iter());
                out.push('"');
                i = j;
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Removes commas directly before a closer: `[1, 2,]` → `[1, 2]`.
fn strip_trailing_commas(s: &str) -> String {
    let mut comma_positions = Vec::new();
    let mut pending_comma: Option<usize> = None;
    walk(s, |i, c, in_string| {
        if in_string {
            pending_comma = None;
            return;
        }
        match c {
            ',' => pending_comma = Some(i),
            '}' | ']' => {
                if let Some(p) = pending_comma.take() {
                    comma_positions.push(p);
                }
            }
            c if c.is_whitespace() => {}
            _ => pending_comma = None,
        }
    });
    let mut out = String::with_capacity(s.len());
    for (i, c) in s.char_indices() {
        if !comma_positions.contains(&i) {
            out.push(c);
        }
    }
    out
}

/// Appends missing closers (and a closing quote) for truncated output.
fn close_unbalanced(s: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    let mut out = s.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    // A dangling comma before the appended closers would re-break the parse.
    while out.ends_with(',') {
        out.pop();
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_json_passes_through() {
        assert_eq!(
            parse_lenient(r#"{"a": 1, "b": [2, 3]}"#),
            Some(json!({ "a": 1, "b": [2, 3] }))
        );
    }

    #[test]
    fn trailing_commas_are_stripped() {
        assert_eq!(
            parse_lenient(r#"{"a": 1, "b": [2, 3,],}"#),
            Some(json!({ "a": 1, "b": [2, 3] }))
        );
    }

    #[test]
    fn bare_keys_are_quoted() {
        assert_eq!(
            parse_lenient(r#"{query: "rust", max_results: 5}"#),
            Some(json!({ "query": "rust", "max_results": 5 }))
        );
    }

    #[test]
    fn truncated_output_is_closed() {
        assert_eq!(
            parse_lenient(r#"{"goals": ["ship", "measure"#),
            Some(json!({ "goals": ["ship", "measure"] }))
        );
    }

    #[test]
    fn markdown_fences_are_removed() {
        assert_eq!(
            parse_lenient("```json\n{\"a\": 1}\n```"),
            Some(json!({ "a": 1 }))
        );
    }

    #[test]
    fn prose_around_the_object_is_ignored() {
        assert_eq!(
            parse_lenient("Here is the result: {\"a\": 1} hope it helps"),
            Some(json!({ "a": 1 }))
        );
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(parse_lenient("no json here at all"), None);
        assert_eq!(parse_lenient(""), None);
    }

    #[test]
    fn commas_inside_strings_survive() {
        assert_eq!(
            parse_lenient(r#"{"text": "a, b,]"}"#),
            Some(json!({ "text": "a, b,]" }))
        );
    }
}
