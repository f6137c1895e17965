//! Structural splitter for long documents.
//!
//! Paragraph boundaries are blank lines; list blocks stay together; an
//! oversize paragraph is hard-split at sentence terminators and, failing
//! that, by character count. Each chunk after the first carries a sliding
//! overlap from its predecessor, and the chunk count is capped with the
//! remainder folded into the last chunk.

/// Splitter knobs (defaults per the long-text pipeline).
#[derive(Clone, Debug)]
pub struct SplitConfig {
    pub max_chunk_size: usize,
    pub target_chunk_size: usize,
    pub overlap: usize,
    pub max_chunks: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 8000,
            target_chunk_size: 6000,
            overlap: 300,
            max_chunks: 30,
        }
    }
}

/// One chunk; `overlap_len` chars at the front repeat the previous chunk's
/// tail.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub overlap_len: usize,
}

const SENTENCE_ENDS: &[char] = &['。', '！', '？', '；', '.', '!', '?', ';'];

fn is_list_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed
        .strip_prefix('-')
        .or_else(|| trimmed.strip_prefix('*'))
        .or_else(|| trimmed.strip_prefix('•'))
    {
        return rest.starts_with(' ') || rest.is_empty();
    }
    // Ordered lists: "1. " / "12. " / "a. "
    let mut chars = trimmed.chars();
    let mut saw_digit = false;
    for c in chars.by_ref() {
        if c.is_ascii_digit() {
            saw_digit = true;
            continue;
        }
        if c == '.' {
            return saw_digit || is_single_letter_marker(trimmed);
        }
        break;
    }
    is_single_letter_marker(trimmed)
}

fn is_single_letter_marker(trimmed: &str) -> bool {
    let mut chars = trimmed.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(c), Some('.')) if c.is_ascii_alphabetic()
    )
}

fn is_list_block(block: &str) -> bool {
    let lines: Vec<&str> = block.lines().filter(|l| !l.trim().is_empty()).collect();
    !lines.is_empty() && lines.iter().all(|l| is_list_line(l))
}

/// Blank-line paragraphs, with consecutive list paragraphs merged.
fn blocks(text: &str) -> Vec<String> {
    let mut blocks: Vec<String> = Vec::new();
    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let merge = blocks
            .last()
            .is_some_and(|prev| is_list_block(prev) && is_list_block(paragraph));
        if merge {
            if let Some(prev) = blocks.last_mut() {
                prev.push('\n');
                prev.push_str(paragraph);
            }
        } else {
            blocks.push(paragraph.to_string());
        }
    }
    blocks
}

/// Splits one oversize block at sentence ends (targeting `target`), then by
/// raw character count for sentences that are themselves too long.
fn hard_split(block: &str, target: usize, max: usize) -> Vec<String> {
    let mut sentences: Vec<String> = Vec::new();
    let mut current = String::new();
    for c in block.chars() {
        current.push(c);
        if SENTENCE_ENDS.contains(&c) {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        sentences.push(current);
    }

    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();
    for sentence in sentences {
        if sentence.chars().count() > max {
            if !buf.is_empty() {
                pieces.push(std::mem::take(&mut buf));
            }
            let chars: Vec<char> = sentence.chars().collect();
            for slice in chars.chunks(target.max(1)) {
                pieces.push(slice.iter().collect());
            }
            continue;
        }
        if buf.chars().count() + sentence.chars().count() > target && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }
        buf.push_str(&sentence);
    }
    if !buf.is_empty() {
        pieces.push(buf);
    }
    pieces
}

fn char_suffix(s: &str, n: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    let start = chars.len().saturating_sub(n);
    chars[start..].iter().collect()
}

/// Splits `text` into paragraph-aligned chunks with sliding overlap.
pub fn split_structural(text: &str, config: &SplitConfig) -> Vec<Chunk> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");

    // Pack blocks (hard-splitting oversize ones) into target-size bodies.
    let mut bodies: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut push_piece = |piece: &str, current: &mut String, bodies: &mut Vec<String>| {
        let piece_len = piece.chars().count();
        if current.chars().count() + piece_len > config.target_chunk_size && !current.is_empty() {
            bodies.push(std::mem::take(current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(piece);
    };
    for block in blocks(&normalized) {
        if block.chars().count() > config.max_chunk_size {
            for piece in hard_split(&block, config.target_chunk_size, config.max_chunk_size) {
                push_piece(&piece, &mut current, &mut bodies);
            }
        } else {
            push_piece(&block, &mut current, &mut bodies);
        }
    }
    if !current.is_empty() {
        bodies.push(current);
    }

    // Cap the chunk count; the remainder joins the final chunk.
    if bodies.len() > config.max_chunks {
        let tail = bodies.split_off(config.max_chunks);
        if let Some(last) = bodies.last_mut() {
            for t in tail {
                last.push_str("\n\n");
                last.push_str(&t);
            }
        }
    }

    // Apply the sliding overlap.
    let mut chunks: Vec<Chunk> = Vec::new();
    for (index, body) in bodies.iter().enumerate() {
        let (text, overlap_len) = if index == 0 {
            (body.clone(), 0)
        } else {
            let overlap = char_suffix(&chunks[index - 1].text, config.overlap);
            let overlap_len = overlap.chars().count();
            (format!("{overlap}{body}"), overlap_len)
        };
        chunks.push(Chunk {
            index,
            text,
            overlap_len,
        });
    }
    chunks
}
