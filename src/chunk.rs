//! Boundary-aware text chunker with overlap.
//!
//! Splits one message's text into windows of at most `max_tokens` tokens,
//! converted to a byte budget with a constant 4 bytes/token ratio. Bytes are
//! never fewer than characters, so the budget is conservative for non-ASCII
//! text.
//!
//! # Algorithm
//!
//! 1. Trim the input. Empty text yields no chunks; text within budget yields
//!    exactly one.
//! 2. Take a window of `max_chars` bytes from the current start.
//! 3. Pick the last break point in the window, trying in order: paragraph
//!    (`\n\n`), fenced code block edge, line, sentence, word, and finally a
//!    hard cut at the window end. A break point inside the first 30% of the
//!    window is rejected and the next tier is tried.
//! 4. Emit the trimmed window up to the break.
//! 5. Rewind the next start by `overlap_tokens` from the break, snapped
//!    forward to a word start, and never at or before the current start.

/// Approximate bytes-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Break points must land past this share of the window (in percent).
const MIN_BREAK_PERCENT: usize = 30;

const FENCE: &str = "```";

/// Split `text` into overlapping chunks.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;

    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let remaining = &text[start..];
        if remaining.len() <= max_chars {
            push_trimmed(&mut chunks, remaining);
            break;
        }

        let mut window_end = floor_char_boundary(text, start + max_chars);
        if window_end <= start {
            // Budget smaller than one character.
            window_end = ceil_char_boundary(text, start + 1);
        }
        let window = &text[start..window_end];
        let end = start + find_break(window);
        push_trimmed(&mut chunks, &text[start..end]);

        start = next_start(text, start, end, overlap_chars);
    }

    chunks
}

/// Where the window following `[start, end)` begins.
fn next_start(text: &str, start: usize, end: usize, overlap_chars: usize) -> usize {
    if overlap_chars == 0 {
        return end;
    }
    let rewound = floor_char_boundary(text, end.saturating_sub(overlap_chars));
    if rewound <= start {
        return end;
    }
    // Avoid starting the overlap mid-word.
    let at_word_start = text[..rewound]
        .chars()
        .next_back()
        .map_or(true, char::is_whitespace);
    if at_word_start {
        return rewound;
    }
    match text[rewound..end].find(char::is_whitespace) {
        Some(pos) => {
            let ws = rewound + pos;
            let after = ws + text[ws..].chars().next().map_or(1, char::len_utf8);
            if after < end {
                after
            } else {
                rewound
            }
        }
        None => rewound,
    }
}

/// Byte offset (relative to `window`) at which to end the current chunk.
fn find_break(window: &str) -> usize {
    let min = window.len() * MIN_BREAK_PERCENT / 100;
    let accept = |pos: usize| pos > 0 && pos >= min;

    if let Some(p) = window.rfind("\n\n") {
        if accept(p) {
            return p + 2;
        }
    }

    if let Some(p) = fence_break(window, min) {
        return p;
    }

    if let Some(p) = window.rfind('\n') {
        if accept(p) {
            return p + 1;
        }
    }

    let sentence_end = [". ", "! ", "? ", ".\t"]
        .iter()
        .filter_map(|sep| window.rfind(sep).map(|p| p + 1))
        .max();
    if let Some(p) = sentence_end {
        if accept(p) {
            return p;
        }
    }

    if let Some(p) = window.rfind(char::is_whitespace) {
        if accept(p) {
            return p;
        }
    }

    window.len()
}

/// Break before an opening fence or after a closing fence line, whichever
/// is the last acceptable one in the window.
fn fence_break(window: &str, min: usize) -> Option<usize> {
    let fences: Vec<usize> = window
        .match_indices(FENCE)
        .map(|(i, _)| i)
        .filter(|&i| i == 0 || window.as_bytes()[i - 1] == b'\n')
        .collect();

    for (k, &pos) in fences.iter().enumerate().rev() {
        let line_end = window[pos..].find('\n').map(|e| pos + e + 1);
        let has_lang_tag = {
            let rest = &window[pos + FENCE.len()..line_end.unwrap_or(window.len())];
            !rest.trim().is_empty()
        };
        let closing = k % 2 == 1 && !has_lang_tag;

        let candidate = if closing { line_end } else { Some(pos) };
        if let Some(c) = candidate {
            if c > 0 && c >= min {
                return Some(c);
            }
        }
    }
    None
}

fn push_trimmed(chunks: &mut Vec<String>, piece: &str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        chunks.push(piece.to_string());
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx.min(s.len())
}
