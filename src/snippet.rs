//! Snippet extraction and term highlighting.

use regex::{Captures, Regex, RegexBuilder};

/// Case-insensitive matcher over a set of literal query terms.
pub struct TermMatcher {
    regex: Regex,
}

impl TermMatcher {
    /// `None` when there are no non-empty terms.
    pub fn new<S: AsRef<str>>(terms: &[S]) -> Option<Self> {
        let mut terms: Vec<&str> = terms
            .iter()
            .map(|t| t.as_ref().trim())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return None;
        }
        // Longest first so a term never loses to its own prefix.
        terms.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        terms.dedup();

        let pattern = terms
            .iter()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join("|");
        RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .ok()
            .map(|regex| Self { regex })
    }

    /// Byte range of the earliest match.
    pub fn first_match(&self, text: &str) -> Option<(usize, usize)> {
        self.regex.find(text).map(|m| (m.start(), m.end()))
    }

    /// Wrap every match in `open`/`close`. Adjacent matches are wrapped
    /// separately.
    pub fn highlight(&self, text: &str, open: &str, close: &str) -> String {
        self.regex
            .replace_all(text, |caps: &Captures| format!("{}{}{}", open, &caps[0], close))
            .into_owned()
    }
}

/// Window of `radius` characters on either side of the earliest term match,
/// with `...` where the window is cut. Falls back to the first
/// `fallback_chars` characters when nothing matches.
pub fn make_snippet(
    content: &str,
    matcher: Option<&TermMatcher>,
    radius: usize,
    fallback_chars: usize,
) -> String {
    let Some((match_start, match_end)) = matcher.and_then(|m| m.first_match(content)) else {
        return prefix(content, fallback_chars);
    };

    let start = content[..match_start]
        .char_indices()
        .rev()
        .nth(radius.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let start = if radius == 0 { match_start } else { start };
    let end = content[match_end..]
        .char_indices()
        .nth(radius)
        .map(|(i, _)| match_end + i)
        .unwrap_or(content.len());

    let mut snippet = String::with_capacity(end - start + 6);
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.push_str(&content[start..end]);
    if end < content.len() {
        snippet.push_str("...");
    }
    snippet
}

fn prefix(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}
