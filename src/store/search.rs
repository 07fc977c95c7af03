//! Snippet and relevance helpers for substring search.

/// Characters of context kept before the first match.
const LEAD: usize = 40;
/// Characters of context kept after the first match.
const TRAIL: usize = 80;
/// Snippet length when there is nothing to highlight.
const MAX_LEN: usize = 150;

/// Window of `text` around the first case-insensitive occurrence of `query`,
/// with the matched term wrapped in `**` and `...` marking truncation.
pub fn highlight_snippet(text: &str, query: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let needle: Vec<char> = query.chars().collect();
    if chars.is_empty() || needle.is_empty() {
        return take_chars(text, MAX_LEN);
    }

    let Some(idx) = find_ignore_case(&chars, &needle) else {
        return take_chars(text, MAX_LEN);
    };

    let start = idx.saturating_sub(LEAD);
    let end = (idx + needle.len() + TRAIL).min(chars.len());
    let match_end = idx + needle.len();

    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("...");
    }
    snippet.extend(&chars[start..idx]);
    snippet.push_str("**");
    snippet.extend(&chars[idx..match_end]);
    snippet.push_str("**");
    snippet.extend(&chars[match_end..end]);
    if end < chars.len() {
        snippet.push_str("...");
    }
    snippet
}

/// Naive relevance in `[0, 1]`: share of `text` covered by occurrences of `query`.
pub fn simple_score(text: &str, query: &str) -> f64 {
    if text.is_empty() || query.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let needle = query.to_lowercase();
    let count = haystack.matches(needle.as_str()).count();
    if count == 0 {
        return 0.0;
    }
    let text_len = text.chars().count().max(1) as f64;
    let covered = (count * query.chars().count()) as f64;
    (covered / text_len).min(1.0)
}

/// First `n` characters of `s`.
pub fn take_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn find_ignore_case(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| {
        haystack[i..i + needle.len()]
            .iter()
            .zip(needle)
            .all(|(a, b)| a.to_lowercase().eq(b.to_lowercase()))
    })
}
