/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Safely returns a suffix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn suffix_chars(s: &str, max_chars: usize) -> &str {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s;
    }
    match s.char_indices().nth(char_count - max_chars) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Keeps the head of `s`, appending `...` when anything was cut.
pub fn truncate_end(s: &str, max_chars: usize) -> String {
    let head = prefix_chars(s, max_chars);
    if head.len() == s.len() {
        s.to_string()
    } else {
        format!("{}...", head)
    }
}

/// Keeps the tail of `s` within `width` characters, marking the cut with a leading `...`.
pub fn truncate_start(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let keep = width.saturating_sub(3);
    format!("...{}", suffix_chars(s, keep))
}
