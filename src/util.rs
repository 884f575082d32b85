/// Truncate a string to `max` characters, appending "…" if truncated.
/// Counts chars, not bytes, so multi-byte text is cut on a boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{truncated}…")
    }
}

/// Rough token estimate: ~4 bytes per token for Latin-ish text.
/// Good enough for backlog accounting; never used for billing.
pub fn estimate_tokens(text: &str) -> usize {
    let t = text.len() as f64 / 4.0;
    t.ceil().max(1.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_no_truncate() {
        assert_eq!(truncate_chars("hello", 10), "hello");
    }

    #[test]
    fn ascii_truncate() {
        assert_eq!(truncate_chars("hello world", 5), "hello…");
    }

    #[test]
    fn multibyte_truncate() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo…");
    }

    #[test]
    fn empty_string() {
        assert_eq!(truncate_chars("", 5), "");
    }

    #[test]
    fn token_estimate_floor() {
        assert_eq!(estimate_tokens("hi"), 1);
        assert_eq!(estimate_tokens("twelve chars"), 3);
    }
}
