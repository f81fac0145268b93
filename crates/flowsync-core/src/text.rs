//! Small string helpers for log output.

/// Truncate `s` to at most `max_bytes`, respecting char boundaries.
///
/// Used for payload previews in log fields so a large frame does not flood
/// the log.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strings_untouched() {
        assert_eq!(truncate_str("abc", 10), "abc");
        assert_eq!(truncate_str("", 0), "");
    }

    #[test]
    fn truncates_ascii() {
        assert_eq!(truncate_str("abcdef", 3), "abc");
    }

    #[test]
    fn respects_char_boundaries() {
        // "é" is two bytes
        assert_eq!(truncate_str("aé", 2), "a");
        assert_eq!(truncate_str("éé", 3), "é");
    }
}
