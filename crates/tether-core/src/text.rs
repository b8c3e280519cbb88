//! Char-boundary-safe text clipping.
//!
//! Tool input summaries and auto-generated conversation names clip
//! arbitrary user/agent text. `&str[..n]` panics when `n` lands inside a
//! multi-byte character, so these helpers snap to the nearest boundary.

/// Longest prefix of `s` that fits in `max_bytes` without splitting a char.
#[inline]
#[must_use]
pub fn clip(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Clip `s` to `max_bytes`, appending `...` when anything was cut.
///
/// The result is at most `max_bytes + 3` bytes; the original is returned
/// unchanged (no allocation beyond the copy) when it already fits.
#[must_use]
pub fn clip_ellipsis(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    format!("{}...", clip(s, max_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_string_untouched() {
        assert_eq!(clip("hello", 10), "hello");
        assert_eq!(clip("hello", 5), "hello");
    }

    #[test]
    fn ascii_clipped() {
        assert_eq!(clip("hello world", 5), "hello");
    }

    #[test]
    fn empty_and_zero() {
        assert_eq!(clip("", 4), "");
        assert_eq!(clip("abc", 0), "");
    }

    #[test]
    fn snaps_to_char_boundary() {
        // 'é' is two bytes (0xC3 0xA9); cutting at 4 lands inside it.
        let s = "café au lait";
        assert_eq!(clip(s, 4), "caf");
        assert_eq!(clip(s, 5), "café");
    }

    #[test]
    fn four_byte_emoji() {
        let s = "ok🦀go";
        assert_eq!(clip(s, 3), "ok");
        assert_eq!(clip(s, 5), "ok");
        assert_eq!(clip(s, 6), "ok🦀");
    }

    #[test]
    fn ellipsis_only_when_cut() {
        assert_eq!(clip_ellipsis("short", 80), "short");
        assert_eq!(clip_ellipsis("hello world", 5), "hello...");
    }

    #[test]
    fn ellipsis_multibyte() {
        assert_eq!(clip_ellipsis("naïveté forever", 6), "naïve...");
    }
}
