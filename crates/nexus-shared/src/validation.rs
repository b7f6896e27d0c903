//! Input normalization applied at persistence boundaries.

/// Stored title fields are clipped to this many characters.
pub const MAX_TITLE_LEN: usize = 254;

/// Fallback for absent titles.
pub const UNTITLED: &str = "Untitled";

/// Clip a title to [`MAX_TITLE_LEN`] characters; `None` becomes `"Untitled"`.
///
/// Clipping counts characters, not bytes, so a multi-byte title is never
/// split inside a code point.
pub fn clip_title(title: Option<&str>) -> String {
    match title {
        Some(t) => t.chars().take(MAX_TITLE_LEN).collect(),
        None => UNTITLED.to_string(),
    }
}

/// Validate a Redis key/channel segment: printable, no whitespace, bounded.
pub fn valid_key_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= 128
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_title_boundaries() {
        assert_eq!(clip_title(Some("")).len(), 0);
        assert_eq!(clip_title(Some(&"a".repeat(254))).len(), 254);
        assert_eq!(clip_title(Some(&"a".repeat(255))).len(), 254);
        assert_eq!(clip_title(Some(&"a".repeat(300))).len(), 254);
    }

    #[test]
    fn test_clip_title_none_is_untitled() {
        assert_eq!(clip_title(None), "Untitled");
    }

    #[test]
    fn test_clip_title_respects_char_boundaries() {
        let title = "é".repeat(300);
        let clipped = clip_title(Some(&title));
        assert_eq!(clipped.chars().count(), 254);
    }

    #[test]
    fn test_key_segment_validation() {
        assert!(valid_key_segment("nexus:tasks:high_priority"));
        assert!(valid_key_segment("worker-3"));
        assert!(!valid_key_segment(""));
        assert!(!valid_key_segment("has space"));
        assert!(!valid_key_segment("semi;colon"));
    }
}
