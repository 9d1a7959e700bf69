//! YouTube URL validation and normalization.
//!
//! Accepts the common URL shapes (standard watch URLs, youtu.be short links,
//! embed URLs, and mobile URLs) and extracts the 11-character video id.

use once_cell::sync::Lazy;
use regex::Regex;

static URL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^(?:https?://)?(?:www\.)?youtube\.com/watch\?v=([A-Za-z0-9_-]{11})",
        r"^(?:https?://)?(?:www\.)?youtu\.be/([A-Za-z0-9_-]{11})",
        r"^(?:https?://)?(?:www\.)?youtube\.com/embed/([A-Za-z0-9_-]{11})",
        r"^(?:https?://)?m\.youtube\.com/watch\?v=([A-Za-z0-9_-]{11})",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("hardcoded pattern is valid"))
    .collect()
});

/// Check whether a string is a supported YouTube video URL
pub fn is_valid_url(url: &str) -> bool {
    let url = url.trim();
    !url.is_empty() && URL_PATTERNS.iter().any(|re| re.is_match(url))
}

/// Extract the 11-character video id from a supported YouTube URL
pub fn extract_video_id(url: &str) -> Option<String> {
    let url = url.trim();
    URL_PATTERNS
        .iter()
        .find_map(|re| re.captures(url))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Normalize any supported URL shape to the canonical watch URL.
///
/// Unrecognized input is returned unchanged so callers can still hand it to
/// yt-dlp for a proper error message.
pub fn normalize_url(url: &str) -> String {
    match extract_video_id(url) {
        Some(id) => format!("https://www.youtube.com/watch?v={}", id),
        None => url.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_standard_watch_url() {
        assert!(is_valid_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_valid_url("http://youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_valid_url("youtube.com/watch?v=dQw4w9WgXcQ"));
    }

    #[test]
    fn test_accepts_short_embed_and_mobile_urls() {
        assert!(is_valid_url("https://youtu.be/dQw4w9WgXcQ"));
        assert!(is_valid_url("https://www.youtube.com/embed/dQw4w9WgXcQ"));
        assert!(is_valid_url("https://m.youtube.com/watch?v=dQw4w9WgXcQ"));
    }

    #[test]
    fn test_rejects_non_youtube_urls() {
        assert!(!is_valid_url("https://vimeo.com/12345"));
        assert!(!is_valid_url("https://www.youtube.com/playlist?list=PL123"));
        assert!(!is_valid_url("not a url"));
        assert!(!is_valid_url(""));
    }

    #[test]
    fn test_rejects_malformed_video_ids() {
        // too short
        assert!(!is_valid_url("https://www.youtube.com/watch?v=short"));
        // invalid character inside the id position
        assert!(!is_valid_url("https://youtu.be/dQw4w9Wg!cQ"));
    }

    #[test]
    fn test_extract_video_id() {
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(
            extract_video_id("https://youtu.be/abc123DEF-_"),
            Some("abc123DEF-_".to_string())
        );
        assert_eq!(extract_video_id("https://example.com"), None);
    }

    #[test]
    fn test_normalize_url_produces_watch_form() {
        let canonical = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
        assert_eq!(normalize_url("https://youtu.be/dQw4w9WgXcQ"), canonical);
        assert_eq!(
            normalize_url("https://m.youtube.com/watch?v=dQw4w9WgXcQ&t=42"),
            canonical
        );
        assert_eq!(normalize_url(canonical), canonical);
    }

    #[test]
    fn test_normalize_url_passes_through_unrecognized() {
        assert_eq!(normalize_url("https://example.com"), "https://example.com");
    }
}
