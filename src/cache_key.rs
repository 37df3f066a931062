//! Url to cache key mapping
//!
//! Keys are the url with every character outside `[A-Za-z0-9_]` removed.
//! The mapping is not injective: `https://a.com/b` and `https://a.co/mb`
//! share a key and therefore a cached image.

use std::path::{Path, PathBuf};

pub const SCREENSHOT_EXTENSION: &str = "png";

pub fn derive_key(url: &str) -> String {
    url.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Location of the cached image for `key` inside `cache_dir`.
pub fn screenshot_path(cache_dir: &Path, key: &str) -> PathBuf {
    cache_dir.join(format!("{key}.{SCREENSHOT_EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_strips_punctuation() {
        assert_eq!(derive_key("https://a.com/p?q=1"), "httpsacompq1");
        assert_eq!(derive_key("https://example.com/"), "httpsexamplecom");
        assert_eq!(derive_key("http://host/app_name"), "httphostapp_name");
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let url = "https://example.com/some/page?x=1&y=two#frag";
        assert_eq!(derive_key(url), derive_key(url));
    }

    #[test]
    fn test_derive_key_only_word_characters() {
        let key = derive_key("ftp://ünïcödé.example/ä b\\c\t%20~!@#$");
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert_eq!(key, "ftpncdexamplebc20");
    }

    #[test]
    fn test_derive_key_empty() {
        assert_eq!(derive_key(""), "");
        assert_eq!(derive_key("://?&="), "");
    }

    #[test]
    fn test_colliding_urls_share_a_key() {
        assert_eq!(derive_key("https://a.com/b"), derive_key("https://a.co/mb"));
    }

    #[test]
    fn test_screenshot_path() {
        let path = screenshot_path(Path::new("/data/screenshots"), "httpsexamplecom");
        assert_eq!(path, PathBuf::from("/data/screenshots/httpsexamplecom.png"));
    }
}
