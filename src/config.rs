//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration structure for the screenshot cache,
//! plus the request and response types passed across the HTTP boundary.

use crate::ScreenshotError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the screenshot cache
///
/// Controls where screenshots are stored, which renderer binary produces
/// them, how long a render may take and how the HTTP server is exposed.
///
/// # Examples
///
/// ```rust
/// use page_snapshot::Config;
/// use std::time::Duration;
///
/// let config = Config {
///     renderer_path: Some("/usr/local/bin/phantomjs".into()),
///     render_timeout: Duration::from_secs(20),
///     ..Default::default()
/// };
/// assert!(config.screenshot_dir().ends_with("screenshots"));
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Root data directory (default: `target/data`)
    ///
    /// Screenshots are kept in its `screenshots` subdirectory.
    pub data_dir: PathBuf,

    /// Path to the headless renderer executable (default: none)
    ///
    /// When unset, or when it does not point at a regular file, the
    /// screenshot route is left out of the server entirely.
    pub renderer_path: Option<PathBuf>,

    /// Flags passed to the renderer before the script path
    pub renderer_args: Vec<String>,

    /// Wall-clock bound for a single render (default: 45 seconds)
    ///
    /// The renderer process is killed once this elapses.
    pub render_timeout: Duration,

    /// `max-age` advertised for cached screenshots (default: 8 hours)
    pub cache_max_age: Duration,

    /// Optional replacement for the embedded render script template
    pub template_path: Option<PathBuf>,

    /// How concurrent generations are serialized (default: per key)
    pub lock_strategy: LockStrategy,

    /// HTTP port (default: 8081)
    pub port: u16,

    /// HTTP bind address (default: 0.0.0.0)
    pub bind: String,

    /// Every route is mounted under `/<app_name>` (default: app-runner-home)
    pub app_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("target/data"),
            renderer_path: None,
            renderer_args: vec!["--ignore-ssl-errors=yes".to_string()],
            render_timeout: Duration::from_secs(45),
            cache_max_age: Duration::from_secs(8 * 60 * 60),
            template_path: None,
            lock_strategy: LockStrategy::default(),
            port: 8081,
            bind: "0.0.0.0".to_string(),
            app_name: "app-runner-home".to_string(),
        }
    }
}

impl Config {
    pub fn screenshot_dir(&self) -> PathBuf {
        self.data_dir.join("screenshots")
    }

    pub fn context_path(&self) -> String {
        format!("/{}", self.app_name)
    }

    pub fn validate(&self) -> Result<(), ScreenshotError> {
        if self.render_timeout.is_zero() {
            return Err(ScreenshotError::Configuration(
                "Render timeout must be greater than 0".to_string(),
            ));
        }

        if self.app_name.is_empty() || self.app_name.contains('/') {
            return Err(ScreenshotError::Configuration(format!(
                "App name {:?} must be a single non-empty path segment",
                self.app_name
            )));
        }

        if self.renderer_args.iter().any(|arg| arg.is_empty()) {
            return Err(ScreenshotError::Configuration(
                "Renderer arguments must not be empty strings".to_string(),
            ));
        }

        Ok(())
    }
}

/// Serialization discipline for the check-then-generate section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    /// One lock per cache key: distinct urls render in parallel,
    /// identical urls collapse into one render
    #[default]
    PerKey,
    /// One lock for the whole cache: at most one render system-wide
    Global,
}

/// A request for a screenshot as it arrives at the HTTP boundary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenshotRequest {
    pub url: String,
    pub refresh: bool,
}

impl ScreenshotRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            refresh: false,
        }
    }

    /// Parse `url` and `refresh` out of a raw query string.
    ///
    /// Only the literal value `true` enables refresh. A missing or empty
    /// `url` is rejected before anything touches the cache.
    pub fn from_query(query: &str) -> Result<Self, ScreenshotError> {
        let mut request = Self::default();
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "url" if request.url.is_empty() => request.url = value.into_owned(),
                "refresh" => request.refresh = value == "true",
                _ => {}
            }
        }

        if request.url.is_empty() {
            return Err(ScreenshotError::EmptyUrl);
        }
        Ok(request)
    }
}

/// A screenshot ready to be sent back to the caller
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub key: String,
    pub data: Vec<u8>,
    pub content_type: &'static str,
    pub cache_control: String,
    /// True when a render ran to produce this response
    pub generated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.render_timeout, Duration::from_secs(45));
        assert_eq!(config.cache_max_age, Duration::from_secs(28_800));
        assert_eq!(config.renderer_args, vec!["--ignore-ssl-errors=yes"]);
        assert_eq!(config.lock_strategy, LockStrategy::PerKey);
        assert_eq!(config.port, 8081);
        assert_eq!(config.context_path(), "/app-runner-home");
        assert_eq!(
            config.screenshot_dir(),
            PathBuf::from("target/data").join("screenshots")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let zero_timeout = Config {
            render_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());

        let nested_name = Config {
            app_name: "a/b".to_string(),
            ..Default::default()
        };
        assert!(nested_name.validate().is_err());

        let blank_arg = Config {
            renderer_args: vec![String::new()],
            ..Default::default()
        };
        assert!(blank_arg.validate().is_err());
    }

    #[test]
    fn test_partial_config_file_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "app_name": "home", "lock_strategy": "global" }"#).unwrap();
        assert_eq!(config.app_name, "home");
        assert_eq!(config.lock_strategy, LockStrategy::Global);
        assert_eq!(config.render_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_request_from_query() {
        let request =
            ScreenshotRequest::from_query("url=https%3A%2F%2Fexample.com%2F&refresh=true").unwrap();
        assert_eq!(request.url, "https://example.com/");
        assert!(request.refresh);

        let request = ScreenshotRequest::from_query("url=http://a.com&refresh=yes").unwrap();
        assert!(!request.refresh);

        assert!(matches!(
            ScreenshotRequest::from_query("refresh=true"),
            Err(ScreenshotError::EmptyUrl)
        ));
        assert!(matches!(
            ScreenshotRequest::from_query("url="),
            Err(ScreenshotError::EmptyUrl)
        ));
    }
}
