//! Render script generation
//!
//! The renderer is driven by a small script produced from a fixed template.
//! The template is loaded once at startup and only ever has its two tokens
//! replaced. The url goes in verbatim: operators choose which urls get
//! rendered, so it is not escaped.

use crate::ScreenshotError;
use std::path::Path;

pub const URL_TOKEN: &str = "{{url-to-screenshot}}";
pub const OUTPUT_TOKEN: &str = "{{output-path}}";

const EMBEDDED_TEMPLATE: &str = include_str!("../resources/render-template.js");

#[derive(Debug, Clone)]
pub struct ScriptTemplate {
    source: String,
}

impl ScriptTemplate {
    pub fn embedded() -> Self {
        Self {
            source: EMBEDDED_TEMPLATE.to_string(),
        }
    }

    pub fn from_source(source: impl Into<String>) -> Result<Self, ScreenshotError> {
        let source = source.into();
        for token in [URL_TOKEN, OUTPUT_TOKEN] {
            if !source.contains(token) {
                return Err(ScreenshotError::Template(format!(
                    "template is missing the {token} placeholder"
                )));
            }
        }
        Ok(Self { source })
    }

    pub fn load(path: &Path) -> Result<Self, ScreenshotError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            ScreenshotError::Template(format!("could not read {}: {e}", path.display()))
        })?;
        Self::from_source(source)
    }

    /// Loads `path` when given, the embedded template otherwise.
    pub fn load_or_embedded(path: Option<&Path>) -> Result<Self, ScreenshotError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::embedded()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn build(&self, url: &str, output_path: &Path) -> String {
        build_script(&self.source, url, output_path)
    }
}

/// Substitute the url and output path into `template`.
///
/// Backslashes in the output path are doubled so Windows paths survive the
/// script's string literal.
pub fn build_script(template: &str, url: &str, output_path: &Path) -> String {
    let output = output_path.to_string_lossy().replace('\\', "\\\\");
    template
        .replace(URL_TOKEN, url)
        .replace(OUTPUT_TOKEN, &output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_script_substitutes_tokens() {
        let script = build_script(
            "open('{{url-to-screenshot}}') -> '{{output-path}}'",
            "https://example.com/?a=1",
            Path::new("/data/screenshots/httpsexamplecoma1.png"),
        );
        assert_eq!(
            script,
            "open('https://example.com/?a=1') -> '/data/screenshots/httpsexamplecoma1.png'"
        );
    }

    #[test]
    fn test_build_script_doubles_backslashes() {
        let script = build_script(
            "{{output-path}}",
            "http://x",
            Path::new(r"C:\data\screenshots\httpx.png"),
        );
        assert_eq!(script, r"C:\\data\\screenshots\\httpx.png");
    }

    #[test]
    fn test_url_is_not_escaped() {
        let script = build_script("'{{url-to-screenshot}}'", "http://x/';evil();'", Path::new("o.png"));
        assert_eq!(script, "'http://x/';evil();''");
    }

    #[test]
    fn test_embedded_template_has_both_tokens() {
        let template = ScriptTemplate::embedded();
        assert!(ScriptTemplate::from_source(template.source()).is_ok());

        let script = template.build("https://example.com/", Path::new("/tmp/out.png"));
        assert!(script.contains("var target = 'https://example.com/';"));
        assert!(script.contains("var output = '/tmp/out.png';"));
        assert!(!script.contains(URL_TOKEN));
        assert!(!script.contains(OUTPUT_TOKEN));
    }

    #[test]
    fn test_template_missing_token_is_rejected() {
        assert!(matches!(
            ScriptTemplate::from_source("var url = '{{url-to-screenshot}}';"),
            Err(ScreenshotError::Template(_))
        ));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = ScriptTemplate::load(Path::new("/definitely/not/here/template.js"));
        assert!(matches!(result, Err(ScreenshotError::Template(_))));
    }

    #[test]
    fn test_load_or_embedded_defaults() {
        let template = ScriptTemplate::load_or_embedded(None).unwrap();
        assert_eq!(template.source(), ScriptTemplate::embedded().source());
    }
}
