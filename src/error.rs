use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ScreenshotError {
    #[error("No url given")]
    EmptyUrl,

    #[error("No screenshot available for {0}")]
    NotFound(String),

    #[error("Screenshot generation failed: {0}")]
    GenerationFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ScreenshotError {
    /// HTTP status the boundary handler answers with.
    pub fn status_code(&self) -> u16 {
        if self.is_client_error() {
            404
        } else {
            500
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, ScreenshotError::EmptyUrl | ScreenshotError::NotFound(_))
    }

    /// Failures caused by the render step itself. These never populate the
    /// cache, so the next request for the same url retries.
    pub fn is_generation_failure(&self) -> bool {
        matches!(
            self,
            ScreenshotError::GenerationFailed(_) | ScreenshotError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for ScreenshotError {
    fn from(err: std::io::Error) -> Self {
        ScreenshotError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ScreenshotError {
    fn from(err: serde_json::Error) -> Self {
        ScreenshotError::Serialization(err.to_string())
    }
}
