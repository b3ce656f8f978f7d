//! Error types for PatchScout.
//!
//! Library crates use [`PatchScoutError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Guard rejections, insufficient content, and save conflicts are outcomes,
//! not errors; they are modeled as values by the crates that produce them.

use std::path::PathBuf;

/// Top-level error type for all PatchScout operations.
#[derive(Debug, thiserror::Error)]
pub enum PatchScoutError {
    /// Configuration loading or validation error. Fatal at run start.
    #[error("config error: {message}")]
    Config { message: String },

    /// Outbound fetch failed: non-2xx status, transport error, or timeout.
    #[error("fetch failed for {url}: {reason}")]
    Fetch {
        url: String,
        reason: String,
        timeout: bool,
    },

    /// HTML parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// The relevance scoring capability failed.
    #[error("scoring error: {0}")]
    Scoring(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (unknown topic, malformed row, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PatchScoutError>;

impl PatchScoutError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a fetch error that is not a timeout.
    pub fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.into(),
            timeout: false,
        }
    }

    /// Create a fetch error for a request that exceeded its deadline.
    pub fn fetch_timeout(url: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: "request timed out".into(),
            timeout: true,
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a later pass may succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch { .. })
    }

    /// Short reason code used in structured logs and `errorMessage` columns.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Fetch { timeout: true, .. } => "fetch_timeout",
            Self::Fetch { .. } => "fetch_failed",
            Self::Parse { .. } => "parse",
            Self::Storage(_) => "storage",
            Self::Scoring(_) => "scoring",
            Self::Io { .. } => "io",
            Self::Validation { .. } => "validation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PatchScoutError::config("save threshold must be <= 100");
        assert_eq!(err.to_string(), "config error: save threshold must be <= 100");

        let err = PatchScoutError::fetch("https://example.com", "HTTP 503");
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn fetch_errors_are_transient() {
        assert!(PatchScoutError::fetch_timeout("https://slow.test").is_transient());
        assert!(!PatchScoutError::Storage("locked".into()).is_transient());
    }

    #[test]
    fn reason_codes_distinguish_timeouts() {
        assert_eq!(
            PatchScoutError::fetch_timeout("https://slow.test").reason_code(),
            "fetch_timeout"
        );
        assert_eq!(
            PatchScoutError::fetch("https://x.test", "HTTP 404").reason_code(),
            "fetch_failed"
        );
    }
}
