// ABOUTME: Typed error hierarchy for the preview pipeline
// ABOUTME: Distinguishes format, network, cache, and render failures for callers

use std::path::PathBuf;

/// Errors surfaced by the preview pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    /// Unsupported or undetectable content type or image format.
    #[error("format error for {format} file {path}: {reason}")]
    Format {
        format: String,
        path: String,
        reason: String,
    },

    /// Transport failure, tagged with the attempted operation and an
    /// optional HTTP-style status code.
    #[error("network error during {op}{}: {message}", fmt_code(.code))]
    Network {
        op: String,
        code: Option<u16>,
        message: String,
    },

    /// I/O failure during a cache operation, named by operation and path.
    #[error("cache error during {op} operation on {path}: {source}")]
    Cache {
        op: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Decode or protocol-encode failure, tagged with the terminal and
    /// protocol in use.
    #[error("render error on {terminal} terminal with {protocol} protocol: {message}")]
    Render {
        terminal: String,
        protocol: String,
        message: String,
    },

    /// The local image file does not exist.
    #[error("image file not found: {0}")]
    FileNotFound(PathBuf),

    /// No entry is tracked for the given key.
    #[error("no entry found for key: {0}")]
    EntryNotFound(String),

    /// The fetch was cancelled before completion.
    #[error("download cancelled for {0}")]
    Cancelled(String),
}

fn fmt_code(code: &Option<u16>) -> String {
    match code {
        Some(c) => format!(" (code: {c})"),
        None => String::new(),
    }
}

impl PreviewError {
    pub fn network(op: impl Into<String>, code: Option<u16>, message: impl Into<String>) -> Self {
        Self::Network {
            op: op.into(),
            code,
            message: message.into(),
        }
    }

    pub fn cache(op: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Cache {
            op: op.into(),
            path: path.into(),
            source,
        }
    }

    /// Whether a fetch that failed with this error is worth retrying.
    /// Covers timeouts, connection drops, and 5xx-class server failures.
    pub fn is_retryable(&self) -> bool {
        let Self::Network { code, message, .. } = self else {
            return false;
        };

        if matches!(code, Some(c) if (500..=599).contains(c)) {
            return true;
        }

        let message = message.to_lowercase();
        [
            "timeout",
            "timed out",
            "connection reset",
            "connection refused",
            "temporary failure",
            "service unavailable",
            "internal server error",
            "bad gateway",
            "gateway timeout",
        ]
        .iter()
        .any(|needle| message.contains(needle))
    }
}
