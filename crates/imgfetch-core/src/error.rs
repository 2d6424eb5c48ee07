//! Error types for imgfetch core

use thiserror::Error;

/// Errors that can occur while fetching an image
///
/// Cloneable so a stored outcome can be replayed to subscribers that attach
/// after an operation already finished.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Server error: HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DownloadError {
    /// Network-level failures, including non-success statuses
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DownloadError::Transport(_) | DownloadError::HttpStatus { .. }
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Transport(_) => true,
            DownloadError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(error: reqwest::Error) -> Self {
        match (error.status(), error.url()) {
            (Some(status), Some(url)) => DownloadError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            },
            _ => DownloadError::Transport(error.to_string()),
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(error: std::io::Error) -> Self {
        DownloadError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(error: serde_json::Error) -> Self {
        DownloadError::Config(error.to_string())
    }
}

impl From<url::ParseError> for DownloadError {
    fn from(error: url::ParseError) -> Self {
        DownloadError::InvalidRequest(error.to_string())
    }
}
