//! Error types for the network executor.

use thiserror::Error;

/// Errors that can occur when executing a request.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The HTTP client failed before a response arrived.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server answered with a non-success status.
    #[error("request failed ({status}): {body}")]
    Status { status: u16, body: String },

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Credentials could not be refreshed.
    #[error("credential refresh failed: {0}")]
    Refresh(String),
}

impl NetworkError {
    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            NetworkError::Status { status, .. } => Some(*status),
            NetworkError::RateLimited { .. } => Some(429),
            NetworkError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
