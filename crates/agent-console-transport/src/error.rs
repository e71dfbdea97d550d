//! Transport error taxonomy.

use thiserror::Error;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network is absent; no call was attempted.
    #[error("Network is offline")]
    Offline,
    /// 401 on a refresh-eligible request that was not recovered.
    #[error("Credentials expired for {url}")]
    AuthExpired { url: String },
    /// The refresh call itself failed.
    #[error("Credential refresh failed: {reason}")]
    RefreshFailed { reason: String },
    /// The retried request was still unauthorized.
    #[error("Request still unauthorized after refresh: {url}")]
    RetryFailed { url: String },
    /// The execution backend could not be reached at all.
    #[error("Backend unreachable at {url}: {reason}")]
    BackendUnreachable { url: String, reason: String },
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
