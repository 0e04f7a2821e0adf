//! Errors from resolving remote servers and fetching their keys.

use tessera_common::TesseraError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FederationError {
    // === Resolution ===
    #[error("HTTP client could not be built: {0}")]
    Client(String),

    #[error("{server} delegates to an empty server name in .well-known/matrix/server")]
    EmptyDelegation { server: String },

    // === Key fetch ===
    #[error("request to {server} failed: {reason}")]
    RequestFailed { server: String, reason: String },

    #[error("key document from {server} is unusable: {reason}")]
    KeyDocument { server: String, reason: String },

    // === Decoding ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<reqwest::Error> for FederationError {
    fn from(e: reqwest::Error) -> Self {
        let server = e
            .url()
            .and_then(|u| u.host_str())
            .map(str::to_owned)
            .unwrap_or_else(|| "unknown host".to_owned());
        FederationError::RequestFailed { server, reason: e.to_string() }
    }
}

/// The room server sees remote failures as backing-service failures.
impl From<FederationError> for TesseraError {
    fn from(e: FederationError) -> Self {
        TesseraError::Internal(anyhow::Error::new(e))
    }
}
