//! Centralized error types for Tessera.
//!
//! Uses `thiserror` for the error definitions and maps every variant onto an
//! HTTP status and a stable error code so the internal API can carry errors
//! across the wire and rebuild them on the other side.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Core error type shared by the room server, the outbound queue and the notary cache.
#[derive(Debug, thiserror::Error)]
pub enum TesseraError {
    // === Expected outcomes ===
    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    // === Wiring defects ===
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    // === Infrastructure errors ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error body exchanged over the internal API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub error: String,
    pub message: String,
}

impl TesseraError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into() }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden { reason: reason.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// NotFound and Forbidden are ordinary answers, not failures worth logging.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Forbidden { .. })
    }

    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. }
            | Self::Database(_)
            | Self::Serialisation(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code string for programmatic handling by internal API clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialisation(_) => "SERIALISATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The variant payload without the display prefix, as sent in `ErrorResponse::message`.
    fn detail(&self) -> String {
        match self {
            Self::NotFound { resource } => resource.clone(),
            Self::Forbidden { reason } => reason.clone(),
            Self::Validation { message } | Self::Configuration { message } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error received from a remote internal API.
    ///
    /// Infrastructure errors lose their concrete source type on the way and come
    /// back as [`TesseraError::Internal`].
    pub fn from_error_response(body: ErrorResponse) -> Self {
        match body.error.as_str() {
            "NOT_FOUND" => Self::NotFound { resource: body.message },
            "FORBIDDEN" => Self::Forbidden { reason: body.message },
            "VALIDATION_ERROR" => Self::Validation { message: body.message },
            "CONFIGURATION_ERROR" => Self::Configuration { message: body.message },
            _ => Self::Internal(anyhow::anyhow!("{}: {}", body.error, body.message)),
        }
    }
}

impl From<tokio::task::JoinError> for TesseraError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(anyhow::anyhow!("detached task failed: {e}"))
    }
}

impl IntoResponse for TesseraError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            TesseraError::Database(e) => tracing::error!("Database error: {e}"),
            TesseraError::Serialisation(e) => tracing::error!("Serialisation error: {e}"),
            TesseraError::Internal(e) => tracing::error!("Internal error: {e}"),
            TesseraError::Configuration { message } => {
                tracing::error!("Configuration error: {message}")
            }
            other => tracing::debug!("Request rejected: {other}"),
        }

        let body = ErrorResponse {
            code: status.as_u16(),
            error: self.error_code().to_string(),
            message: self.detail(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using TesseraError.
pub type TesseraResult<T> = Result<T, TesseraError>;
