//! Diagnostics error types
//!
//! Lifecycle and configuration failures are returned to whoever requested
//! the transition. Per-request failures become a structured JSON body and
//! never touch the lifecycle state.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Diagnostics gateway errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiagnosticsError {
    /// The listener could not be bound (address in use, permission denied, ...).
    #[error("could not bind diagnostics listener on '{address}': {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Graceful shutdown did not finish before the deadline.
    #[error("could not shutdown metrics server: deadline of {0:?} exceeded")]
    ShutdownTimeout(Duration),

    /// The serve task failed while shutting down.
    #[error("could not shutdown metrics server: {0}")]
    Shutdown(String),

    /// No plugin environment is available.
    #[error("plugins are disabled: {0}")]
    FeatureDisabled(String),

    /// Unknown plugin, route or profile.
    #[error("not found: {0}")]
    NotFound(String),

    /// A host route was registered twice or with an unusable path.
    #[error("invalid route '{0}': {1}")]
    InvalidRoute(String, String),

    /// The site URL could not be parsed into a mount sub-path.
    #[error("failed to parse site URL subpath: {0}")]
    SubpathParse(String),

    /// Template construction or rendering failed.
    #[error("failed to render page: {0}")]
    Render(String),

    /// The accept loop died for a reason other than shutdown.
    #[error("diagnostics server stopped unexpectedly: {0}")]
    FatalServe(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Wire format of every error response served by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: u16,
    pub message: String,
    pub detail: String,
}

impl DiagnosticsError {
    /// HTTP status used when the error is returned to a client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DiagnosticsError::FeatureDisabled(_) => StatusCode::NOT_IMPLEMENTED,
            DiagnosticsError::NotFound(_) => StatusCode::NOT_FOUND,
            DiagnosticsError::InvalidRoute(..) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Structured body for this error.
    pub fn body(&self) -> ErrorBody {
        let (message, detail) = match self {
            DiagnosticsError::FeatureDisabled(detail) => {
                ("Plugins have been disabled.", detail.clone())
            }
            DiagnosticsError::NotFound(detail) => ("Resource not found.", detail.clone()),
            DiagnosticsError::SubpathParse(detail) => {
                ("Failed to parse SiteURL subpath.", detail.clone())
            }
            other => ("Internal server error.", other.to_string()),
        };
        ErrorBody {
            status: self.status_code().as_u16(),
            message: message.to_string(),
            detail,
        }
    }
}

impl IntoResponse for DiagnosticsError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

pub type DiagnosticsResult<T> = Result<T, DiagnosticsError>;
