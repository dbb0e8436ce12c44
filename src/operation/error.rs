//! Error type carried by a failed or invalid remote operation.

use thiserror::Error;

/// Why a remote operation could not be scheduled or did not succeed.
///
/// Payloads are plain strings so the error can be cloned out of a shared
/// handle and read from any thread.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// The backend could not accept the request at all.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The request named a label the current catalog does not know.
    #[error("unknown label '{0}'")]
    UnknownLabel(String),

    /// Transport-level failure (DNS, connection, TLS, interrupted body).
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-success HTTP status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// URL that was requested.
        url: String,
        /// Status code returned.
        status: u16,
    },

    /// Local file system failure while persisting or reading data.
    #[error("io error at {path}: {message}")]
    Io {
        /// Path involved.
        path: String,
        /// Underlying error text.
        message: String,
    },

    /// Data received from the server was malformed.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Any other backend-reported failure.
    #[error("{0}")]
    Failed(String),

    /// The backend dropped the operation without completing it.
    #[error("operation abandoned before completion")]
    Abandoned,
}

impl OperationError {
    /// Creates an IO error from a path and source error.
    pub fn io(path: impl AsRef<std::path::Path>, source: &std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            message: source.to_string(),
        }
    }
}
