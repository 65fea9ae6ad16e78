//! Error types for spmigrate-core

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for spmigrate-core
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for spmigrate-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    /// Invalid configuration format
    #[error("Invalid configuration format: {0}")]
    InvalidConfig(String),

    /// Credential exchange failed or credentials are missing
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The remote refused to open an upload session
    #[error("Failed to create upload session{}: {message}", status_suffix(.status))]
    SessionCreate { status: Option<u16>, message: String },

    /// The remote no longer knows the upload session (404/410 on status query)
    #[error("Upload session expired or not found")]
    SessionExpired,

    /// A chunk write was rejected
    #[error("Chunk transfer failed (HTTP {status}): {body}")]
    Transfer { status: u16, body: String },

    /// Destination already exists and the conflict policy forbids overwriting
    #[error("Destination already exists (HTTP {status}): {body}")]
    Conflict { status: u16, body: String },

    /// The loop ended without the remote confirming the whole file
    #[error("Upload incomplete: server acknowledged {offset} of {total} bytes")]
    IncompleteTransfer { offset: u64, total: u64 },

    /// Zero-length sources are never uploaded
    #[error("Source is empty: {0}")]
    EmptySource(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout
    #[error("Operation timed out")]
    Timeout,

    /// Cancelled by user
    #[error("Operation cancelled")]
    Cancelled,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

/// How a terminal failure should be treated by whoever owns the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The destination already exists; retrying will not help
    Conflict,
    /// Worth retrying the whole file later
    Transient,
    /// Configuration, credential or local problems; retrying is pointless
    Fatal,
}

impl Error {
    /// Classify a non-success HTTP reply into a structured error.
    ///
    /// This is the single place where status codes turn into error variants.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => Error::Authentication(format!("HTTP 401: {}", body)),
            409 | 412 => Error::Conflict { status, body },
            _ => Error::Transfer { status, body },
        }
    }

    /// Classify the error for the caller that decides about file-level retries
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Conflict { .. } => FailureKind::Conflict,
            Error::Transfer { status, .. } => {
                if is_transient_status(*status) {
                    FailureKind::Transient
                } else {
                    FailureKind::Fatal
                }
            }
            Error::SessionCreate { status, .. } => match status {
                Some(s) if !is_transient_status(*s) => FailureKind::Fatal,
                _ => FailureKind::Transient,
            },
            Error::Network(_)
            | Error::Timeout
            | Error::HttpClient(_)
            | Error::SessionExpired
            | Error::IncompleteTransfer { .. } => FailureKind::Transient,
            _ => FailureKind::Fatal,
        }
    }

    /// True for the duplicate-detection case
    pub fn is_conflict(&self) -> bool {
        self.kind() == FailureKind::Conflict
    }
}

/// Statuses the remote uses for throttling and temporary outages
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else if err.is_connect() {
            Error::Network(err.to_string())
        } else if err.is_builder() {
            Error::HttpClient(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}
