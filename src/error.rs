//! WolfStore Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for WolfStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes surfaced to callers, on the wire and from client operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    /// Target file absent
    NotFound,
    /// Malformed or missing request metadata
    InvalidArgument,
    /// Local I/O or directory-open failure
    Internal,
    /// Call context expired before handler work began
    DeadlineExceeded,
    /// Lock conflict, unauthorized release or stale upload
    FailedPrecondition,
    /// Client-side remapping of a server Internal
    Cancelled,
    /// Both sides already hold identical content
    AlreadyExists,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::Internal => "INTERNAL",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
        };
        f.write_str(name)
    }
}

/// Status carried by `Message::Error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// WolfStore error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Configuration serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Request errors
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Deadline expired")]
    DeadlineExceeded,

    #[error("Precondition failed: {0}")]
    FailedPrecondition(String),

    #[error("File already exists with identical content: {0}")]
    AlreadyExists(String),

    // Lock errors
    #[error("File '{filename}' is locked by client {owner}")]
    LockConflict { filename: String, owner: String },

    #[error("Client {client_id} does not hold the write lock for '{filename}'")]
    NotLockOwner { filename: String, client_id: String },

    // Transfer errors
    #[error("Incomplete transfer: expected {expected} bytes, received {received}")]
    IncompleteTransfer { expected: u64, received: u64 },

    #[error("Checksum mismatch: declared {declared:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { declared: u32, computed: u32 },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Failure reported by the remote end
    #[error("Remote error {0}")]
    Remote(Status),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Status code this error is reported as
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NotFound,
            Error::InvalidArgument(_) | Error::Config(_) | Error::ConfigParse(_) => {
                StatusCode::InvalidArgument
            }
            Error::DeadlineExceeded | Error::ConnectionTimeout(_) => StatusCode::DeadlineExceeded,
            Error::FailedPrecondition(_)
            | Error::LockConflict { .. }
            | Error::NotLockOwner { .. } => StatusCode::FailedPrecondition,
            Error::AlreadyExists(_) => StatusCode::AlreadyExists,
            Error::Cancelled => StatusCode::Cancelled,
            Error::Remote(status) => status.code,
            Error::ConfigSerialize(_)
            | Error::IncompleteTransfer { .. }
            | Error::ChecksumMismatch { .. }
            | Error::Network(_)
            | Error::ConnectionFailed { .. }
            | Error::Protocol(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Internal(_) => StatusCode::Internal,
        }
    }

    /// Wire status for this error
    pub fn to_status(&self) -> Status {
        match self {
            Error::Remote(status) => status.clone(),
            other => Status::new(other.status_code(), other.to_string()),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Remote(status)
    }
}
