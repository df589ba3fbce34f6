//! Reef - A personal project, task and time tracker.
//!
//! This library provides the core of the `reef` server: the SQLite-backed
//! store, the connection controller that serializes mutations and broadcasts
//! changes, and the web layer that exposes both over WebSocket.

pub mod cli;
pub mod config;
pub mod logging;
pub mod models;
pub mod storage;
pub mod web;

/// Version string reported by the CLI and the status endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");


/// Library-level error type for Reef operations.
///
/// `Conflict`, `InvalidArgument` and `NotFound` are user-facing: their
/// message is sent verbatim to the client that issued the failing request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A uniqueness constraint was violated (tag name, project title).
    #[error("{0}")]
    Conflict(String),

    /// The operation is not allowed or its input is malformed.
    #[error("{0}")]
    InvalidArgument(String),

    /// A referenced entity does not exist.
    #[error("{0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    StorageLock,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Controller is not running")]
    ControllerStopped,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error means the store can no longer be trusted.
    ///
    /// Fatal errors stop the controller and terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Io(_) | Error::StorageLock)
    }
}

impl From<rusqlite::Error> for Error {
    /// A value SQLite cannot represent is bad input, not a broken store.
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::ToSqlConversionFailure(e) => {
                Error::InvalidArgument(format!("Value out of range: {}", e))
            }
            other => Error::Database(other),
        }
    }
}

/// Result type alias for Reef operations.
pub type Result<T> = std::result::Result<T, Error>;
