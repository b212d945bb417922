//! Store client errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the store client.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The schema file the store was provisioned from is missing.
    #[error("schema not found: {}", .0.display())]
    SchemaMissing(PathBuf),

    /// The store could not be reached.
    #[error("store unreachable at {remote}: {detail}")]
    Unreachable { remote: String, detail: String },

    /// The database is not served by the store.
    #[error("database {0} not found")]
    DatabaseMissing(String),

    /// A table was requested that the client does not track.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The store returned something we could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Spawning or talking to the store client process failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
