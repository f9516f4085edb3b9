//! Error types for tally-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using tally-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tally-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Table is not declared in the registry
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Record failed validation against the registry
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Remote authority error
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// IO error (snapshot file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sync service task is no longer running
    #[error("Sync service unavailable: {0}")]
    ServiceUnavailable(String),
}
