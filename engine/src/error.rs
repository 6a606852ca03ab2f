//! Error types for the Stockroom engine.

use crate::{CollectionName, OperationId};
use thiserror::Error;

/// All possible errors from the Stockroom engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unknown collection: {0}")]
    UnknownCollection(CollectionName),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("pending operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
