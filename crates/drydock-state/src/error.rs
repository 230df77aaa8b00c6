//! Error types for Drydock state handling.

use thiserror::Error;

use crate::types::DeploymentStatus;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur in the registry or history store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("invalid app name: {0:?}")]
    InvalidAppName(String),

    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("app not found: {0}")]
    AppNotFound(String),
}
