//! Error types for mesh relay operations

use database::StoreError;
use shared::ConnectionStatus;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur while relaying mesh traffic
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Message transmission failed: {0}")]
    TransmissionFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid peer transition for {peer_id}: {from} -> {to}")]
    InvalidTransition {
        peer_id: String,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::TransportError(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::SerializationError(err.to_string())
    }
}
