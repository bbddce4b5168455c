//! Error types for the xDS client.

use thiserror::Error;

/// Error type for the xDS client.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// Failed to establish a connection to an xDS server.
    #[error("connection error: {0}")]
    Connection(String),

    /// The stream terminated with a transport-level status.
    #[cfg(feature = "transport-tonic")]
    #[error("stream error: {0}")]
    Stream(tonic::Status),

    /// The stream was closed before the operation could complete.
    #[error("stream closed")]
    StreamClosed,

    /// Failed to decode a protobuf message.
    #[cfg(feature = "codegen-prost")]
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A resource, resource name, or configuration value failed validation.
    #[error("{0}")]
    Validation(String),
}

/// Result type alias for xDS client operations.
pub type Result<T> = std::result::Result<T, Error>;
