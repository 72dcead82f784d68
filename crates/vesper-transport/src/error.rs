//! Error types for the transport layer.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport envelope was malformed or oversized. Fatal for the
    /// connection.
    #[error("framing error: {0}")]
    Framing(String),

    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The protocol engine declared the connection broken.
    #[error("protocol error: {0}")]
    Protocol(#[from] vesper_core::Error),
}
