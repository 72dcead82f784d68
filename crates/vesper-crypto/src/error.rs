//! Error types for cryptographic operations.

use thiserror::Error;

/// Result type alias for cryptographic operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Cryptographic operation errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Signature computation failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Sealing (encryption) failed.
    #[error("sealing failed: {0}")]
    Sealing(String),

    /// Unsealing (decryption or tag verification) failed.
    #[error("unsealing failed: {0}")]
    Unsealing(String),

    /// A transform envelope was structurally invalid.
    #[error("invalid transform envelope: {0}")]
    InvalidEnvelope(String),
}
