//! Error taxonomy for the protocol engine.
//!
//! Errors split into two classes. Connection-fatal errors mean the peer has
//! broken the wire contract (malformed structure, credit violation, bad
//! signature) and the connection must be torn down. Protocol-status errors
//! are reported back to the peer as a normal error response and leave the
//! connection open.

use crate::status::NtStatus;
use thiserror::Error;

/// Result type alias for protocol engine operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Protocol engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The fixed header failed structural validation.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// A command body failed structural validation.
    #[error("malformed body: {0}")]
    MalformedBody(String),

    /// The peer charged more credits than it holds.
    #[error("credit charge of {charged} exceeds {available} available")]
    CreditExceeded {
        /// Credits the message tried to consume.
        charged: u16,
        /// Credits the peer currently holds.
        available: u16,
    },

    /// A compound chain violated its offset structure.
    #[error("compound chain violation: {0}")]
    Compounding(String),

    /// Dialect negotiation failed or a command arrived out of order.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// An authentication round was rejected by the provider.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The authentication exchange exceeded its round-trip bound.
    #[error("authentication abandoned after {0} rounds")]
    AuthenticationExceeded(u32),

    /// A message referenced a session that is absent, logged off, or
    /// expired.
    #[error("session 0x{0:016x} is not valid")]
    SessionInvalid(u64),

    /// A signature or seal failed verification, or a message that must be
    /// signed arrived unsigned.
    #[error("message integrity check failed: {0}")]
    Integrity(String),

    /// The connection is closed; no further operations are valid.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Cryptographic failure below the engine.
    #[error("crypto error: {0}")]
    Crypto(#[from] vesper_crypto::Error),
}

impl Error {
    /// Whether this error must tear down the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::MalformedHeader(_)
            | Error::MalformedBody(_)
            | Error::CreditExceeded { .. }
            | Error::Compounding(_)
            | Error::Integrity(_)
            | Error::AuthenticationExceeded(_)
            | Error::ConnectionClosed
            | Error::Crypto(_) => true,
            Error::Negotiation(_) | Error::Authentication(_) | Error::SessionInvalid(_) => false,
        }
    }

    /// NT status reported to the peer for non-fatal errors.
    pub fn status(&self) -> NtStatus {
        match self {
            Error::Negotiation(_) => NtStatus::NOT_SUPPORTED,
            Error::Authentication(_) => NtStatus::LOGON_FAILURE,
            Error::SessionInvalid(_) => NtStatus::USER_SESSION_DELETED,
            Error::MalformedHeader(_) | Error::MalformedBody(_) => NtStatus::INVALID_PARAMETER,
            Error::CreditExceeded { .. } => NtStatus::INSUFF_SERVER_RESOURCES,
            _ => NtStatus::INVALID_SMB,
        }
    }
}
