//! Per-message signature computation and verification.
//!
//! Two algorithms cover the supported dialect range ([MS-SMB2] 3.1.4.1):
//! - SMB 2.0.2 / 2.1: HMAC-SHA256 over the message, truncated to 16 bytes.
//! - SMB 3.x: AES-128-CMAC over the message.
//!
//! The caller passes the message with the 16-byte signature field zeroed;
//! the wire layout of that field belongs to the header codec, not to this
//! module. Verification is constant-time.

use crate::{Error, Result};
use aes::Aes128;
use cmac::Cmac;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Size of the signature field, in bytes.
pub const SIGNATURE_LEN: usize = 16;

/// Signature algorithm selected by the negotiated dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    /// HMAC-SHA256 truncated to 16 bytes (SMB 2.0.2, 2.1).
    HmacSha256,
    /// AES-128-CMAC (SMB 3.0 and later).
    AesCmac,
}

/// Compute the signature of `message` (signature field already zeroed).
pub fn sign(
    algorithm: SigningAlgorithm,
    key: &[u8; 16],
    message: &[u8],
) -> Result<[u8; SIGNATURE_LEN]> {
    let mut signature = [0u8; SIGNATURE_LEN];
    match algorithm {
        SigningAlgorithm::HmacSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key)
                .map_err(|_| Error::Signing("invalid HMAC key length".into()))?;
            mac.update(message);
            let digest = mac.finalize().into_bytes();
            signature.copy_from_slice(&digest[..SIGNATURE_LEN]);
        }
        SigningAlgorithm::AesCmac => {
            let mut mac = Cmac::<Aes128>::new_from_slice(key)
                .map_err(|_| Error::Signing("invalid CMAC key length".into()))?;
            mac.update(message);
            let digest = mac.finalize().into_bytes();
            signature.copy_from_slice(&digest[..SIGNATURE_LEN]);
        }
    }
    Ok(signature)
}

/// Verify `expected` against the signature of `message` (signature field
/// already zeroed). Comparison is constant-time.
pub fn verify(
    algorithm: SigningAlgorithm,
    key: &[u8; 16],
    message: &[u8],
    expected: &[u8; SIGNATURE_LEN],
) -> Result<bool> {
    let computed = sign(algorithm, key, message)?;
    Ok(computed[..].ct_eq(&expected[..]).into())
}
