//! Key derivation for SMB 3.x session keys.
//!
//! Implements the SP800-108 counter-mode KDF with HMAC-SHA256 as the PRF,
//! exactly as required by [MS-SMB2] 3.1.4.2: a 32-bit big-endian counter
//! starting at 1, the label (including its terminating null), a zero
//! separator octet, the context, and a 32-bit big-endian output length of
//! 128 bits. All derived keys are 16 bytes.
//!
//! SMB 2.x dialects do not derive keys; they sign with the (normalized)
//! session key directly.

use crate::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Length of every derived key, in bytes.
pub const DERIVED_KEY_LEN: usize = 16;

/// KDF label for SMB 3.0/3.0.2 signing keys ("SMB2AESCMAC" + null).
pub const LABEL_SMB30_SIGNING: &[u8] = b"SMB2AESCMAC\0";
/// KDF context for SMB 3.0/3.0.2 signing keys ("SmbSign" + null).
pub const CONTEXT_SMB30_SIGNING: &[u8] = b"SmbSign\0";
/// KDF label for SMB 3.0/3.0.2 sealing keys ("SMB2AESCCM" + null).
pub const LABEL_SMB30_SEALING: &[u8] = b"SMB2AESCCM\0";
/// KDF context for the server's inbound (client-to-server) sealing key.
pub const CONTEXT_SMB30_SERVER_IN: &[u8] = b"ServerIn \0";
/// KDF context for the server's outbound (server-to-client) sealing key.
pub const CONTEXT_SMB30_SERVER_OUT: &[u8] = b"ServerOut\0";
/// KDF label for SMB 3.1.1 signing keys ("SMBSigningKey" + null).
pub const LABEL_SMB311_SIGNING: &[u8] = b"SMBSigningKey\0";
/// KDF label for the SMB 3.1.1 client-to-server cipher key.
pub const LABEL_SMB311_C2S_CIPHER: &[u8] = b"SMBC2SCipherKey\0";
/// KDF label for the SMB 3.1.1 server-to-client cipher key.
pub const LABEL_SMB311_S2C_CIPHER: &[u8] = b"SMBS2CCipherKey\0";

/// Normalize a provider-supplied session key to the 16-byte form used by
/// every SMB key schedule: truncate to 16 bytes, zero-pad if shorter.
pub fn normalize_session_key(session_key: &[u8]) -> Zeroizing<[u8; 16]> {
    let mut key = Zeroizing::new([0u8; 16]);
    let n = session_key.len().min(16);
    key[..n].copy_from_slice(&session_key[..n]);
    key
}

/// SP800-108 counter-mode KDF with HMAC-SHA256, 128-bit output.
///
/// `label` and `context` must already carry their terminating nulls where
/// the key schedule calls for them; this function inserts only the single
/// separator octet between them.
pub fn derive_key(
    key: &[u8; 16],
    label: &[u8],
    context: &[u8],
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| Error::KeyDerivation("invalid PRF key length".into()))?;

    // i (1, big-endian) || label || 0x00 || context || L (128, big-endian)
    mac.update(&1u32.to_be_bytes());
    mac.update(label);
    mac.update(&[0u8]);
    mac.update(context);
    mac.update(&128u32.to_be_bytes());

    let mut prf = Zeroizing::new([0u8; 32]);
    prf.copy_from_slice(&mac.finalize().into_bytes());
    let mut out = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    out.copy_from_slice(&prf[..DERIVED_KEY_LEN]);
    Ok(out)
}
