//! Message sealing: the SMB 3.x transform envelope.
//!
//! An encrypted message is carried inside a 52-byte transform header
//! ([MS-SMB2] 2.2.41): protocol id 0xFD 'S' 'M' 'B', the 16-byte AEAD tag
//! in the signature field, a 16-byte nonce field, the original message
//! size, a reserved word, the encrypted flag, and the owning session id.
//!
//! The AEAD additional data is the transform header from the nonce field
//! onward (32 bytes); the tag authenticates both the ciphertext and that
//! trailer. AES-128-CCM uses the first 11 bytes of the nonce field,
//! AES-128-GCM the first 12; unused nonce bytes are zero on the wire.

use crate::{Error, Result};
use aes::Aes128;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes128Gcm;
use ccm::consts::{U11, U16};
use ccm::Ccm;
use zeroize::Zeroizing;

type Aes128Ccm = Ccm<Aes128, U16, U11>;

/// Transform envelope protocol id: 0xFD 'S' 'M' 'B'.
pub const TRANSFORM_PROTOCOL_ID: [u8; 4] = [0xFD, b'S', b'M', b'B'];

/// Fixed size of the transform header, in bytes.
pub const TRANSFORM_HEADER_LEN: usize = 52;

/// Value of the transform header flags field for an encrypted message.
pub const TRANSFORM_FLAG_ENCRYPTED: u16 = 0x0001;

/// Nonce length consumed by AES-128-CCM.
pub const NONCE_LEN_CCM: usize = 11;
/// Nonce length consumed by AES-128-GCM.
pub const NONCE_LEN_GCM: usize = 12;

/// Negotiated sealing cipher ([MS-SMB2] 2.2.3.1.2 cipher ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Cipher {
    /// AES-128-CCM (0x0001); the only cipher for SMB 3.0/3.0.2.
    Aes128Ccm = 0x0001,
    /// AES-128-GCM (0x0002); negotiable from SMB 3.1.1.
    Aes128Gcm = 0x0002,
}

impl Cipher {
    /// Wire identifier of the cipher.
    pub fn id(self) -> u16 {
        self as u16
    }

    /// Look up a cipher by wire identifier.
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x0001 => Some(Self::Aes128Ccm),
            0x0002 => Some(Self::Aes128Gcm),
            _ => None,
        }
    }

    /// Nonce length consumed by this cipher.
    pub fn nonce_len(self) -> usize {
        match self {
            Self::Aes128Ccm => NONCE_LEN_CCM,
            Self::Aes128Gcm => NONCE_LEN_GCM,
        }
    }
}

/// Parsed transform header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformHeader {
    /// AEAD authentication tag.
    pub signature: [u8; 16],
    /// Nonce field; only the cipher's nonce length is significant.
    pub nonce: [u8; 16],
    /// Size of the plaintext message carried inside the envelope.
    pub original_size: u32,
    /// Session that owns the sealing keys.
    pub session_id: u64,
}

impl TransformHeader {
    /// Detect whether a payload starts with the transform protocol id.
    pub fn detect(payload: &[u8]) -> bool {
        payload.len() >= 4 && payload[..4] == TRANSFORM_PROTOCOL_ID
    }

    /// Parse a transform envelope, returning the header and ciphertext.
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8])> {
        if payload.len() < TRANSFORM_HEADER_LEN {
            return Err(Error::InvalidEnvelope(format!(
                "short transform envelope: {} bytes",
                payload.len()
            )));
        }
        if payload[..4] != TRANSFORM_PROTOCOL_ID {
            return Err(Error::InvalidEnvelope("bad transform protocol id".into()));
        }

        let mut signature = [0u8; 16];
        signature.copy_from_slice(&payload[4..20]);
        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(&payload[20..36]);
        let original_size = u32::from_le_bytes(payload[36..40].try_into().unwrap());

        // Reserved word must be zero; flags must say "encrypted".
        let reserved = u16::from_le_bytes(payload[40..42].try_into().unwrap());
        if reserved != 0 {
            return Err(Error::InvalidEnvelope("non-zero reserved field".into()));
        }
        let flags = u16::from_le_bytes(payload[42..44].try_into().unwrap());
        if flags != TRANSFORM_FLAG_ENCRYPTED {
            return Err(Error::InvalidEnvelope(format!(
                "unexpected transform flags 0x{flags:04x}"
            )));
        }
        let session_id = u64::from_le_bytes(payload[44..52].try_into().unwrap());

        let ciphertext = &payload[TRANSFORM_HEADER_LEN..];
        if ciphertext.len() != original_size as usize {
            return Err(Error::InvalidEnvelope(format!(
                "ciphertext length {} does not match declared size {}",
                ciphertext.len(),
                original_size
            )));
        }

        Ok((
            Self {
                signature,
                nonce,
                original_size,
                session_id,
            },
            ciphertext,
        ))
    }

    /// Serialize the header into its 52-byte wire form.
    pub fn serialize(&self) -> [u8; TRANSFORM_HEADER_LEN] {
        let mut out = [0u8; TRANSFORM_HEADER_LEN];
        out[..4].copy_from_slice(&TRANSFORM_PROTOCOL_ID);
        out[4..20].copy_from_slice(&self.signature);
        out[20..36].copy_from_slice(&self.nonce);
        out[36..40].copy_from_slice(&self.original_size.to_le_bytes());
        // 40..42 reserved, zero
        out[42..44].copy_from_slice(&TRANSFORM_FLAG_ENCRYPTED.to_le_bytes());
        out[44..52].copy_from_slice(&self.session_id.to_le_bytes());
        out
    }

    /// The additional authenticated data: header bytes from the nonce
    /// field to the end.
    fn aad(&self) -> [u8; 32] {
        let wire = self.serialize();
        let mut aad = [0u8; 32];
        aad.copy_from_slice(&wire[20..52]);
        aad
    }
}

/// Build a nonce field from a monotonic counter. The counter occupies the
/// low-order bytes in little-endian order; the remainder stays zero so the
/// same field serves both cipher nonce lengths.
pub fn nonce_from_counter(counter: u64) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Seal a plaintext message into a complete transform envelope.
pub fn seal(
    cipher: Cipher,
    key: &[u8; 16],
    session_id: u64,
    nonce: [u8; 16],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let mut header = TransformHeader {
        signature: [0u8; 16],
        nonce,
        original_size: plaintext.len() as u32,
        session_id,
    };

    let mut buffer = plaintext.to_vec();
    let tag = match cipher {
        Cipher::Aes128Ccm => {
            let aead = Aes128Ccm::new_from_slice(key)
                .map_err(|_| Error::Sealing("invalid AES-128-CCM key length".into()))?;
            aead.encrypt_in_place_detached(
                GenericArray::from_slice(&nonce[..NONCE_LEN_CCM]),
                &header.aad(),
                &mut buffer,
            )
            .map_err(|_| Error::Sealing("AES-128-CCM encryption failed".into()))?
            .to_vec()
        }
        Cipher::Aes128Gcm => {
            let aead = Aes128Gcm::new_from_slice(key)
                .map_err(|_| Error::Sealing("invalid AES-128-GCM key length".into()))?;
            aead.encrypt_in_place_detached(
                GenericArray::from_slice(&nonce[..NONCE_LEN_GCM]),
                &header.aad(),
                &mut buffer,
            )
            .map_err(|_| Error::Sealing("AES-128-GCM encryption failed".into()))?
            .to_vec()
        }
    };
    header.signature.copy_from_slice(&tag);

    let mut out = Vec::with_capacity(TRANSFORM_HEADER_LEN + buffer.len());
    out.extend_from_slice(&header.serialize());
    out.extend_from_slice(&buffer);
    Ok(out)
}

/// Unseal a transform envelope that was already parsed with
/// [`TransformHeader::parse`]. Tag verification failure is an error; the
/// plaintext is returned in a zeroizing buffer.
pub fn unseal(
    cipher: Cipher,
    key: &[u8; 16],
    header: &TransformHeader,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let mut buffer = ciphertext.to_vec();
    let tag = GenericArray::from_slice(&header.signature);
    match cipher {
        Cipher::Aes128Ccm => {
            let aead = Aes128Ccm::new_from_slice(key)
                .map_err(|_| Error::Unsealing("invalid AES-128-CCM key length".into()))?;
            aead.decrypt_in_place_detached(
                GenericArray::from_slice(&header.nonce[..NONCE_LEN_CCM]),
                &header.aad(),
                &mut buffer,
                tag,
            )
            .map_err(|_| Error::Unsealing("AES-128-CCM authentication failed".into()))?;
        }
        Cipher::Aes128Gcm => {
            let aead = Aes128Gcm::new_from_slice(key)
                .map_err(|_| Error::Unsealing("invalid AES-128-GCM key length".into()))?;
            aead.decrypt_in_place_detached(
                GenericArray::from_slice(&header.nonce[..NONCE_LEN_GCM]),
                &header.aad(),
                &mut buffer,
                tag,
            )
            .map_err(|_| Error::Unsealing("AES-128-GCM authentication failed".into()))?;
        }
    }
    Ok(Zeroizing::new(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_unseal_roundtrip() {
        let key = [0x42u8; 16];
        let plaintext = b"an entire smb2 message, header and all";

        for cipher in [Cipher::Aes128Ccm, Cipher::Aes128Gcm] {
            let envelope =
                seal(cipher, &key, 0x1122334455667788, nonce_from_counter(7), plaintext).unwrap();
            let (header, ciphertext) = TransformHeader::parse(&envelope).unwrap();
            assert_eq!(header.session_id, 0x1122334455667788);
            assert_eq!(header.original_size as usize, plaintext.len());

            let opened = unseal(cipher, &key, &header, ciphertext).unwrap();
            assert_eq!(&*opened, plaintext);
        }
    }

    #[test]
    fn test_unseal_rejects_tampered_ciphertext() {
        let key = [0x42u8; 16];
        let mut envelope = seal(
            Cipher::Aes128Gcm,
            &key,
            1,
            nonce_from_counter(1),
            b"payload",
        )
        .unwrap();

        let last = envelope.len() - 1;
        envelope[last] ^= 0xFF;
        let (header, ciphertext) = TransformHeader::parse(&envelope).unwrap();
        assert!(unseal(Cipher::Aes128Gcm, &key, &header, ciphertext).is_err());
    }

    #[test]
    fn test_unseal_rejects_wrong_session_binding() {
        // The session id lives in the AAD, so rewriting it invalidates the tag.
        let key = [0x42u8; 16];
        let envelope = seal(
            Cipher::Aes128Ccm,
            &key,
            1,
            nonce_from_counter(1),
            b"payload",
        )
        .unwrap();

        let mut forged = envelope.clone();
        forged[44..52].copy_from_slice(&2u64.to_le_bytes());
        let (header, ciphertext) = TransformHeader::parse(&forged).unwrap();
        assert!(unseal(Cipher::Aes128Ccm, &key, &header, ciphertext).is_err());
    }

    #[test]
    fn test_transform_header_layout() {
        let header = TransformHeader {
            signature: [0xAA; 16],
            nonce: nonce_from_counter(0x0102030405060708),
            original_size: 100,
            session_id: 0x1122334455667788,
        };
        let wire = header.serialize();

        assert_eq!(&wire[..4], &[0xFD, b'S', b'M', b'B']);
        assert_eq!(&wire[4..20], &[0xAA; 16]);
        // Counter is little-endian in the low nonce bytes.
        assert_eq!(&wire[20..28], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(u32::from_le_bytes(wire[36..40].try_into().unwrap()), 100);
        assert_eq!(u16::from_le_bytes(wire[40..42].try_into().unwrap()), 0);
        assert_eq!(u16::from_le_bytes(wire[42..44].try_into().unwrap()), 0x0001);
    }

    #[test]
    fn test_parse_rejects_bad_protocol_id() {
        let mut wire = vec![0u8; TRANSFORM_HEADER_LEN];
        wire[..4].copy_from_slice(&[0xFE, b'S', b'M', b'B']);
        assert!(TransformHeader::parse(&wire).is_err());
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let key = [0x42u8; 16];
        let mut envelope = seal(
            Cipher::Aes128Gcm,
            &key,
            1,
            nonce_from_counter(1),
            b"payload",
        )
        .unwrap();
        envelope.push(0x00);
        assert!(TransformHeader::parse(&envelope).is_err());
    }
}
