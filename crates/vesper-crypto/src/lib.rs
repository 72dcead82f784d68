//! Cryptographic primitives for the vesper SMB2/SMB3 protocol engine.
//!
//! This crate implements the message-security algorithms mandated by
//! [MS-SMB2] for the supported dialects:
//! - Key derivation (SP800-108 counter-mode KDF, [MS-SMB2] 3.1.4.2)
//! - Message signing (HMAC-SHA256 for SMB 2.x, AES-128-CMAC for SMB 3.x)
//! - Message sealing (AES-128-CCM / AES-128-GCM transform envelope,
//!   [MS-SMB2] 2.2.41)
//! - Pre-authentication integrity hashing (SHA-512, [MS-SMB2] 3.1.5.2)
//!
//! All secret material is wrapped in `Zeroizing`; signature comparison is
//! constant-time via the `subtle` crate. No key material is ever logged.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod kdf;
pub mod preauth;
pub mod sealing;
pub mod signing;

pub use error::{Error, Result};
pub use preauth::PreauthIntegrity;
pub use sealing::{Cipher, TransformHeader};
pub use signing::SigningAlgorithm;
