//! Transport layer for the vesper SMB2/SMB3 engine.
//!
//! Implements the NetBIOS session service / direct-TCP record framing
//! ([RFC 1002] 4.3, [MS-SMB2] 2.1) and the tokio-based connection loop
//! that feeds complete application payloads into `vesper-core` and writes
//! its responses back, in whatever order they complete.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod framing;
pub mod tcp;

pub use error::{Error, Result};
pub use framing::{Framer, Record};
pub use tcp::{serve, serve_connection, AppHandler, ProviderFactory};
