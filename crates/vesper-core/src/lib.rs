//! Core protocol engine for the vesper SMB2/SMB3 server.
//!
//! This crate implements the wire substrate of the protocol, independent of
//! any socket or filesystem:
//! - Message header and per-command body codec ([MS-SMB2] 2.2)
//! - Compound chain assembly and decomposition ([MS-SMB2] 3.3.5.2.7)
//! - Credit-based flow control ([MS-SMB2] 3.3.1.2)
//! - Connection negotiation and session authentication state machines
//! - The engine data flow tying them together: verify, charge, decode,
//!   dispatch, and the signed/sealed response path
//!
//! Transport I/O lives in `vesper-transport`; cryptography in
//! `vesper-crypto`. Everything here is synchronous, pure state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod body;
pub mod compound;
pub mod connection;
pub mod credit;
pub mod engine;
pub mod error;
pub mod header;
pub mod session;
pub mod status;

pub(crate) mod wire;

pub use body::Body;
pub use compound::LogicalMessage;
pub use connection::{Connection, ConnectionConfig, Dialect};
pub use credit::{CreditLedger, CreditPolicy};
pub use engine::{Action, DispatchReply, DispatchRequest, Engine};
pub use error::{Error, Result};
pub use header::{Command, Header};
pub use session::{AuthProvider, AuthStep, Session};
pub use status::NtStatus;
