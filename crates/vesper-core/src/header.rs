//! Fixed 64-byte message header parsing and serialization.
//!
//! Wire layout per [MS-SMB2] 2.2.1, all integers little-endian:
//!
//! ```text
//! offset  size  field
//!      0     4  ProtocolId (0xFE 'S' 'M' 'B')
//!      4     2  StructureSize (must be 64)
//!      6     2  CreditCharge
//!      8     4  Status (responses) / ChannelSequence + Reserved (3.x requests)
//!     12     2  Command
//!     14     2  CreditRequest / CreditResponse
//!     16     4  Flags
//!     20     4  NextCommand (compound chain offset)
//!     24     8  MessageId
//!     32     8  Reserved + TreeId (sync) / AsyncId (async)
//!     40     8  SessionId
//!     48    16  Signature
//! ```
//!
//! The two overlaid regions (status vs. channel sequence, tree id vs.
//! async id) are resolved by the response and async flag bits, so the
//! codec needs no dialect context.

use crate::status::NtStatus;
use crate::wire::{read_u16_le, read_u32_le, read_u64_le};
use crate::{Error, Result};

/// Message protocol id: 0xFE 'S' 'M' 'B'.
pub const PROTOCOL_ID: [u8; 4] = [0xFE, b'S', b'M', b'B'];

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 64;

/// Length of the signature field.
pub const SIGNATURE_LEN: usize = 16;

/// Flag: the message is a response (server to client).
pub const FLAG_RESPONSE: u32 = 0x0000_0001;
/// Flag: the message uses the async header variant.
pub const FLAG_ASYNC: u32 = 0x0000_0002;
/// Flag: the message is related to the previous one in its compound chain.
pub const FLAG_RELATED: u32 = 0x0000_0004;
/// Flag: the signature field is valid.
pub const FLAG_SIGNED: u32 = 0x0000_0008;
/// Priority bits (SMB 3.1.1).
pub const FLAG_PRIORITY_MASK: u32 = 0x0000_0070;
/// Flag: DFS operation.
pub const FLAG_DFS: u32 = 0x1000_0000;
/// Flag: SMB 3.x replayed operation.
pub const FLAG_REPLAY: u32 = 0x2000_0000;
/// Every defined flag bit.
pub const FLAGS_MASK: u32 = 0x3000_007F;

/// Command codes ([MS-SMB2] 2.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    /// Dialect and capability negotiation.
    Negotiate = 0x0000,
    /// Authentication and session establishment.
    SessionSetup = 0x0001,
    /// Close a session.
    Logoff = 0x0002,
    /// Connect to a share.
    TreeConnect = 0x0003,
    /// Disconnect a share.
    TreeDisconnect = 0x0004,
    /// Create or open a filesystem object.
    Create = 0x0005,
    /// Close an open handle.
    Close = 0x0006,
    /// Flush buffered data.
    Flush = 0x0007,
    /// Read data.
    Read = 0x0008,
    /// Write data.
    Write = 0x0009,
    /// Byte-range locks.
    Lock = 0x000A,
    /// Device control.
    Ioctl = 0x000B,
    /// Cancel an outstanding request.
    Cancel = 0x000C,
    /// Liveness probe.
    Echo = 0x000D,
    /// Directory enumeration.
    QueryDirectory = 0x000E,
    /// Change notification.
    ChangeNotify = 0x000F,
    /// Query metadata.
    QueryInfo = 0x0010,
    /// Set metadata.
    SetInfo = 0x0011,
    /// Oplock or lease break.
    OplockBreak = 0x0012,
}

impl Command {
    /// Wire code of this command.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Look up a command by wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0000 => Some(Self::Negotiate),
            0x0001 => Some(Self::SessionSetup),
            0x0002 => Some(Self::Logoff),
            0x0003 => Some(Self::TreeConnect),
            0x0004 => Some(Self::TreeDisconnect),
            0x0005 => Some(Self::Create),
            0x0006 => Some(Self::Close),
            0x0007 => Some(Self::Flush),
            0x0008 => Some(Self::Read),
            0x0009 => Some(Self::Write),
            0x000A => Some(Self::Lock),
            0x000B => Some(Self::Ioctl),
            0x000C => Some(Self::Cancel),
            0x000D => Some(Self::Echo),
            0x000E => Some(Self::QueryDirectory),
            0x000F => Some(Self::ChangeNotify),
            0x0010 => Some(Self::QueryInfo),
            0x0011 => Some(Self::SetInfo),
            0x0012 => Some(Self::OplockBreak),
            _ => None,
        }
    }

    /// Command name, for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Negotiate => "NEGOTIATE",
            Self::SessionSetup => "SESSION_SETUP",
            Self::Logoff => "LOGOFF",
            Self::TreeConnect => "TREE_CONNECT",
            Self::TreeDisconnect => "TREE_DISCONNECT",
            Self::Create => "CREATE",
            Self::Close => "CLOSE",
            Self::Flush => "FLUSH",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::Lock => "LOCK",
            Self::Ioctl => "IOCTL",
            Self::Cancel => "CANCEL",
            Self::Echo => "ECHO",
            Self::QueryDirectory => "QUERY_DIRECTORY",
            Self::ChangeNotify => "CHANGE_NOTIFY",
            Self::QueryInfo => "QUERY_INFO",
            Self::SetInfo => "SET_INFO",
            Self::OplockBreak => "OPLOCK_BREAK",
        }
    }
}

/// Parsed message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Credits this message consumes.
    pub credit_charge: u16,
    /// Status code; meaningful in responses.
    pub status: NtStatus,
    /// Channel sequence; shares wire bytes with `status` in 3.x requests.
    pub channel_sequence: u16,
    /// Command code.
    pub command: Command,
    /// Credits requested (requests) or granted (responses).
    pub credits: u16,
    /// Flag bits.
    pub flags: u32,
    /// Offset to the next message in a compound chain; zero terminates.
    pub next_command: u32,
    /// Message identifier, unique per connection while outstanding.
    pub message_id: u64,
    /// Tree identifier (sync headers).
    pub tree_id: u32,
    /// Async identifier (async headers).
    pub async_id: u64,
    /// Session identifier.
    pub session_id: u64,
    /// Message signature.
    pub signature: [u8; SIGNATURE_LEN],
}

impl Header {
    /// Create a request header for `command` with all other fields zeroed.
    pub fn new(command: Command) -> Self {
        Self {
            credit_charge: 0,
            status: NtStatus::SUCCESS,
            channel_sequence: 0,
            command,
            credits: 0,
            flags: 0,
            next_command: 0,
            message_id: 0,
            tree_id: 0,
            async_id: 0,
            session_id: 0,
            signature: [0u8; SIGNATURE_LEN],
        }
    }

    /// Build a response header answering this request with `status`.
    /// Credits and the signed flag are filled in by the response path.
    pub fn reply(&self, status: NtStatus) -> Self {
        Self {
            credit_charge: self.credit_charge,
            status,
            channel_sequence: 0,
            command: self.command,
            credits: 0,
            flags: FLAG_RESPONSE | (self.flags & FLAG_RELATED),
            next_command: 0,
            message_id: self.message_id,
            tree_id: self.tree_id,
            async_id: 0,
            session_id: self.session_id,
            signature: [0u8; SIGNATURE_LEN],
        }
    }

    /// Whether the response flag is set.
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    /// Whether the async flag is set.
    pub fn is_async(&self) -> bool {
        self.flags & FLAG_ASYNC != 0
    }

    /// Whether this message is related to its compound predecessor.
    pub fn is_related(&self) -> bool {
        self.flags & FLAG_RELATED != 0
    }

    /// Whether the signature field is declared valid.
    pub fn is_signed(&self) -> bool {
        self.flags & FLAG_SIGNED != 0
    }

    /// Priority value (SMB 3.1.1), in the range 0..=7.
    pub fn priority(&self) -> u8 {
        ((self.flags & FLAG_PRIORITY_MASK) >> 4) as u8
    }

    /// Parse and validate the fixed header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::MalformedHeader(format!(
                "short header: {} bytes",
                data.len()
            )));
        }
        if data[0..4] != PROTOCOL_ID {
            return Err(Error::MalformedHeader("bad protocol id".into()));
        }
        let structure_size = read_u16_le(&data[4..6]);
        if structure_size as usize != HEADER_LEN {
            return Err(Error::MalformedHeader(format!(
                "header structure size must be 64, got {structure_size}"
            )));
        }

        let credit_charge = read_u16_le(&data[6..8]);
        let status_raw = read_u32_le(&data[8..12]);
        let command_code = read_u16_le(&data[12..14]);
        let command = Command::from_code(command_code).ok_or_else(|| {
            Error::MalformedHeader(format!("unknown command code 0x{command_code:04x}"))
        })?;
        let credits = read_u16_le(&data[14..16]);
        let flags = read_u32_le(&data[16..20]);
        if flags & !FLAGS_MASK != 0 {
            return Err(Error::MalformedHeader(format!(
                "undefined flag bits 0x{:08x}",
                flags & !FLAGS_MASK
            )));
        }
        let next_command = read_u32_le(&data[20..24]);
        let message_id = read_u64_le(&data[24..32]);

        let is_response = flags & FLAG_RESPONSE != 0;
        let is_async = flags & FLAG_ASYNC != 0;

        // In requests the high half of the status word is reserved.
        if !is_response && status_raw >> 16 != 0 {
            return Err(Error::MalformedHeader(
                "non-zero reserved bytes in channel sequence field".into(),
            ));
        }

        let (tree_id, async_id) = if is_async {
            (0, read_u64_le(&data[32..40]))
        } else {
            let reserved = read_u32_le(&data[32..36]);
            if reserved != 0 {
                return Err(Error::MalformedHeader(
                    "non-zero reserved bytes before tree id".into(),
                ));
            }
            (read_u32_le(&data[36..40]), 0)
        };

        let session_id = read_u64_le(&data[40..48]);
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&data[48..64]);

        Ok(Self {
            credit_charge,
            status: NtStatus(status_raw),
            channel_sequence: status_raw as u16,
            command,
            credits,
            flags,
            next_command,
            message_id,
            tree_id,
            async_id,
            session_id,
            signature,
        })
    }

    /// Serialize the header into its 64-byte wire form.
    pub fn serialize(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&PROTOCOL_ID);
        out[4..6].copy_from_slice(&(HEADER_LEN as u16).to_le_bytes());
        out[6..8].copy_from_slice(&self.credit_charge.to_le_bytes());
        let status_raw = if self.is_response() {
            self.status.0
        } else {
            self.channel_sequence as u32
        };
        out[8..12].copy_from_slice(&status_raw.to_le_bytes());
        out[12..14].copy_from_slice(&self.command.code().to_le_bytes());
        out[14..16].copy_from_slice(&self.credits.to_le_bytes());
        out[16..20].copy_from_slice(&self.flags.to_le_bytes());
        out[20..24].copy_from_slice(&self.next_command.to_le_bytes());
        out[24..32].copy_from_slice(&self.message_id.to_le_bytes());
        if self.is_async() {
            out[32..40].copy_from_slice(&self.async_id.to_le_bytes());
        } else {
            // 32..36 reserved, zero
            out[36..40].copy_from_slice(&self.tree_id.to_le_bytes());
        }
        out[40..48].copy_from_slice(&self.session_id.to_le_bytes());
        out[48..64].copy_from_slice(&self.signature);
        out
    }
}
