//! Compound chain assembly and decomposition.
//!
//! Multiple logical messages travel in one transport payload by chaining
//! their headers: each header's next-command field holds the 8-byte-aligned
//! offset from the start of that header to the start of the next one; zero
//! terminates the chain ([MS-SMB2] 3.2.4.1.4). A message carrying the
//! related flag operates on the resource context established by its
//! predecessor instead of restating identifying fields.
//!
//! The functions here are stateless; every byte of state lives in the
//! buffer being processed.

use crate::header::{Header, HEADER_LEN};
use crate::wire::align_up;
use crate::{Error, Result};

/// Alignment of chained messages within a compound payload.
pub const COMPOUND_ALIGNMENT: usize = 8;

/// A header plus the raw body bytes that follow it. Inside a compound
/// payload the body keeps its inter-message padding so that re-encoding
/// reproduces the exact signed region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    /// Message header.
    pub header: Header,
    /// Raw body bytes (everything between this header and the next).
    pub body: Vec<u8>,
}

impl LogicalMessage {
    /// Create a logical message from a header and raw body bytes.
    pub fn new(header: Header, body: Vec<u8>) -> Self {
        Self { header, body }
    }

    /// Serialize header and body into contiguous wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.header.serialize());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Lay `parts` consecutively into one transport payload, computing the
/// aligned next-command offsets. Related flags on the headers pass through
/// untouched; the final message's next-command field is forced to zero.
pub fn compound(parts: &[LogicalMessage]) -> Result<Vec<u8>> {
    if parts.is_empty() {
        return Err(Error::Compounding("empty compound chain".into()));
    }

    let mut out = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        let start = out.len();
        out.extend_from_slice(&part.header.serialize());
        out.extend_from_slice(&part.body);

        let next_command = if i + 1 < parts.len() {
            out.resize(start + align_up(out.len() - start, COMPOUND_ALIGNMENT), 0);
            (out.len() - start) as u32
        } else {
            0
        };
        out[start + 20..start + 24].copy_from_slice(&next_command.to_le_bytes());
    }
    Ok(out)
}

/// Walk a compound chain, splitting the payload back into its logical
/// messages. Fails on offsets that are unaligned, regress, overlap a
/// header, or point outside the buffer, and on chains longer than
/// `max_parts`.
pub fn decompound(payload: &[u8], max_parts: usize) -> Result<Vec<LogicalMessage>> {
    let mut parts = Vec::new();
    let mut offset = 0usize;

    loop {
        if parts.len() >= max_parts {
            return Err(Error::Compounding(format!(
                "chain exceeds {max_parts} messages"
            )));
        }

        let remaining = &payload[offset..];
        let header = Header::parse(remaining)?;
        let next_command = header.next_command as usize;

        if next_command == 0 {
            parts.push(LogicalMessage::new(header, remaining[HEADER_LEN..].to_vec()));
            return Ok(parts);
        }

        if next_command % COMPOUND_ALIGNMENT != 0 {
            return Err(Error::Compounding(format!(
                "next-command offset {next_command} is not {COMPOUND_ALIGNMENT}-byte aligned"
            )));
        }
        if next_command < HEADER_LEN {
            return Err(Error::Compounding(format!(
                "next-command offset {next_command} overlaps its own header"
            )));
        }
        if next_command > remaining.len() {
            return Err(Error::Compounding(format!(
                "next-command offset {next_command} points past the end of the payload"
            )));
        }

        parts.push(LogicalMessage::new(
            header,
            remaining[HEADER_LEN..next_command].to_vec(),
        ));
        offset += next_command;
    }
}
