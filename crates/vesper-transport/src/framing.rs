//! Session service record framing.
//!
//! Every record on the wire starts with a four-byte header: a record type
//! octet followed by a 24-bit big-endian length. A Session Message
//! (type 0x00) carries one complete application payload of exactly that
//! length; the remaining record types are session service control traffic
//! ([RFC 1002] 4.3.2). Direct-TCP operation uses only Session Messages
//! and Keepalives.
//!
//! The [`Framer`] is a pure buffering transformation: it never blocks,
//! never allocates a declared length before the bound check, and yields
//! complete records as soon as their bytes are buffered. Waiting for more
//! bytes is the socket's job, not the framer's.

use bytes::{Buf, BytesMut};

use crate::{Error, Result};

/// Record type: a complete application payload follows.
pub const SESSION_MESSAGE: u8 = 0x00;
/// Record type: request to establish a session with a named endpoint.
pub const SESSION_REQUEST: u8 = 0x81;
/// Record type: the session request was accepted.
pub const POSITIVE_RESPONSE: u8 = 0x82;
/// Record type: the session request was denied.
pub const NEGATIVE_RESPONSE: u8 = 0x83;
/// Record type: the session should be re-established elsewhere.
pub const RETARGET_RESPONSE: u8 = 0x84;
/// Record type: liveness probe; carries nothing.
pub const KEEPALIVE: u8 = 0x85;

/// Negative response: not listening on the called name.
pub const ERR_NOT_LISTENING_CALLED: u8 = 0x80;
/// Negative response: not listening for the calling name.
pub const ERR_NOT_LISTENING_CALLING: u8 = 0x81;
/// Negative response: called name not present.
pub const ERR_NAME_NOT_PRESENT: u8 = 0x82;
/// Negative response: insufficient resources.
pub const ERR_INSUFFICIENT_RESOURCES: u8 = 0x83;
/// Negative response: unspecified error.
pub const ERR_UNSPECIFIED: u8 = 0x8F;

/// Length of an encoded (level-two) endpoint name in a session request.
pub const ENCODED_NAME_LEN: usize = 34;

/// Hard ceiling on a record's declared length: 24 bits.
pub const MAX_RECORD_LEN: usize = 0x00FF_FFFF;

/// Default maximum accepted payload, the full 24-bit range.
pub const DEFAULT_MAX_PAYLOAD: usize = MAX_RECORD_LEN;

/// One complete session service record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// An application payload.
    Message(Vec<u8>),
    /// Session establishment request with the encoded called and calling
    /// names.
    SessionRequest {
        /// Encoded name of the endpoint being called.
        called: Vec<u8>,
        /// Encoded name of the caller.
        calling: Vec<u8>,
    },
    /// The session request was accepted.
    PositiveResponse,
    /// The session request was denied, with an error code.
    NegativeResponse(u8),
    /// Re-establish the session against another address and port.
    Retarget {
        /// IPv4 address to contact instead.
        address: [u8; 4],
        /// Port to contact instead.
        port: u16,
    },
    /// Liveness probe.
    Keepalive,
}

impl Record {
    /// Encode this record into its wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Record::Message(payload) => {
                if payload.len() > MAX_RECORD_LEN {
                    return Err(Error::Framing(format!(
                        "payload of {} bytes exceeds the 24-bit length field",
                        payload.len()
                    )));
                }
                let mut out = Vec::with_capacity(4 + payload.len());
                out.push(SESSION_MESSAGE);
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
                out.extend_from_slice(payload);
                Ok(out)
            }
            Record::SessionRequest { called, calling } => {
                let length = called.len() + calling.len();
                let mut out = Vec::with_capacity(4 + length);
                out.push(SESSION_REQUEST);
                out.extend_from_slice(&(length as u32).to_be_bytes()[1..]);
                out.extend_from_slice(called);
                out.extend_from_slice(calling);
                Ok(out)
            }
            Record::PositiveResponse => Ok(vec![POSITIVE_RESPONSE, 0, 0, 0]),
            Record::NegativeResponse(code) => Ok(vec![NEGATIVE_RESPONSE, 0, 0, 1, *code]),
            Record::Retarget { address, port } => {
                let mut out = vec![RETARGET_RESPONSE, 0, 0, 6];
                out.extend_from_slice(address);
                out.extend_from_slice(&port.to_be_bytes());
                Ok(out)
            }
            Record::Keepalive => Ok(vec![KEEPALIVE, 0, 0, 0]),
        }
    }
}

/// Stream reassembler for session service records.
pub struct Framer {
    buffer: BytesMut,
    max_payload: usize,
}

impl Framer {
    /// Create a framer accepting payloads up to `max_payload` bytes
    /// (clamped to the 24-bit record limit).
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_payload: max_payload.min(MAX_RECORD_LEN),
        }
    }

    /// Wrap an application payload in a Session Message record.
    pub fn frame(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > self.max_payload {
            return Err(Error::Framing(format!(
                "payload of {} bytes exceeds the {}-byte maximum",
                payload.len(),
                self.max_payload
            )));
        }
        Record::Message(payload.to_vec()).encode()
    }

    /// Buffer an arbitrary chunk of the inbound byte stream.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Yield the next complete record, or `None` until more bytes arrive.
    ///
    /// A declared length beyond the configured maximum fails before any
    /// buffer of that size exists, bounding what a hostile peer can make
    /// us allocate.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let record_type = self.buffer[0];
        let declared =
            u32::from_be_bytes([0, self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
        if declared > self.max_payload {
            return Err(Error::Framing(format!(
                "declared length {declared} exceeds the {}-byte maximum",
                self.max_payload
            )));
        }
        if self.buffer.len() < 4 + declared {
            return Ok(None);
        }

        let mut record = self.buffer.split_to(4 + declared);
        record.advance(4);
        let body = record.to_vec();

        match record_type {
            SESSION_MESSAGE => Ok(Some(Record::Message(body))),
            SESSION_REQUEST => {
                if body.len() < 2 * ENCODED_NAME_LEN {
                    return Err(Error::Framing(format!(
                        "session request of {} bytes cannot hold two encoded names",
                        body.len()
                    )));
                }
                let calling = body[ENCODED_NAME_LEN..2 * ENCODED_NAME_LEN].to_vec();
                let called = body[..ENCODED_NAME_LEN].to_vec();
                Ok(Some(Record::SessionRequest { called, calling }))
            }
            POSITIVE_RESPONSE => {
                if !body.is_empty() {
                    return Err(Error::Framing("positive response with a body".into()));
                }
                Ok(Some(Record::PositiveResponse))
            }
            NEGATIVE_RESPONSE => {
                if body.len() != 1 {
                    return Err(Error::Framing("negative response without its code".into()));
                }
                Ok(Some(Record::NegativeResponse(body[0])))
            }
            RETARGET_RESPONSE => {
                if body.len() != 6 {
                    return Err(Error::Framing("retarget response must carry 6 bytes".into()));
                }
                let mut address = [0u8; 4];
                address.copy_from_slice(&body[..4]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                Ok(Some(Record::Retarget { address, port }))
            }
            KEEPALIVE => {
                if !body.is_empty() {
                    return Err(Error::Framing("keepalive with a body".into()));
                }
                Ok(Some(Record::Keepalive))
            }
            other => Err(Error::Framing(format!(
                "unknown session service record type 0x{other:02x}"
            ))),
        }
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let framer = Framer::default();
        let wire = framer.frame(b"payload").unwrap();
        assert_eq!(wire[0], SESSION_MESSAGE);
        assert_eq!(&wire[1..4], &[0, 0, 7]);
        assert_eq!(&wire[4..], b"payload");
    }

    #[test]
    fn test_byte_at_a_time_reassembly() {
        let framer = Framer::default();
        let payload = b"one complete message".to_vec();
        let wire = framer.frame(&payload).unwrap();

        let mut rx = Framer::default();
        let mut yielded = Vec::new();
        for &byte in &wire {
            rx.feed(&[byte]);
            while let Some(record) = rx.next_record().unwrap() {
                yielded.push(record);
            }
        }
        assert_eq!(yielded, vec![Record::Message(payload)]);
    }

    #[test]
    fn test_multiple_records_in_one_chunk() {
        let framer = Framer::default();
        let mut stream = framer.frame(b"first").unwrap();
        stream.extend(framer.frame(b"second").unwrap());
        stream.extend(Record::Keepalive.encode().unwrap());

        let mut rx = Framer::default();
        rx.feed(&stream);
        assert_eq!(
            rx.next_record().unwrap(),
            Some(Record::Message(b"first".to_vec()))
        );
        assert_eq!(
            rx.next_record().unwrap(),
            Some(Record::Message(b"second".to_vec()))
        );
        assert_eq!(rx.next_record().unwrap(), Some(Record::Keepalive));
        assert_eq!(rx.next_record().unwrap(), None);
    }

    #[test]
    fn test_empty_payload() {
        let framer = Framer::default();
        let wire = framer.frame(b"").unwrap();

        let mut rx = Framer::default();
        rx.feed(&wire);
        assert_eq!(rx.next_record().unwrap(), Some(Record::Message(Vec::new())));
    }

    #[test]
    fn test_oversized_declared_length_rejected_early() {
        let mut rx = Framer::new(1024);
        // Declares 2^24 - 1 bytes; the framer must fail on the header
        // alone instead of waiting for the body.
        rx.feed(&[SESSION_MESSAGE, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(rx.next_record(), Err(Error::Framing(_))));
    }

    #[test]
    fn test_frame_rejects_oversized_payload() {
        let framer = Framer::new(8);
        assert!(framer.frame(&[0u8; 9]).is_err());
        assert!(framer.frame(&[0u8; 8]).is_ok());
    }

    #[test]
    fn test_session_request_roundtrip() {
        let record = Record::SessionRequest {
            called: vec![0x20; ENCODED_NAME_LEN],
            calling: vec![0x41; ENCODED_NAME_LEN],
        };
        let wire = record.encode().unwrap();
        assert_eq!(wire[0], SESSION_REQUEST);
        assert_eq!(&wire[1..4], &[0, 0, 68]);

        let mut rx = Framer::default();
        rx.feed(&wire);
        assert_eq!(rx.next_record().unwrap(), Some(record));
    }

    #[test]
    fn test_negative_response_roundtrip() {
        let record = Record::NegativeResponse(ERR_INSUFFICIENT_RESOURCES);
        let wire = record.encode().unwrap();

        let mut rx = Framer::default();
        rx.feed(&wire);
        assert_eq!(rx.next_record().unwrap(), Some(record));
    }

    #[test]
    fn test_retarget_roundtrip() {
        let record = Record::Retarget {
            address: [10, 0, 0, 7],
            port: 445,
        };
        let wire = record.encode().unwrap();

        let mut rx = Framer::default();
        rx.feed(&wire);
        assert_eq!(rx.next_record().unwrap(), Some(record));
    }

    #[test]
    fn test_unknown_record_type_rejected() {
        let mut rx = Framer::default();
        rx.feed(&[0x42, 0, 0, 0]);
        assert!(matches!(rx.next_record(), Err(Error::Framing(_))));
    }

    #[test]
    fn test_partial_frame_keeps_waiting() {
        let framer = Framer::default();
        let wire = framer.frame(b"split").unwrap();

        let mut rx = Framer::default();
        rx.feed(&wire[..6]);
        assert_eq!(rx.next_record().unwrap(), None);
        rx.feed(&wire[6..]);
        assert_eq!(
            rx.next_record().unwrap(),
            Some(Record::Message(b"split".to_vec()))
        );
    }
}
