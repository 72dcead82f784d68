//! Command body parsing and serialization.
//!
//! Typed codecs exist for the substrate commands the engine itself drives:
//! NEGOTIATE, SESSION_SETUP, LOGOFF, ECHO, CANCEL, and the generic error
//! response. Every other command decodes to an opaque body and is carried
//! through to the application handler untouched; the engine sequences,
//! throttles, and authenticates such messages but does not interpret them.
//!
//! Buffer offsets on the wire are relative to the start of the 64-byte
//! message header, so the codec assumes each body sits immediately after
//! its header. Declared offsets and lengths are validated against the
//! actual buffer bounds before any slice is taken.

use crate::header::{Command, HEADER_LEN};
use crate::status::NtStatus;
use crate::wire::{align_up, check_len, read_u16_le, read_u32_le, read_u64_le};
use crate::{Error, Result};

/// Security mode bit: signing enabled.
pub const SECURITY_MODE_SIGNING_ENABLED: u16 = 0x0001;
/// Security mode bit: signing required.
pub const SECURITY_MODE_SIGNING_REQUIRED: u16 = 0x0002;

/// Capability bit: DFS support.
pub const CAP_DFS: u32 = 0x0000_0001;
/// Capability bit: leasing support.
pub const CAP_LEASING: u32 = 0x0000_0002;
/// Capability bit: multi-credit (large MTU) support.
pub const CAP_LARGE_MTU: u32 = 0x0000_0004;
/// Capability bit: multi-channel support.
pub const CAP_MULTI_CHANNEL: u32 = 0x0000_0008;
/// Capability bit: persistent handles.
pub const CAP_PERSISTENT_HANDLES: u32 = 0x0000_0010;
/// Capability bit: directory leasing.
pub const CAP_DIRECTORY_LEASING: u32 = 0x0000_0020;
/// Capability bit: encryption support.
pub const CAP_ENCRYPTION: u32 = 0x0000_0040;

/// Session setup request flag: bind this session to another connection.
pub const SESSION_SETUP_FLAG_BINDING: u8 = 0x01;

/// Session flags bit: the session is a guest session.
pub const SESSION_FLAG_IS_GUEST: u16 = 0x0001;
/// Session flags bit: the session is anonymous.
pub const SESSION_FLAG_IS_NULL: u16 = 0x0002;
/// Session flags bit: all session traffic must be encrypted.
pub const SESSION_FLAG_ENCRYPT_DATA: u16 = 0x0004;

/// Negotiate context type: pre-authentication integrity capabilities.
pub const NEG_CTX_PREAUTH_INTEGRITY: u16 = 0x0001;
/// Negotiate context type: encryption capabilities.
pub const NEG_CTX_ENCRYPTION: u16 = 0x0002;

/// Hash algorithm id for SHA-512 in the pre-auth integrity context.
pub const HASH_ALGORITHM_SHA512: u16 = 0x0001;

/// A negotiate context: type tag plus raw context data ([MS-SMB2] 2.2.3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateContext {
    /// Context type tag.
    pub context_type: u16,
    /// Context data, interpreted per type.
    pub data: Vec<u8>,
}

impl NegotiateContext {
    /// Build a pre-auth integrity capabilities context offering SHA-512
    /// with the given salt.
    pub fn preauth_integrity(salt: &[u8]) -> Self {
        let mut data = Vec::with_capacity(6 + salt.len());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&(salt.len() as u16).to_le_bytes());
        data.extend_from_slice(&HASH_ALGORITHM_SHA512.to_le_bytes());
        data.extend_from_slice(salt);
        Self {
            context_type: NEG_CTX_PREAUTH_INTEGRITY,
            data,
        }
    }

    /// Build an encryption capabilities context carrying `ciphers` in
    /// preference order.
    pub fn encryption(ciphers: &[u16]) -> Self {
        let mut data = Vec::with_capacity(2 + 2 * ciphers.len());
        data.extend_from_slice(&(ciphers.len() as u16).to_le_bytes());
        for &cipher in ciphers {
            data.extend_from_slice(&cipher.to_le_bytes());
        }
        Self {
            context_type: NEG_CTX_ENCRYPTION,
            data,
        }
    }

    /// Cipher ids carried by an encryption capabilities context, or `None`
    /// if this context is of another type or malformed.
    pub fn ciphers(&self) -> Option<Vec<u16>> {
        if self.context_type != NEG_CTX_ENCRYPTION || self.data.len() < 2 {
            return None;
        }
        let count = read_u16_le(&self.data[0..2]) as usize;
        if self.data.len() < 2 + 2 * count {
            return None;
        }
        Some(
            (0..count)
                .map(|i| read_u16_le(&self.data[2 + 2 * i..4 + 2 * i]))
                .collect(),
        )
    }

    /// Hash algorithm ids carried by a pre-auth integrity context, or
    /// `None` if this context is of another type or malformed.
    pub fn hash_algorithms(&self) -> Option<Vec<u16>> {
        if self.context_type != NEG_CTX_PREAUTH_INTEGRITY || self.data.len() < 4 {
            return None;
        }
        let count = read_u16_le(&self.data[0..2]) as usize;
        if self.data.len() < 4 + 2 * count {
            return None;
        }
        Some(
            (0..count)
                .map(|i| read_u16_le(&self.data[4 + 2 * i..6 + 2 * i]))
                .collect(),
        )
    }
}

/// NEGOTIATE request ([MS-SMB2] 2.2.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateRequest {
    /// Client security mode bits.
    pub security_mode: u16,
    /// Client capability bits.
    pub capabilities: u32,
    /// Client GUID.
    pub client_guid: [u8; 16],
    /// Offered dialect revision codes.
    pub dialects: Vec<u16>,
    /// Negotiate contexts (3.1.1 only).
    pub contexts: Vec<NegotiateContext>,
}

/// NEGOTIATE response ([MS-SMB2] 2.2.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateResponse {
    /// Server security mode bits.
    pub security_mode: u16,
    /// Selected dialect revision code.
    pub dialect: u16,
    /// Server GUID.
    pub server_guid: [u8; 16],
    /// Server capability bits.
    pub capabilities: u32,
    /// Maximum transaction size in bytes.
    pub max_transact_size: u32,
    /// Maximum read size in bytes.
    pub max_read_size: u32,
    /// Maximum write size in bytes.
    pub max_write_size: u32,
    /// Server system time (FILETIME).
    pub system_time: u64,
    /// Server start time (FILETIME).
    pub server_start_time: u64,
    /// Initial security token for the authentication exchange.
    pub security_buffer: Vec<u8>,
    /// Negotiate contexts (3.1.1 only).
    pub contexts: Vec<NegotiateContext>,
}

/// SESSION_SETUP request ([MS-SMB2] 2.2.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetupRequest {
    /// Request flags; bit 0 requests multi-channel binding.
    pub flags: u8,
    /// Client security mode bits.
    pub security_mode: u8,
    /// Client capability bits.
    pub capabilities: u32,
    /// Session to resume after a previous connection's loss.
    pub previous_session_id: u64,
    /// Opaque authentication token.
    pub security_buffer: Vec<u8>,
}

impl SessionSetupRequest {
    /// Whether this request asks to bind the session to this connection.
    pub fn is_binding(&self) -> bool {
        self.flags & SESSION_SETUP_FLAG_BINDING != 0
    }
}

/// SESSION_SETUP response ([MS-SMB2] 2.2.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetupResponse {
    /// Session flags (guest, null, encrypt-data).
    pub session_flags: u16,
    /// Opaque authentication token for the next round.
    pub security_buffer: Vec<u8>,
}

/// Generic error response ([MS-SMB2] 2.2.2); the status lives in the
/// header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Number of error contexts in `data`.
    pub error_context_count: u8,
    /// Error context data, opaque to the engine.
    pub data: Vec<u8>,
}

impl ErrorResponse {
    /// An empty error response.
    pub fn empty() -> Self {
        Self {
            error_context_count: 0,
            data: Vec::new(),
        }
    }
}

/// A decoded command body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// NEGOTIATE request.
    NegotiateRequest(NegotiateRequest),
    /// NEGOTIATE response.
    NegotiateResponse(NegotiateResponse),
    /// SESSION_SETUP request.
    SessionSetupRequest(SessionSetupRequest),
    /// SESSION_SETUP response.
    SessionSetupResponse(SessionSetupResponse),
    /// LOGOFF request.
    LogoffRequest,
    /// LOGOFF response.
    LogoffResponse,
    /// ECHO request.
    EchoRequest,
    /// ECHO response.
    EchoResponse,
    /// CANCEL request (never answered).
    CancelRequest,
    /// Error response for any command.
    ErrorResponse(ErrorResponse),
    /// Any command the engine does not interpret.
    Opaque(Vec<u8>),
}

impl Body {
    /// Decode the body of `command` from `data` (the bytes following the
    /// 64-byte header). `status` disambiguates error responses from
    /// command-specific response shapes.
    pub fn decode(
        command: Command,
        is_response: bool,
        status: NtStatus,
        data: &[u8],
    ) -> Result<Body> {
        // An error status carries the generic error body, except for the
        // session-setup continuation status, which keeps its real shape.
        if is_response && status.is_error() && status != NtStatus::MORE_PROCESSING_REQUIRED {
            return decode_error_response(data).map(Body::ErrorResponse);
        }

        match (command, is_response) {
            (Command::Negotiate, false) => decode_negotiate_request(data),
            (Command::Negotiate, true) => decode_negotiate_response(data),
            (Command::SessionSetup, false) => decode_session_setup_request(data),
            (Command::SessionSetup, true) => decode_session_setup_response(data),
            (Command::Logoff, false) => {
                decode_empty(data).map(|()| Body::LogoffRequest)
            }
            (Command::Logoff, true) => decode_empty(data).map(|()| Body::LogoffResponse),
            (Command::Echo, false) => decode_empty(data).map(|()| Body::EchoRequest),
            (Command::Echo, true) => decode_empty(data).map(|()| Body::EchoResponse),
            (Command::Cancel, false) => decode_empty(data).map(|()| Body::CancelRequest),
            _ => Ok(Body::Opaque(data.to_vec())),
        }
    }

    /// Encode this body into the bytes that follow the header.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Body::NegotiateRequest(req) => encode_negotiate_request(req),
            Body::NegotiateResponse(resp) => encode_negotiate_response(resp),
            Body::SessionSetupRequest(req) => encode_session_setup_request(req),
            Body::SessionSetupResponse(resp) => encode_session_setup_response(resp),
            Body::LogoffRequest
            | Body::LogoffResponse
            | Body::EchoRequest
            | Body::EchoResponse
            | Body::CancelRequest => encode_empty(),
            Body::ErrorResponse(resp) => encode_error_response(resp),
            Body::Opaque(data) => data.clone(),
        }
    }
}

// === NEGOTIATE request ===

const NEGOTIATE_REQUEST_SIZE: usize = 36;
/// Dialect revision code for SMB 3.1.1, which gates negotiate contexts.
const DIALECT_311: u16 = 0x0311;

fn decode_negotiate_request(data: &[u8]) -> Result<Body> {
    check_len(data, NEGOTIATE_REQUEST_SIZE)?;
    expect_structure_size(data, 36, "NEGOTIATE request")?;

    let dialect_count = read_u16_le(&data[2..4]) as usize;
    if dialect_count == 0 {
        return Err(Error::MalformedBody("empty dialect list".into()));
    }
    let security_mode = read_u16_le(&data[4..6]);
    expect_zero16(&data[6..8], "NEGOTIATE request reserved")?;
    let capabilities = read_u32_le(&data[8..12]);
    let mut client_guid = [0u8; 16];
    client_guid.copy_from_slice(&data[12..28]);

    check_len(data, NEGOTIATE_REQUEST_SIZE + 2 * dialect_count)?;
    let dialects: Vec<u16> = (0..dialect_count)
        .map(|i| read_u16_le(&data[36 + 2 * i..38 + 2 * i]))
        .collect();

    let contexts = if dialects.contains(&DIALECT_311) {
        let context_offset = read_u32_le(&data[28..32]) as usize;
        let context_count = read_u16_le(&data[32..34]);
        if context_count > 0 {
            decode_negotiate_contexts(data, context_offset, context_count)?
        } else {
            Vec::new()
        }
    } else {
        // Without 3.1.1 on offer these bytes are the client start time,
        // which must be zero.
        if read_u64_le(&data[28..36]) != 0 {
            return Err(Error::MalformedBody(
                "non-zero client start time in NEGOTIATE request".into(),
            ));
        }
        Vec::new()
    };

    Ok(Body::NegotiateRequest(NegotiateRequest {
        security_mode,
        capabilities,
        client_guid,
        dialects,
        contexts,
    }))
}

fn encode_negotiate_request(req: &NegotiateRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(NEGOTIATE_REQUEST_SIZE + 2 * req.dialects.len());
    out.extend_from_slice(&36u16.to_le_bytes());
    out.extend_from_slice(&(req.dialects.len() as u16).to_le_bytes());
    out.extend_from_slice(&req.security_mode.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&req.capabilities.to_le_bytes());
    out.extend_from_slice(&req.client_guid);

    if req.contexts.is_empty() {
        out.extend_from_slice(&0u64.to_le_bytes());
        for &dialect in &req.dialects {
            out.extend_from_slice(&dialect.to_le_bytes());
        }
    } else {
        let dialects_end = NEGOTIATE_REQUEST_SIZE + 2 * req.dialects.len();
        let context_offset = HEADER_LEN + align_up(dialects_end, 8);
        out.extend_from_slice(&(context_offset as u32).to_le_bytes());
        out.extend_from_slice(&(req.contexts.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        for &dialect in &req.dialects {
            out.extend_from_slice(&dialect.to_le_bytes());
        }
        out.resize(align_up(out.len(), 8), 0);
        encode_negotiate_contexts(&mut out, &req.contexts);
    }
    out
}

// === NEGOTIATE response ===

const NEGOTIATE_RESPONSE_SIZE: usize = 64;
const NEGOTIATE_RESPONSE_BUFFER_OFFSET: usize = HEADER_LEN + NEGOTIATE_RESPONSE_SIZE;

fn decode_negotiate_response(data: &[u8]) -> Result<Body> {
    check_len(data, NEGOTIATE_RESPONSE_SIZE)?;
    expect_structure_size(data, 65, "NEGOTIATE response")?;

    let security_mode = read_u16_le(&data[2..4]);
    let dialect = read_u16_le(&data[4..6]);
    let context_count = read_u16_le(&data[6..8]);
    let mut server_guid = [0u8; 16];
    server_guid.copy_from_slice(&data[8..24]);
    let capabilities = read_u32_le(&data[24..28]);
    let max_transact_size = read_u32_le(&data[28..32]);
    let max_read_size = read_u32_le(&data[32..36]);
    let max_write_size = read_u32_le(&data[36..40]);
    let system_time = read_u64_le(&data[40..48]);
    let server_start_time = read_u64_le(&data[48..56]);
    let security_buffer = read_buffer16(data, 56, 58, "NEGOTIATE response security buffer")?;
    let context_offset = read_u32_le(&data[60..64]) as usize;

    let contexts = if dialect == DIALECT_311 && context_count > 0 {
        decode_negotiate_contexts(data, context_offset, context_count)?
    } else {
        Vec::new()
    };

    Ok(Body::NegotiateResponse(NegotiateResponse {
        security_mode,
        dialect,
        server_guid,
        capabilities,
        max_transact_size,
        max_read_size,
        max_write_size,
        system_time,
        server_start_time,
        security_buffer,
        contexts,
    }))
}

fn encode_negotiate_response(resp: &NegotiateResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(NEGOTIATE_RESPONSE_SIZE + resp.security_buffer.len());
    out.extend_from_slice(&65u16.to_le_bytes());
    out.extend_from_slice(&resp.security_mode.to_le_bytes());
    out.extend_from_slice(&resp.dialect.to_le_bytes());
    out.extend_from_slice(&(resp.contexts.len() as u16).to_le_bytes());
    out.extend_from_slice(&resp.server_guid);
    out.extend_from_slice(&resp.capabilities.to_le_bytes());
    out.extend_from_slice(&resp.max_transact_size.to_le_bytes());
    out.extend_from_slice(&resp.max_read_size.to_le_bytes());
    out.extend_from_slice(&resp.max_write_size.to_le_bytes());
    out.extend_from_slice(&resp.system_time.to_le_bytes());
    out.extend_from_slice(&resp.server_start_time.to_le_bytes());
    out.extend_from_slice(&(NEGOTIATE_RESPONSE_BUFFER_OFFSET as u16).to_le_bytes());
    out.extend_from_slice(&(resp.security_buffer.len() as u16).to_le_bytes());

    let context_offset = if resp.contexts.is_empty() {
        0u32
    } else {
        let buffer_end = NEGOTIATE_RESPONSE_SIZE + resp.security_buffer.len();
        (HEADER_LEN + align_up(buffer_end, 8)) as u32
    };
    out.extend_from_slice(&context_offset.to_le_bytes());
    out.extend_from_slice(&resp.security_buffer);

    if !resp.contexts.is_empty() {
        out.resize(align_up(out.len(), 8), 0);
        encode_negotiate_contexts(&mut out, &resp.contexts);
    }
    out
}

// === SESSION_SETUP ===

const SESSION_SETUP_REQUEST_SIZE: usize = 24;
const SESSION_SETUP_REQUEST_BUFFER_OFFSET: usize = HEADER_LEN + SESSION_SETUP_REQUEST_SIZE;
const SESSION_SETUP_RESPONSE_SIZE: usize = 8;
const SESSION_SETUP_RESPONSE_BUFFER_OFFSET: usize = HEADER_LEN + SESSION_SETUP_RESPONSE_SIZE;

fn decode_session_setup_request(data: &[u8]) -> Result<Body> {
    check_len(data, SESSION_SETUP_REQUEST_SIZE)?;
    expect_structure_size(data, 25, "SESSION_SETUP request")?;

    let flags = data[2];
    let security_mode = data[3];
    let capabilities = read_u32_le(&data[4..8]);
    // data[8..12] is the channel field, reserved and ignored.
    let security_buffer = read_buffer16(data, 12, 14, "SESSION_SETUP security buffer")?;
    let previous_session_id = read_u64_le(&data[16..24]);

    Ok(Body::SessionSetupRequest(SessionSetupRequest {
        flags,
        security_mode,
        capabilities,
        previous_session_id,
        security_buffer,
    }))
}

fn encode_session_setup_request(req: &SessionSetupRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(SESSION_SETUP_REQUEST_SIZE + req.security_buffer.len());
    out.extend_from_slice(&25u16.to_le_bytes());
    out.push(req.flags);
    out.push(req.security_mode);
    out.extend_from_slice(&req.capabilities.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(SESSION_SETUP_REQUEST_BUFFER_OFFSET as u16).to_le_bytes());
    out.extend_from_slice(&(req.security_buffer.len() as u16).to_le_bytes());
    out.extend_from_slice(&req.previous_session_id.to_le_bytes());
    out.extend_from_slice(&req.security_buffer);
    out
}

fn decode_session_setup_response(data: &[u8]) -> Result<Body> {
    check_len(data, SESSION_SETUP_RESPONSE_SIZE)?;
    expect_structure_size(data, 9, "SESSION_SETUP response")?;

    let session_flags = read_u16_le(&data[2..4]);
    let security_buffer = read_buffer16(data, 4, 6, "SESSION_SETUP security buffer")?;

    Ok(Body::SessionSetupResponse(SessionSetupResponse {
        session_flags,
        security_buffer,
    }))
}

fn encode_session_setup_response(resp: &SessionSetupResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(SESSION_SETUP_RESPONSE_SIZE + resp.security_buffer.len());
    out.extend_from_slice(&9u16.to_le_bytes());
    out.extend_from_slice(&resp.session_flags.to_le_bytes());
    out.extend_from_slice(&(SESSION_SETUP_RESPONSE_BUFFER_OFFSET as u16).to_le_bytes());
    out.extend_from_slice(&(resp.security_buffer.len() as u16).to_le_bytes());
    out.extend_from_slice(&resp.security_buffer);
    out
}

// === LOGOFF / ECHO / CANCEL (empty four-byte bodies) ===

fn decode_empty(data: &[u8]) -> Result<()> {
    check_len(data, 4)?;
    expect_structure_size(data, 4, "empty body")?;
    expect_zero16(&data[2..4], "empty body reserved")?;
    Ok(())
}

fn encode_empty() -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.extend_from_slice(&4u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

// === Error response ===

fn decode_error_response(data: &[u8]) -> Result<ErrorResponse> {
    check_len(data, 8)?;
    expect_structure_size(data, 9, "error response")?;

    let error_context_count = data[2];
    let byte_count = read_u32_le(&data[4..8]) as usize;
    let data = if byte_count == 0 {
        Vec::new()
    } else {
        check_len(data, 8 + byte_count)?;
        data[8..8 + byte_count].to_vec()
    };

    Ok(ErrorResponse {
        error_context_count,
        data,
    })
}

fn encode_error_response(resp: &ErrorResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + resp.data.len());
    out.extend_from_slice(&9u16.to_le_bytes());
    out.push(resp.error_context_count);
    out.push(0);
    out.extend_from_slice(&(resp.data.len() as u32).to_le_bytes());
    if resp.data.is_empty() {
        // The structure size of 9 promises at least one byte of ErrorData.
        out.push(0);
    } else {
        out.extend_from_slice(&resp.data);
    }
    out
}

// === Negotiate contexts ===

fn decode_negotiate_contexts(
    data: &[u8],
    wire_offset: usize,
    count: u16,
) -> Result<Vec<NegotiateContext>> {
    if wire_offset < HEADER_LEN || wire_offset % 8 != 0 {
        return Err(Error::MalformedBody(format!(
            "bad negotiate context offset {wire_offset}"
        )));
    }
    let mut offset = wire_offset - HEADER_LEN;
    let mut contexts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        offset = align_up(offset, 8);
        check_len(data, offset + 8)?;
        let context_type = read_u16_le(&data[offset..offset + 2]);
        let data_len = read_u16_le(&data[offset + 2..offset + 4]) as usize;
        check_len(data, offset + 8 + data_len)?;
        contexts.push(NegotiateContext {
            context_type,
            data: data[offset + 8..offset + 8 + data_len].to_vec(),
        });
        offset += 8 + data_len;
    }
    Ok(contexts)
}

fn encode_negotiate_contexts(out: &mut Vec<u8>, contexts: &[NegotiateContext]) {
    for (i, context) in contexts.iter().enumerate() {
        if i > 0 {
            out.resize(align_up(out.len(), 8), 0);
        }
        out.extend_from_slice(&context.context_type.to_le_bytes());
        out.extend_from_slice(&(context.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&context.data);
    }
}

// === Shared helpers ===

fn expect_structure_size(data: &[u8], expected: u16, what: &str) -> Result<()> {
    let actual = read_u16_le(&data[0..2]);
    if actual != expected {
        return Err(Error::MalformedBody(format!(
            "{what} structure size must be {expected}, got {actual}"
        )));
    }
    Ok(())
}

fn expect_zero16(data: &[u8], what: &str) -> Result<()> {
    if read_u16_le(data) != 0 {
        return Err(Error::MalformedBody(format!("{what} must be zero")));
    }
    Ok(())
}

/// Read a variable buffer described by 16-bit offset and length fields at
/// the given body positions. Offsets are header-relative on the wire.
fn read_buffer16(
    data: &[u8],
    offset_field: usize,
    length_field: usize,
    what: &str,
) -> Result<Vec<u8>> {
    let wire_offset = read_u16_le(&data[offset_field..offset_field + 2]) as usize;
    let length = read_u16_le(&data[length_field..length_field + 2]) as usize;
    if length == 0 {
        return Ok(Vec::new());
    }
    if wire_offset < HEADER_LEN {
        return Err(Error::MalformedBody(format!(
            "{what} offset {wire_offset} overlaps the header"
        )));
    }
    let start = wire_offset - HEADER_LEN;
    let end = start
        .checked_add(length)
        .ok_or_else(|| Error::MalformedBody(format!("{what} length overflows")))?;
    if end > data.len() {
        return Err(Error::MalformedBody(format!(
            "{what} extends past the end of the message"
        )));
    }
    Ok(data[start..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiate_request() -> NegotiateRequest {
        NegotiateRequest {
            security_mode: SECURITY_MODE_SIGNING_ENABLED,
            capabilities: CAP_LARGE_MTU,
            client_guid: [0x11; 16],
            dialects: vec![0x0202, 0x0210, 0x0311],
            contexts: vec![
                NegotiateContext::preauth_integrity(&[0xAB; 32]),
                NegotiateContext::encryption(&[0x0002, 0x0001]),
            ],
        }
    }

    #[test]
    fn test_negotiate_request_roundtrip() {
        let body = Body::NegotiateRequest(negotiate_request());
        let wire = body.encode();
        let parsed = Body::decode(Command::Negotiate, false, NtStatus::SUCCESS, &wire).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn test_negotiate_request_without_contexts() {
        let body = Body::NegotiateRequest(NegotiateRequest {
            security_mode: SECURITY_MODE_SIGNING_ENABLED,
            capabilities: 0,
            client_guid: [0u8; 16],
            dialects: vec![0x0202, 0x0210],
            contexts: Vec::new(),
        });
        let wire = body.encode();
        assert_eq!(wire.len(), 36 + 4);
        let parsed = Body::decode(Command::Negotiate, false, NtStatus::SUCCESS, &wire).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn test_negotiate_request_rejects_empty_dialects() {
        let mut wire = Body::NegotiateRequest(negotiate_request()).encode();
        wire[2..4].copy_from_slice(&0u16.to_le_bytes());
        assert!(Body::decode(Command::Negotiate, false, NtStatus::SUCCESS, &wire).is_err());
    }

    #[test]
    fn test_negotiate_request_rejects_truncated_dialects() {
        let body = Body::NegotiateRequest(NegotiateRequest {
            security_mode: 0,
            capabilities: 0,
            client_guid: [0u8; 16],
            dialects: vec![0x0202, 0x0210],
            contexts: Vec::new(),
        });
        let wire = body.encode();
        assert!(Body::decode(
            Command::Negotiate,
            false,
            NtStatus::SUCCESS,
            &wire[..wire.len() - 2]
        )
        .is_err());
    }

    #[test]
    fn test_negotiate_response_roundtrip() {
        let body = Body::NegotiateResponse(NegotiateResponse {
            security_mode: SECURITY_MODE_SIGNING_ENABLED | SECURITY_MODE_SIGNING_REQUIRED,
            dialect: 0x0311,
            server_guid: [0x22; 16],
            capabilities: CAP_LARGE_MTU | CAP_ENCRYPTION,
            max_transact_size: 1 << 20,
            max_read_size: 1 << 20,
            max_write_size: 1 << 20,
            system_time: 0x01DA_BBCC_DDEE_FF00,
            server_start_time: 0,
            security_buffer: vec![0x60, 0x28, 0x06, 0x06],
            contexts: vec![
                NegotiateContext::preauth_integrity(&[0xCD; 32]),
                NegotiateContext::encryption(&[0x0002]),
            ],
        });
        let wire = body.encode();
        let parsed = Body::decode(Command::Negotiate, true, NtStatus::SUCCESS, &wire).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn test_session_setup_request_roundtrip() {
        let body = Body::SessionSetupRequest(SessionSetupRequest {
            flags: 0,
            security_mode: 0x01,
            capabilities: 0,
            previous_session_id: 0,
            security_buffer: b"opaque gssapi token".to_vec(),
        });
        let wire = body.encode();
        let parsed = Body::decode(Command::SessionSetup, false, NtStatus::SUCCESS, &wire).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn test_session_setup_buffer_offset_past_end() {
        let mut wire = Body::SessionSetupRequest(SessionSetupRequest {
            flags: 0,
            security_mode: 0,
            capabilities: 0,
            previous_session_id: 0,
            security_buffer: vec![1, 2, 3, 4],
        })
        .encode();
        // Declare a length that runs past the end of the buffer.
        wire[14..16].copy_from_slice(&512u16.to_le_bytes());
        assert!(Body::decode(Command::SessionSetup, false, NtStatus::SUCCESS, &wire).is_err());
    }

    #[test]
    fn test_session_setup_buffer_offset_overlaps_header() {
        let mut wire = Body::SessionSetupRequest(SessionSetupRequest {
            flags: 0,
            security_mode: 0,
            capabilities: 0,
            previous_session_id: 0,
            security_buffer: vec![1, 2, 3, 4],
        })
        .encode();
        wire[12..14].copy_from_slice(&32u16.to_le_bytes());
        assert!(Body::decode(Command::SessionSetup, false, NtStatus::SUCCESS, &wire).is_err());
    }

    #[test]
    fn test_session_setup_response_continuation_shape() {
        // MORE_PROCESSING_REQUIRED keeps the session-setup shape even
        // though its severity bits say error.
        let body = Body::SessionSetupResponse(SessionSetupResponse {
            session_flags: 0,
            security_buffer: b"challenge".to_vec(),
        });
        let wire = body.encode();
        let parsed = Body::decode(
            Command::SessionSetup,
            true,
            NtStatus::MORE_PROCESSING_REQUIRED,
            &wire,
        )
        .unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn test_empty_bodies_roundtrip() {
        for (body, command, is_response) in [
            (Body::LogoffRequest, Command::Logoff, false),
            (Body::LogoffResponse, Command::Logoff, true),
            (Body::EchoRequest, Command::Echo, false),
            (Body::EchoResponse, Command::Echo, true),
            (Body::CancelRequest, Command::Cancel, false),
        ] {
            let wire = body.encode();
            assert_eq!(wire.len(), 4);
            let parsed = Body::decode(command, is_response, NtStatus::SUCCESS, &wire).unwrap();
            assert_eq!(parsed, body);
        }
    }

    #[test]
    fn test_empty_body_rejects_nonzero_reserved() {
        let mut wire = Body::EchoRequest.encode();
        wire[2] = 1;
        assert!(Body::decode(Command::Echo, false, NtStatus::SUCCESS, &wire).is_err());
    }

    #[test]
    fn test_error_response_roundtrip() {
        let body = Body::ErrorResponse(ErrorResponse::empty());
        let wire = body.encode();
        assert_eq!(wire.len(), 9);
        let parsed = Body::decode(Command::Create, true, NtStatus::ACCESS_DENIED, &wire).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn test_opaque_passthrough() {
        let payload = vec![0x39, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];
        let parsed =
            Body::decode(Command::Create, false, NtStatus::SUCCESS, &payload).unwrap();
        assert_eq!(parsed, Body::Opaque(payload.clone()));
        assert_eq!(parsed.encode(), payload);
    }

    #[test]
    fn test_context_accessors() {
        let enc = NegotiateContext::encryption(&[0x0002, 0x0001]);
        assert_eq!(enc.ciphers(), Some(vec![0x0002, 0x0001]));
        assert_eq!(enc.hash_algorithms(), None);

        let preauth = NegotiateContext::preauth_integrity(&[0u8; 32]);
        assert_eq!(preauth.hash_algorithms(), Some(vec![HASH_ALGORITHM_SHA512]));
        assert_eq!(preauth.ciphers(), None);
    }
}
