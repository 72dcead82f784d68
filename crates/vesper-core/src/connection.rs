//! Per-connection state: dialect negotiation and message sequencing.
//!
//! A connection moves `Negotiating -> Negotiated -> Closed`. Negotiation
//! selects the highest mutually supported dialect, fixes the connection's
//! size limits and security posture, and (for 3.1.1) negotiates the
//! sealing cipher through negotiate contexts. Any command other than
//! NEGOTIATE arriving before negotiation completes is a protocol error,
//! and nothing is valid after `Closed`.

use std::collections::HashSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use vesper_crypto::{Cipher, PreauthIntegrity};

use crate::body::{
    NegotiateContext, NegotiateRequest, NegotiateResponse, CAP_ENCRYPTION, CAP_LARGE_MTU,
    HASH_ALGORITHM_SHA512, SECURITY_MODE_SIGNING_ENABLED, SECURITY_MODE_SIGNING_REQUIRED,
};
use crate::credit::CreditLedger;
use crate::header::{Command, Header};
use crate::{Error, Result};

/// Offset between the Unix epoch and the FILETIME epoch, in seconds.
const FILETIME_UNIX_EPOCH: u64 = 11_644_473_600;

/// Current time as a FILETIME (100ns ticks since 1601-01-01).
pub fn nt_time_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => {
            (elapsed.as_secs() + FILETIME_UNIX_EPOCH) * 10_000_000
                + u64::from(elapsed.subsec_nanos()) / 100
        }
        Err(_) => 0,
    }
}

/// Protocol dialect revisions, ordered oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Dialect {
    /// SMB 2.0.2.
    Smb202 = 0x0202,
    /// SMB 2.1.
    Smb21 = 0x0210,
    /// SMB 3.0.
    Smb30 = 0x0300,
    /// SMB 3.0.2.
    Smb302 = 0x0302,
    /// SMB 3.1.1.
    Smb311 = 0x0311,
}

impl Dialect {
    /// Every dialect this engine understands, oldest first.
    pub const ALL: [Dialect; 5] = [
        Dialect::Smb202,
        Dialect::Smb21,
        Dialect::Smb30,
        Dialect::Smb302,
        Dialect::Smb311,
    ];

    /// Wire revision code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Look up a dialect by wire revision code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0202 => Some(Self::Smb202),
            0x0210 => Some(Self::Smb21),
            0x0300 => Some(Self::Smb30),
            0x0302 => Some(Self::Smb302),
            0x0311 => Some(Self::Smb311),
            _ => None,
        }
    }

    /// Whether this is an SMB 3.x dialect.
    pub fn is_smb3(self) -> bool {
        self >= Dialect::Smb30
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Smb202 => "2.0.2",
            Self::Smb21 => "2.1",
            Self::Smb30 => "3.0",
            Self::Smb302 => "3.0.2",
            Self::Smb311 => "3.1.1",
        };
        f.write_str(name)
    }
}

/// Engine configuration, passed explicitly so several independently
/// configured engines can coexist in one process.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Dialects the server offers, oldest first.
    pub dialects: Vec<Dialect>,
    /// Server GUID returned in negotiate responses.
    pub server_guid: [u8; 16],
    /// Maximum transaction size in bytes.
    pub max_transact_size: u32,
    /// Maximum read size in bytes.
    pub max_read_size: u32,
    /// Maximum write size in bytes.
    pub max_write_size: u32,
    /// Whether the server requires signing on authenticated sessions.
    pub require_signing: bool,
    /// Whether the server offers message encryption on 3.x dialects.
    pub enable_encryption: bool,
    /// Longest compound chain accepted in one transport payload.
    pub max_compound_parts: usize,
    /// Credits granted to a connection before its first response.
    pub initial_credits: u16,
    /// Ceiling on outstanding credits per connection.
    pub max_credits: u16,
    /// Authentication round trips allowed before the exchange is abandoned.
    pub max_auth_rounds: u32,
    /// Initial security token advertised in the negotiate response.
    pub negotiate_token: Vec<u8>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let mut server_guid = [0u8; 16];
        OsRng.fill_bytes(&mut server_guid);
        Self {
            dialects: Dialect::ALL.to_vec(),
            server_guid,
            max_transact_size: 1 << 20,
            max_read_size: 1 << 20,
            max_write_size: 1 << 20,
            require_signing: false,
            enable_encryption: true,
            max_compound_parts: 16,
            initial_credits: 1,
            max_credits: 512,
            max_auth_rounds: 8,
            negotiate_token: Vec::new(),
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the negotiate exchange.
    Negotiating,
    /// Dialect agreed; normal traffic allowed.
    Negotiated {
        /// The agreed dialect.
        dialect: Dialect,
        /// Sealing cipher, when encryption was negotiated.
        cipher: Option<Cipher>,
    },
    /// Terminal; no operation is valid.
    Closed,
}

/// Per-connection state machine.
pub struct Connection {
    id: u64,
    config: ConnectionConfig,
    state: ConnectionState,
    credits: CreditLedger,
    next_message_id: u64,
    preauth: PreauthIntegrity,
    sessions: HashSet<u64>,
}

impl Connection {
    /// Create a connection in the `Negotiating` state.
    pub fn new(id: u64, config: ConnectionConfig) -> Self {
        let credits = CreditLedger::new(config.initial_credits, config.max_credits);
        Self {
            id,
            config,
            state: ConnectionState::Negotiating,
            credits,
            next_message_id: 0,
            preauth: PreauthIntegrity::new(),
            sessions: HashSet::new(),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Engine configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Negotiated dialect, if negotiation has completed.
    pub fn dialect(&self) -> Option<Dialect> {
        match self.state {
            ConnectionState::Negotiated { dialect, .. } => Some(dialect),
            _ => None,
        }
    }

    /// Negotiated sealing cipher, if any.
    pub fn cipher(&self) -> Option<Cipher> {
        match self.state {
            ConnectionState::Negotiated { cipher, .. } => cipher,
            _ => None,
        }
    }

    /// The connection's credit ledger.
    pub fn credits(&mut self) -> &mut CreditLedger {
        &mut self.credits
    }

    /// Read-only view of the credit ledger.
    pub fn credits_ref(&self) -> &CreditLedger {
        &self.credits
    }

    /// Pre-authentication integrity chain (meaningful on 3.1.1).
    pub fn preauth(&self) -> &PreauthIntegrity {
        &self.preauth
    }

    /// Fold a raw handshake message into the pre-auth chain.
    pub fn update_preauth(&mut self, message: &[u8]) {
        self.preauth.update(message);
    }

    /// Record a session as bound to this connection.
    pub fn bind_session(&mut self, session_id: u64) {
        self.sessions.insert(session_id);
    }

    /// Remove a session binding.
    pub fn unbind_session(&mut self, session_id: u64) {
        self.sessions.remove(&session_id);
    }

    /// Sessions currently bound to this connection.
    pub fn sessions(&self) -> impl Iterator<Item = u64> + '_ {
        self.sessions.iter().copied()
    }

    /// Move to the terminal `Closed` state.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Reject any command that is invalid in the current state.
    pub fn check_command_allowed(&self, command: Command) -> Result<()> {
        match self.state {
            ConnectionState::Closed => Err(Error::ConnectionClosed),
            ConnectionState::Negotiating if command != Command::Negotiate => {
                Err(Error::Negotiation(format!(
                    "{} before negotiation completed",
                    command.name()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Validate the sender-assigned message id and advance the expected
    /// sequence by the message's credit charge.
    pub fn validate_message_id(&mut self, header: &Header) -> Result<()> {
        // The all-ones id is reserved for requests that consume no
        // sequence slot (e.g. cancel of an async operation).
        if header.message_id == u64::MAX {
            return Ok(());
        }
        if header.message_id != self.next_message_id {
            return Err(Error::MalformedHeader(format!(
                "message id {} out of sequence, expected {}",
                header.message_id, self.next_message_id
            )));
        }
        self.next_message_id += u64::from(header.credit_charge.max(1));
        Ok(())
    }

    /// Drive the negotiate exchange: select a dialect, fix limits and
    /// capabilities, and move to `Negotiated`.
    pub fn handle_negotiate(&mut self, req: &NegotiateRequest) -> Result<NegotiateResponse> {
        match self.state {
            ConnectionState::Negotiating => {}
            ConnectionState::Negotiated { .. } => {
                return Err(Error::Negotiation("dialect already negotiated".into()))
            }
            ConnectionState::Closed => return Err(Error::ConnectionClosed),
        }

        let dialect = self
            .config
            .dialects
            .iter()
            .copied()
            .filter(|d| req.dialects.contains(&d.code()))
            .max()
            .ok_or_else(|| Error::Negotiation("no mutually supported dialect".into()))?;

        let mut security_mode = SECURITY_MODE_SIGNING_ENABLED;
        if self.config.require_signing {
            security_mode |= SECURITY_MODE_SIGNING_REQUIRED;
        }

        let mut capabilities = 0u32;
        if dialect >= Dialect::Smb21 {
            capabilities |= CAP_LARGE_MTU;
        }

        let mut contexts = Vec::new();
        let cipher = match dialect {
            Dialect::Smb311 => {
                let preauth_ok = req
                    .contexts
                    .iter()
                    .filter_map(NegotiateContext::hash_algorithms)
                    .any(|algorithms| algorithms.contains(&HASH_ALGORITHM_SHA512));
                if !preauth_ok {
                    return Err(Error::Negotiation(
                        "3.1.1 offer without a SHA-512 pre-auth integrity context".into(),
                    ));
                }

                let mut salt = [0u8; 32];
                OsRng.fill_bytes(&mut salt);
                contexts.push(NegotiateContext::preauth_integrity(&salt));

                let cipher = if self.config.enable_encryption {
                    let offered: Vec<u16> = req
                        .contexts
                        .iter()
                        .filter_map(NegotiateContext::ciphers)
                        .flatten()
                        .collect();
                    [Cipher::Aes128Gcm, Cipher::Aes128Ccm]
                        .into_iter()
                        .find(|c| offered.contains(&c.id()))
                } else {
                    None
                };
                if let Some(cipher) = cipher {
                    contexts.push(NegotiateContext::encryption(&[cipher.id()]));
                }
                cipher
            }
            Dialect::Smb30 | Dialect::Smb302 => {
                if self.config.enable_encryption && req.capabilities & CAP_ENCRYPTION != 0 {
                    capabilities |= CAP_ENCRYPTION;
                    Some(Cipher::Aes128Ccm)
                } else {
                    None
                }
            }
            _ => None,
        };

        self.state = ConnectionState::Negotiated { dialect, cipher };

        Ok(NegotiateResponse {
            security_mode,
            dialect: dialect.code(),
            server_guid: self.config.server_guid,
            capabilities,
            max_transact_size: self.config.max_transact_size,
            max_read_size: self.config.max_read_size,
            max_write_size: self.config.max_write_size,
            system_time: nt_time_now(),
            server_start_time: 0,
            security_buffer: self.config.negotiate_token.clone(),
            contexts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::NegotiateRequest;

    fn request_with_dialects(dialects: Vec<u16>) -> NegotiateRequest {
        let contexts = if dialects.contains(&0x0311) {
            vec![
                NegotiateContext::preauth_integrity(&[0x55; 32]),
                NegotiateContext::encryption(&[0x0001, 0x0002]),
            ]
        } else {
            Vec::new()
        };
        NegotiateRequest {
            security_mode: SECURITY_MODE_SIGNING_ENABLED,
            capabilities: CAP_ENCRYPTION,
            client_guid: [0x77; 16],
            dialects,
            contexts,
        }
    }

    #[test]
    fn test_selects_highest_mutual_dialect() {
        let mut conn = Connection::new(1, ConnectionConfig::default());
        let resp = conn
            .handle_negotiate(&request_with_dialects(vec![0x0202, 0x0210, 0x0311]))
            .unwrap();
        assert_eq!(resp.dialect, 0x0311);
        assert_eq!(conn.dialect(), Some(Dialect::Smb311));
    }

    #[test]
    fn test_no_mutual_dialect_fails() {
        let config = ConnectionConfig {
            dialects: vec![Dialect::Smb30, Dialect::Smb302],
            ..Default::default()
        };
        let mut conn = Connection::new(1, config);
        let err = conn
            .handle_negotiate(&request_with_dialects(vec![0x0202, 0x0210]))
            .unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
        assert_eq!(conn.dialect(), None);
    }

    #[test]
    fn test_unknown_client_dialects_are_skipped() {
        let mut conn = Connection::new(1, ConnectionConfig::default());
        let resp = conn
            .handle_negotiate(&request_with_dialects(vec![0x02FF, 0x0210]))
            .unwrap();
        assert_eq!(resp.dialect, 0x0210);
    }

    #[test]
    fn test_second_negotiate_rejected() {
        let mut conn = Connection::new(1, ConnectionConfig::default());
        conn.handle_negotiate(&request_with_dialects(vec![0x0202]))
            .unwrap();
        assert!(conn
            .handle_negotiate(&request_with_dialects(vec![0x0202]))
            .is_err());
    }

    #[test]
    fn test_command_order_enforced() {
        let mut conn = Connection::new(1, ConnectionConfig::default());
        assert!(matches!(
            conn.check_command_allowed(Command::SessionSetup),
            Err(Error::Negotiation(_))
        ));
        assert!(conn.check_command_allowed(Command::Negotiate).is_ok());

        conn.handle_negotiate(&request_with_dialects(vec![0x0210]))
            .unwrap();
        assert!(conn.check_command_allowed(Command::SessionSetup).is_ok());

        conn.close();
        assert!(matches!(
            conn.check_command_allowed(Command::Echo),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_cipher_preference_gcm_first() {
        let mut conn = Connection::new(1, ConnectionConfig::default());
        conn.handle_negotiate(&request_with_dialects(vec![0x0311]))
            .unwrap();
        assert_eq!(conn.cipher(), Some(Cipher::Aes128Gcm));
    }

    #[test]
    fn test_smb30_cipher_is_ccm() {
        let mut conn = Connection::new(1, ConnectionConfig::default());
        conn.handle_negotiate(&request_with_dialects(vec![0x0300]))
            .unwrap();
        assert_eq!(conn.cipher(), Some(Cipher::Aes128Ccm));
    }

    #[test]
    fn test_311_requires_preauth_context() {
        let mut conn = Connection::new(1, ConnectionConfig::default());
        let mut req = request_with_dialects(vec![0x0311]);
        req.contexts.clear();
        assert!(matches!(
            conn.handle_negotiate(&req),
            Err(Error::Negotiation(_))
        ));
    }

    #[test]
    fn test_message_id_sequencing() {
        let mut conn = Connection::new(1, ConnectionConfig::default());

        let mut header = Header::new(Command::Negotiate);
        header.message_id = 0;
        conn.validate_message_id(&header).unwrap();

        // A charge of 2 consumes two sequence slots.
        let mut header = Header::new(Command::Read);
        header.message_id = 1;
        header.credit_charge = 2;
        conn.validate_message_id(&header).unwrap();

        let mut header = Header::new(Command::Read);
        header.message_id = 2;
        assert!(conn.validate_message_id(&header).is_err());

        header.message_id = 3;
        conn.validate_message_id(&header).unwrap();
    }

    #[test]
    fn test_dialect_ordering() {
        assert!(Dialect::Smb311 > Dialect::Smb202);
        assert!(Dialect::Smb30.is_smb3());
        assert!(!Dialect::Smb21.is_smb3());
        assert_eq!(Dialect::from_code(0x0311), Some(Dialect::Smb311));
        assert_eq!(Dialect::from_code(0x0222), None);
        assert_eq!(Dialect::Smb302.to_string(), "3.0.2");
    }
}
