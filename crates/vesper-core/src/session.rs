//! Per-session state: the authentication exchange and message security.
//!
//! A session moves `New -> Authenticating -> Authenticated`, with
//! `LoggedOff` and `Expired` as terminal states. The authentication
//! tokens are opaque; an external [`AuthProvider`] consumes and produces
//! them and eventually yields the session key, from which the signing and
//! sealing keys are derived for the session's dialect. Key material lives
//! only inside the session and is discarded the moment it reaches a
//! terminal state.
//!
//! One session may span several connections (multi-channel); binding an
//! extra connection is a pure association and never re-authenticates.

use std::collections::HashSet;

use zeroize::Zeroizing;

use vesper_crypto::sealing::TransformHeader;
use vesper_crypto::{kdf, sealing, signing, Cipher, PreauthIntegrity, SigningAlgorithm};

use crate::connection::Dialect;
use crate::header::HEADER_LEN;
use crate::{Error, Result};

/// Outcome of one authentication round, as signalled by the provider.
pub enum AuthStep {
    /// More round trips are needed; send this token to the peer.
    Continue(Vec<u8>),
    /// Authentication succeeded.
    Success {
        /// Session key for signing/sealing key derivation.
        session_key: Zeroizing<Vec<u8>>,
        /// Final token for the peer (may be empty).
        token: Vec<u8>,
    },
    /// Authentication failed.
    Failure,
}

/// External authentication backend. The engine never interprets tokens,
/// only the provider's continuation signal.
pub trait AuthProvider: Send {
    /// Process one opaque token for the given session.
    fn step(&mut self, session_id: u64, token: &[u8]) -> AuthStep;
}

/// Result of driving one session-setup round through the engine.
pub enum SetupOutcome {
    /// Exchange continues; reply with this token.
    Continue(Vec<u8>),
    /// Session is authenticated; reply with this final token.
    Authenticated(Vec<u8>),
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no authentication round processed yet.
    New,
    /// Authentication in progress.
    Authenticating {
        /// Rounds completed so far.
        rounds: u32,
    },
    /// Authentication complete; keys derived.
    Authenticated,
    /// Explicitly logged off. Terminal.
    LoggedOff,
    /// Expired after losing its last connection. Terminal.
    Expired,
}

struct SealingKeys {
    cipher: Cipher,
    encrypt: Zeroizing<[u8; 16]>,
    decrypt: Zeroizing<[u8; 16]>,
}

/// Per-session state machine.
pub struct Session {
    id: u64,
    dialect: Dialect,
    state: SessionState,
    max_rounds: u32,
    signing_required: bool,
    signing: Option<(SigningAlgorithm, Zeroizing<[u8; 16]>)>,
    sealing: Option<SealingKeys>,
    channels: HashSet<u64>,
    preauth: Option<PreauthIntegrity>,
    seal_counter: u64,
}

impl Session {
    /// Create a session in the `New` state, bound to one connection.
    /// `preauth` carries the connection's pre-auth chain for 3.1.1.
    pub fn new(
        id: u64,
        dialect: Dialect,
        connection_id: u64,
        signing_required: bool,
        max_rounds: u32,
        preauth: Option<PreauthIntegrity>,
    ) -> Self {
        let mut channels = HashSet::new();
        channels.insert(connection_id);
        Self {
            id,
            dialect,
            state: SessionState::New,
            max_rounds: max_rounds.max(1),
            signing_required,
            signing: None,
            sealing: None,
            channels,
            preauth,
            seal_counter: 0,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether authentication has completed.
    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Whether messages on this session must be signed.
    pub fn signing_required(&self) -> bool {
        self.signing_required
    }

    /// Whether sealing keys were derived for this session.
    pub fn is_sealing(&self) -> bool {
        self.sealing.is_some()
    }

    /// Fail if the session can no longer carry traffic.
    pub fn ensure_valid(&self) -> Result<()> {
        match self.state {
            SessionState::LoggedOff | SessionState::Expired => Err(Error::SessionInvalid(self.id)),
            _ => Ok(()),
        }
    }

    /// Fold a raw session-setup message into the session's pre-auth chain
    /// (3.1.1 only; no-op otherwise).
    pub fn update_preauth(&mut self, message: &[u8]) {
        if let Some(preauth) = &mut self.preauth {
            preauth.update(message);
        }
    }

    /// Drive one authentication round through the provider.
    ///
    /// `cipher` is the connection's negotiated sealing cipher, applied
    /// once the provider yields the session key.
    pub fn advance(
        &mut self,
        provider: &mut dyn AuthProvider,
        token: &[u8],
        cipher: Option<Cipher>,
    ) -> Result<SetupOutcome> {
        let rounds = match self.state {
            SessionState::New => 0,
            SessionState::Authenticating { rounds } => rounds,
            SessionState::Authenticated => {
                return Err(Error::Authentication(
                    "session is already authenticated".into(),
                ))
            }
            SessionState::LoggedOff | SessionState::Expired => {
                return Err(Error::SessionInvalid(self.id))
            }
        };
        if rounds >= self.max_rounds {
            return Err(Error::AuthenticationExceeded(self.max_rounds));
        }

        match provider.step(self.id, token) {
            AuthStep::Continue(token) => {
                self.state = SessionState::Authenticating { rounds: rounds + 1 };
                Ok(SetupOutcome::Continue(token))
            }
            AuthStep::Success { session_key, token } => {
                self.derive_keys(&session_key, cipher)?;
                self.state = SessionState::Authenticated;
                Ok(SetupOutcome::Authenticated(token))
            }
            AuthStep::Failure => Err(Error::Authentication("provider rejected the token".into())),
        }
    }

    /// Derive the signing (and, if negotiated, sealing) keys for the
    /// session's dialect from the provider's session key.
    fn derive_keys(&mut self, session_key: &[u8], cipher: Option<Cipher>) -> Result<()> {
        let base = kdf::normalize_session_key(session_key);
        match self.dialect {
            Dialect::Smb202 | Dialect::Smb21 => {
                self.signing = Some((SigningAlgorithm::HmacSha256, base));
            }
            Dialect::Smb30 | Dialect::Smb302 => {
                let signing_key =
                    kdf::derive_key(&base, kdf::LABEL_SMB30_SIGNING, kdf::CONTEXT_SMB30_SIGNING)?;
                self.signing = Some((SigningAlgorithm::AesCmac, signing_key));
                if let Some(cipher) = cipher {
                    self.sealing = Some(SealingKeys {
                        cipher,
                        encrypt: kdf::derive_key(
                            &base,
                            kdf::LABEL_SMB30_SEALING,
                            kdf::CONTEXT_SMB30_SERVER_OUT,
                        )?,
                        decrypt: kdf::derive_key(
                            &base,
                            kdf::LABEL_SMB30_SEALING,
                            kdf::CONTEXT_SMB30_SERVER_IN,
                        )?,
                    });
                }
            }
            Dialect::Smb311 => {
                let preauth = self.preauth.as_ref().ok_or_else(|| {
                    Error::Authentication("3.1.1 session without a pre-auth chain".into())
                })?;
                let context = preauth.value().as_slice();
                let signing_key = kdf::derive_key(&base, kdf::LABEL_SMB311_SIGNING, context)?;
                self.signing = Some((SigningAlgorithm::AesCmac, signing_key));
                if let Some(cipher) = cipher {
                    self.sealing = Some(SealingKeys {
                        cipher,
                        encrypt: kdf::derive_key(&base, kdf::LABEL_SMB311_S2C_CIPHER, context)?,
                        decrypt: kdf::derive_key(&base, kdf::LABEL_SMB311_C2S_CIPHER, context)?,
                    });
                }
            }
        }
        Ok(())
    }

    /// Bind an additional connection to this session (multi-channel).
    pub fn bind_channel(&mut self, connection_id: u64) -> Result<()> {
        self.ensure_valid()?;
        if !self.is_authenticated() {
            return Err(Error::Authentication(
                "cannot bind a channel before authentication completes".into(),
            ));
        }
        self.channels.insert(connection_id);
        Ok(())
    }

    /// Drop a connection binding; returns true when none remain.
    pub fn release_channel(&mut self, connection_id: u64) -> bool {
        self.channels.remove(&connection_id);
        self.channels.is_empty()
    }

    /// Connections currently bound to this session.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Log the session off, discarding all key material. Terminal.
    pub fn logoff(&mut self) {
        self.state = SessionState::LoggedOff;
        self.signing = None;
        self.sealing = None;
    }

    /// Expire the session, discarding all key material. Terminal.
    pub fn expire(&mut self) {
        self.state = SessionState::Expired;
        self.signing = None;
        self.sealing = None;
    }

    /// Sign a complete message in place (signature field bytes 48..64).
    pub fn sign_message(&self, message: &mut [u8]) -> Result<()> {
        let (algorithm, key) = self
            .signing
            .as_ref()
            .ok_or_else(|| Error::SessionInvalid(self.id))?;
        if message.len() < HEADER_LEN {
            return Err(Error::MalformedHeader("message shorter than header".into()));
        }
        message[48..64].fill(0);
        let signature = signing::sign(*algorithm, key, message)?;
        message[48..64].copy_from_slice(&signature);
        Ok(())
    }

    /// Verify a complete message's signature. A mismatch is an integrity
    /// error and the message must not reach the application layer.
    pub fn verify_message(&self, message: &[u8]) -> Result<()> {
        let (algorithm, key) = self
            .signing
            .as_ref()
            .ok_or_else(|| Error::SessionInvalid(self.id))?;
        if message.len() < HEADER_LEN {
            return Err(Error::MalformedHeader("message shorter than header".into()));
        }
        let mut unsigned = message.to_vec();
        let mut expected = [0u8; 16];
        expected.copy_from_slice(&unsigned[48..64]);
        unsigned[48..64].fill(0);
        if signing::verify(*algorithm, key, &unsigned, &expected)? {
            Ok(())
        } else {
            Err(Error::Integrity("message signature mismatch".into()))
        }
    }

    /// Seal an outbound message into a transform envelope.
    pub fn seal_message(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let keys = self
            .sealing
            .as_ref()
            .ok_or_else(|| Error::SessionInvalid(self.id))?;
        self.seal_counter += 1;
        let nonce = sealing::nonce_from_counter(self.seal_counter);
        Ok(sealing::seal(
            keys.cipher,
            &keys.encrypt,
            self.id,
            nonce,
            plaintext,
        )?)
    }

    /// Unseal an inbound transform envelope. Any failure, including a
    /// session-id mismatch, is an integrity error.
    pub fn unseal_message(
        &self,
        header: &TransformHeader,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let keys = self
            .sealing
            .as_ref()
            .ok_or_else(|| Error::SessionInvalid(self.id))?;
        if header.session_id != self.id {
            return Err(Error::Integrity(
                "transform envelope bound to a different session".into(),
            ));
        }
        sealing::unseal(keys.cipher, &keys.decrypt, header, ciphertext)
            .map_err(|e| Error::Integrity(e.to_string()))
    }
}
