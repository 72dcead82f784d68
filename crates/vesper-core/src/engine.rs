//! Engine data flow: the inbound verify/charge/decode/dispatch pipeline
//! and the outbound signed, sealed, credit-granting response path.
//!
//! One engine hosts many connections and many sessions. Both live in
//! id-keyed tables and reference each other only by id, so a session can
//! span connections (multi-channel) without ownership cycles. Inbound
//! processing for a connection is sequential; dispatched operations may
//! complete concurrently and out of order through [`Engine::complete`],
//! each response carrying its own message id for correlation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use vesper_crypto::sealing::TransformHeader;

use crate::body::{Body, ErrorResponse, SessionSetupResponse, SESSION_FLAG_ENCRYPT_DATA};
use crate::compound::{decompound, LogicalMessage};
use crate::connection::{Connection, ConnectionConfig, ConnectionState, Dialect};
use crate::credit::{CreditPolicy, WindowPolicy};
use crate::header::{Command, Header, FLAG_SIGNED};
use crate::session::{AuthProvider, Session, SetupOutcome};
use crate::status::NtStatus;
use crate::{Error, Result};

/// A logical request handed to the application layer.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Connection the request arrived on.
    pub connection_id: u64,
    /// Owning session (after related-message resolution).
    pub session_id: u64,
    /// Tree identifier (after related-message resolution).
    pub tree_id: u32,
    /// Message identifier to echo in the response.
    pub message_id: u64,
    /// Command code.
    pub command: Command,
    /// Whether the message was related to its compound predecessor.
    pub related: bool,
    /// Credits the request charged.
    pub credit_charge: u16,
    /// Credits the peer asked for.
    pub credits_requested: u16,
    /// Raw command body, opaque to the engine.
    pub body: Vec<u8>,
}

/// The application layer's answer to a dispatched request.
#[derive(Debug, Clone)]
pub struct DispatchReply {
    /// Connection to respond on.
    pub connection_id: u64,
    /// Session identifier for the response header.
    pub session_id: u64,
    /// Tree identifier for the response header.
    pub tree_id: u32,
    /// Message identifier being answered.
    pub message_id: u64,
    /// Command code being answered.
    pub command: Command,
    /// Credits the request charged.
    pub credit_charge: u16,
    /// Credits the peer asked for.
    pub credits_requested: u16,
    /// Response status.
    pub status: NtStatus,
    /// Raw response body.
    pub body: Vec<u8>,
}

impl DispatchReply {
    /// Answer `request` with the given status and body.
    pub fn answer(request: &DispatchRequest, status: NtStatus, body: Vec<u8>) -> Self {
        Self {
            connection_id: request.connection_id,
            session_id: request.session_id,
            tree_id: request.tree_id,
            message_id: request.message_id,
            command: request.command,
            credit_charge: request.credit_charge,
            credits_requested: request.credits_requested,
            status,
            body,
        }
    }
}

/// Engine output for one inbound transport payload.
#[derive(Debug)]
pub enum Action {
    /// Wire-ready response bytes to frame and send.
    Reply(Vec<u8>),
    /// A request for the application layer. Cancel requests are
    /// dispatched too and expect no completion.
    Dispatch(DispatchRequest),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The protocol engine: connection and session tables plus the message
/// pipeline between transport and application layer.
pub struct Engine {
    config: ConnectionConfig,
    policy: Box<dyn CreditPolicy>,
    next_connection_id: AtomicU64,
    next_session_id: AtomicU64,
    connections: RwLock<HashMap<u64, Arc<Mutex<Connection>>>>,
    sessions: RwLock<HashMap<u64, Arc<Mutex<Session>>>>,
}

impl Engine {
    /// Create an engine with the default credit replenishment policy.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_policy(config, Box::new(WindowPolicy::default()))
    }

    /// Create an engine with an explicit credit replenishment policy.
    pub fn with_policy(config: ConnectionConfig, policy: Box<dyn CreditPolicy>) -> Self {
        Self {
            config,
            policy,
            next_connection_id: AtomicU64::new(1),
            next_session_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Register a new transport connection and return its id.
    pub fn open_connection(&self) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(id, self.config.clone());
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(Mutex::new(connection)));
        id
    }

    /// Tear down a connection: invalidate its state machine and release
    /// its channel on every bound session. A session losing its last
    /// channel expires; any grace period is the caller's policy.
    pub fn close_connection(&self, connection_id: u64) {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection_id);
        let Some(conn_arc) = removed else { return };

        let mut conn = lock(&conn_arc);
        conn.close();
        let bound: Vec<u64> = conn.sessions().collect();
        drop(conn);

        for session_id in bound {
            if let Some(sess_arc) = self.session(session_id) {
                let mut sess = lock(&sess_arc);
                if sess.release_channel(connection_id) {
                    sess.expire();
                }
            }
        }
    }

    /// Look up a connection by id.
    pub fn connection(&self, connection_id: u64) -> Option<Arc<Mutex<Connection>>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connection_id)
            .cloned()
    }

    /// Look up a session by id.
    pub fn session(&self, session_id: u64) -> Option<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .cloned()
    }

    /// Process one complete transport payload received on `connection_id`.
    ///
    /// A fatal error means the wire contract is broken and the caller
    /// must close the connection; non-fatal failures are already turned
    /// into error responses in the returned actions.
    pub fn receive(
        &self,
        connection_id: u64,
        payload: &[u8],
        provider: &mut dyn AuthProvider,
    ) -> Result<Vec<Action>> {
        let conn_arc = self.connection(connection_id).ok_or(Error::ConnectionClosed)?;

        if TransformHeader::detect(payload) {
            let (envelope, ciphertext) =
                TransformHeader::parse(payload).map_err(|e| Error::Integrity(e.to_string()))?;
            let sess_arc = self
                .session(envelope.session_id)
                .ok_or_else(|| Error::Integrity("envelope for an unknown session".into()))?;
            let plaintext = lock(&sess_arc).unseal_message(&envelope, ciphertext)?;
            return self.process(&conn_arc, connection_id, &plaintext, provider, true);
        }

        self.process(&conn_arc, connection_id, payload, provider, false)
    }

    fn process(
        &self,
        conn_arc: &Arc<Mutex<Connection>>,
        connection_id: u64,
        payload: &[u8],
        provider: &mut dyn AuthProvider,
        was_sealed: bool,
    ) -> Result<Vec<Action>> {
        let parts = decompound(payload, self.config.max_compound_parts)?;
        let mut actions = Vec::with_capacity(parts.len());
        let mut prev_ids: Option<(u64, u32)> = None;

        for part in parts {
            let header = part.header.clone();

            // Order, sequence, and flow control run before anything else;
            // violations here are connection-fatal.
            {
                let mut conn = lock(conn_arc);
                match conn.check_command_allowed(header.command) {
                    Ok(()) => {}
                    Err(e) if !e.is_fatal() => {
                        conn.validate_message_id(&header)?;
                        conn.credits().charge(header.credit_charge.max(1))?;
                        drop(conn);
                        actions.push(Action::Reply(self.error_reply(conn_arc, &header, &e)?));
                        prev_ids = Some((header.session_id, header.tree_id));
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                conn.validate_message_id(&header)?;
                conn.credits().charge(header.credit_charge.max(1))?;
            }

            let (session_id, tree_id) = if header.is_related() {
                prev_ids.ok_or_else(|| {
                    Error::Compounding("related message without a predecessor".into())
                })?
            } else {
                (header.session_id, header.tree_id)
            };

            match self.process_part(
                conn_arc,
                connection_id,
                &part,
                session_id,
                tree_id,
                was_sealed,
                provider,
            ) {
                Ok(Some(action)) => actions.push(action),
                Ok(None) => {}
                Err(e) if !e.is_fatal() => {
                    actions.push(Action::Reply(self.error_reply(conn_arc, &header, &e)?));
                }
                Err(e) => return Err(e),
            }

            prev_ids = Some((session_id, tree_id));
        }
        Ok(actions)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_part(
        &self,
        conn_arc: &Arc<Mutex<Connection>>,
        connection_id: u64,
        part: &LogicalMessage,
        session_id: u64,
        tree_id: u32,
        was_sealed: bool,
        provider: &mut dyn AuthProvider,
    ) -> Result<Option<Action>> {
        match part.header.command {
            Command::Negotiate => self.handle_negotiate(conn_arc, part).map(Some),
            Command::SessionSetup => self
                .handle_session_setup(conn_arc, connection_id, part, provider)
                .map(Some),
            Command::Logoff => {
                self.verify_part(part, session_id, was_sealed)?;
                self.handle_logoff(conn_arc, part, session_id).map(Some)
            }
            Command::Echo => {
                self.verify_part(part, session_id, was_sealed)?;
                let reply_header = part.header.reply(NtStatus::SUCCESS);
                self.finish_reply(conn_arc, part, reply_header, Body::EchoResponse.encode())
                    .map(Some)
            }
            Command::Cancel => {
                self.verify_part(part, session_id, was_sealed)?;
                Ok(Some(Action::Dispatch(self.dispatch_request(
                    connection_id,
                    part,
                    session_id,
                    tree_id,
                ))))
            }
            _ => {
                let sess_arc = self.verify_part(part, session_id, was_sealed)?;
                let authenticated = sess_arc
                    .map(|arc| lock(&arc).is_authenticated())
                    .unwrap_or(false);
                if !authenticated {
                    return Err(Error::SessionInvalid(session_id));
                }
                Ok(Some(Action::Dispatch(self.dispatch_request(
                    connection_id,
                    part,
                    session_id,
                    tree_id,
                ))))
            }
        }
    }

    /// Check the signature discipline for one inbound part. Sealed
    /// payloads are already authenticated by the envelope tag; otherwise
    /// a signed message must verify and a session that requires signing
    /// must never see unsigned traffic.
    fn verify_part(
        &self,
        part: &LogicalMessage,
        session_id: u64,
        was_sealed: bool,
    ) -> Result<Option<Arc<Mutex<Session>>>> {
        if session_id == 0 {
            return Ok(None);
        }
        let sess_arc = self
            .session(session_id)
            .ok_or(Error::SessionInvalid(session_id))?;
        {
            let sess = lock(&sess_arc);
            sess.ensure_valid()?;
            if sess.is_authenticated() && !was_sealed {
                if part.header.is_signed() {
                    sess.verify_message(&part.encode())?;
                } else if sess.signing_required() {
                    return Err(Error::Integrity(
                        "unsigned message on a session that requires signing".into(),
                    ));
                }
            }
        }
        Ok(Some(sess_arc))
    }

    fn dispatch_request(
        &self,
        connection_id: u64,
        part: &LogicalMessage,
        session_id: u64,
        tree_id: u32,
    ) -> DispatchRequest {
        DispatchRequest {
            connection_id,
            session_id,
            tree_id,
            message_id: part.header.message_id,
            command: part.header.command,
            related: part.header.is_related(),
            credit_charge: part.header.credit_charge,
            credits_requested: part.header.credits,
            body: part.body.clone(),
        }
    }

    fn handle_negotiate(
        &self,
        conn_arc: &Arc<Mutex<Connection>>,
        part: &LogicalMessage,
    ) -> Result<Action> {
        let body = Body::decode(
            Command::Negotiate,
            false,
            part.header.status,
            &part.body,
        )?;
        let Body::NegotiateRequest(request) = body else {
            return Err(Error::MalformedBody("expected a NEGOTIATE request".into()));
        };

        let response = lock(conn_arc).handle_negotiate(&request)?;
        let selected = response.dialect;

        let mut reply_header = part.header.reply(NtStatus::SUCCESS);
        reply_header.credits = self.grant_for(conn_arc, &part.header);
        let mut reply = Vec::from(reply_header.serialize());
        reply.extend_from_slice(&Body::NegotiateResponse(response).encode());

        if Dialect::from_code(selected) == Some(Dialect::Smb311) {
            let mut conn = lock(conn_arc);
            conn.update_preauth(&part.encode());
            conn.update_preauth(&reply);
        }

        Ok(Action::Reply(reply))
    }

    fn handle_session_setup(
        &self,
        conn_arc: &Arc<Mutex<Connection>>,
        connection_id: u64,
        part: &LogicalMessage,
        provider: &mut dyn AuthProvider,
    ) -> Result<Action> {
        let header = &part.header;
        let (dialect, cipher) = {
            let conn = lock(conn_arc);
            let dialect = conn
                .dialect()
                .ok_or_else(|| Error::Negotiation("session setup before negotiation".into()))?;
            (dialect, conn.cipher())
        };

        let body = Body::decode(Command::SessionSetup, false, header.status, &part.body)?;
        let Body::SessionSetupRequest(request) = body else {
            return Err(Error::MalformedBody(
                "expected a SESSION_SETUP request".into(),
            ));
        };

        if request.is_binding() {
            return self.handle_session_binding(conn_arc, connection_id, part, dialect);
        }

        let (session_id, sess_arc, created) = if header.session_id == 0 {
            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            let preauth = if dialect == Dialect::Smb311 {
                Some(lock(conn_arc).preauth().clone())
            } else {
                None
            };
            let signing_required = self.config.require_signing
                || request.security_mode & 0x02 != 0;
            let session = Session::new(
                id,
                dialect,
                connection_id,
                signing_required,
                self.config.max_auth_rounds,
                preauth,
            );
            let arc = Arc::new(Mutex::new(session));
            self.sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, arc.clone());
            lock(conn_arc).bind_session(id);
            (id, arc, true)
        } else {
            let arc = self
                .session(header.session_id)
                .ok_or(Error::SessionInvalid(header.session_id))?;
            (header.session_id, arc, false)
        };

        let mut sess = lock(&sess_arc);
        sess.update_preauth(&part.encode());

        match sess.advance(provider, &request.security_buffer, cipher) {
            Ok(SetupOutcome::Continue(token)) => {
                let mut reply_header = header.reply(NtStatus::MORE_PROCESSING_REQUIRED);
                reply_header.session_id = session_id;
                reply_header.credits = self.grant_for(conn_arc, header);
                let body = SessionSetupResponse {
                    session_flags: 0,
                    security_buffer: token,
                };
                let mut reply = Vec::from(reply_header.serialize());
                reply.extend_from_slice(&Body::SessionSetupResponse(body).encode());
                sess.update_preauth(&reply);
                Ok(Action::Reply(reply))
            }
            Ok(SetupOutcome::Authenticated(token)) => {
                let mut reply_header = header.reply(NtStatus::SUCCESS);
                reply_header.session_id = session_id;
                reply_header.credits = self.grant_for(conn_arc, header);
                reply_header.flags |= FLAG_SIGNED;
                let body = SessionSetupResponse {
                    session_flags: if sess.is_sealing() {
                        SESSION_FLAG_ENCRYPT_DATA
                    } else {
                        0
                    },
                    security_buffer: token,
                };
                let mut reply = Vec::from(reply_header.serialize());
                reply.extend_from_slice(&Body::SessionSetupResponse(body).encode());
                sess.sign_message(&mut reply)?;
                Ok(Action::Reply(reply))
            }
            Err(e) => {
                if created {
                    drop(sess);
                    self.sessions
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&session_id);
                    lock(conn_arc).unbind_session(session_id);
                }
                Err(e)
            }
        }
    }

    /// Multi-channel binding: associate an authenticated session with
    /// this connection. Never re-authenticates.
    fn handle_session_binding(
        &self,
        conn_arc: &Arc<Mutex<Connection>>,
        connection_id: u64,
        part: &LogicalMessage,
        dialect: Dialect,
    ) -> Result<Action> {
        let header = &part.header;
        if !dialect.is_smb3() {
            return Err(Error::Authentication(
                "channel binding requires an SMB 3.x dialect".into(),
            ));
        }
        let sess_arc = self
            .session(header.session_id)
            .ok_or(Error::SessionInvalid(header.session_id))?;

        let mut sess = lock(&sess_arc);
        sess.ensure_valid()?;
        if !header.is_signed() {
            return Err(Error::Integrity("unsigned channel binding request".into()));
        }
        sess.verify_message(&part.encode())?;
        sess.bind_channel(connection_id)?;
        lock(conn_arc).bind_session(header.session_id);

        let mut reply_header = header.reply(NtStatus::SUCCESS);
        reply_header.credits = self.grant_for(conn_arc, header);
        reply_header.flags |= FLAG_SIGNED;
        let body = SessionSetupResponse {
            session_flags: 0,
            security_buffer: Vec::new(),
        };
        let mut reply = Vec::from(reply_header.serialize());
        reply.extend_from_slice(&Body::SessionSetupResponse(body).encode());
        sess.sign_message(&mut reply)?;
        Ok(Action::Reply(reply))
    }

    fn handle_logoff(
        &self,
        conn_arc: &Arc<Mutex<Connection>>,
        part: &LogicalMessage,
        session_id: u64,
    ) -> Result<Action> {
        let sess_arc = self
            .session(session_id)
            .ok_or(Error::SessionInvalid(session_id))?;

        let mut sess = lock(&sess_arc);
        sess.ensure_valid()?;

        let mut reply_header = part.header.reply(NtStatus::SUCCESS);
        reply_header.credits = self.grant_for(conn_arc, &part.header);
        let mut reply = Vec::from(reply_header.serialize());
        reply.extend_from_slice(&Body::LogoffResponse.encode());
        if sess.is_authenticated() {
            reply_header.flags |= FLAG_SIGNED;
            reply[..64].copy_from_slice(&reply_header.serialize());
            sess.sign_message(&mut reply)?;
        }

        // Keys are discarded only after the response is signed.
        sess.logoff();
        lock(conn_arc).unbind_session(session_id);
        Ok(Action::Reply(reply))
    }

    /// Build a signed/sealed wire response for a completed application
    /// operation. Responses may complete in any order; the message id in
    /// the reply correlates them.
    pub fn complete(&self, reply: DispatchReply) -> Result<Vec<u8>> {
        let conn_arc = self
            .connection(reply.connection_id)
            .ok_or(Error::ConnectionClosed)?;

        let granted = {
            let mut conn = lock(&conn_arc);
            if conn.state() == ConnectionState::Closed {
                return Err(Error::ConnectionClosed);
            }
            let charged = reply.credit_charge.max(1);
            let grant = self
                .policy
                .replenish(charged, reply.credits_requested, conn.credits_ref());
            conn.credits().grant(grant)
        };

        let mut header = Header::new(reply.command);
        header.flags = crate::header::FLAG_RESPONSE;
        header.status = reply.status;
        header.message_id = reply.message_id;
        header.session_id = reply.session_id;
        header.tree_id = reply.tree_id;
        header.credit_charge = reply.credit_charge;
        header.credits = granted;

        let sess_arc = if reply.session_id != 0 {
            self.session(reply.session_id)
        } else {
            None
        };

        match sess_arc {
            Some(sess_arc) => {
                let mut sess = lock(&sess_arc);
                if sess.is_sealing() {
                    let mut plain = Vec::from(header.serialize());
                    plain.extend_from_slice(&reply.body);
                    sess.seal_message(&plain)
                } else if sess.is_authenticated() {
                    header.flags |= FLAG_SIGNED;
                    let mut wire = Vec::from(header.serialize());
                    wire.extend_from_slice(&reply.body);
                    sess.sign_message(&mut wire)?;
                    Ok(wire)
                } else {
                    let mut wire = Vec::from(header.serialize());
                    wire.extend_from_slice(&reply.body);
                    Ok(wire)
                }
            }
            None => {
                let mut wire = Vec::from(header.serialize());
                wire.extend_from_slice(&reply.body);
                Ok(wire)
            }
        }
    }

    /// Assemble a substrate reply: grant credits, then sign it when the
    /// owning session signs.
    fn finish_reply(
        &self,
        conn_arc: &Arc<Mutex<Connection>>,
        part: &LogicalMessage,
        mut reply_header: Header,
        body: Vec<u8>,
    ) -> Result<Action> {
        reply_header.credits = self.grant_for(conn_arc, &part.header);
        let mut reply = Vec::from(reply_header.serialize());
        reply.extend_from_slice(&body);

        if part.header.session_id != 0 {
            if let Some(sess_arc) = self.session(part.header.session_id) {
                let sess = lock(&sess_arc);
                if sess.is_authenticated() && !sess.is_sealing() {
                    reply_header.flags |= FLAG_SIGNED;
                    reply[..64].copy_from_slice(&reply_header.serialize());
                    sess.sign_message(&mut reply)?;
                }
            }
        }
        Ok(Action::Reply(reply))
    }

    /// Grant credits for a response to `header`, under the connection lock.
    fn grant_for(&self, conn_arc: &Arc<Mutex<Connection>>, header: &Header) -> u16 {
        let mut conn = lock(conn_arc);
        let charged = header.credit_charge.max(1);
        let grant = self
            .policy
            .replenish(charged, header.credits, conn.credits_ref());
        conn.credits().grant(grant)
    }

    /// Build the generic error response reporting a non-fatal failure.
    fn error_reply(
        &self,
        conn_arc: &Arc<Mutex<Connection>>,
        header: &Header,
        error: &Error,
    ) -> Result<Vec<u8>> {
        let mut reply_header = header.reply(error.status());
        reply_header.credits = self.grant_for(conn_arc, header);
        let mut reply = Vec::from(reply_header.serialize());
        reply.extend_from_slice(&Body::ErrorResponse(ErrorResponse::empty()).encode());

        // Sign error replies on sessions that sign, so the peer can tell
        // them from forgeries.
        if header.session_id != 0 {
            if let Some(sess_arc) = self.session(header.session_id) {
                let sess = lock(&sess_arc);
                if sess.is_authenticated() && !sess.is_sealing() {
                    reply_header.flags |= FLAG_SIGNED;
                    reply[..64].copy_from_slice(&reply_header.serialize());
                    sess.sign_message(&mut reply)?;
                }
            }
        }
        Ok(reply)
    }
}
