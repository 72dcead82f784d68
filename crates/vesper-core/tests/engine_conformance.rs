//! End-to-end engine scenarios over exact wire bytes: negotiation,
//! signing discipline, and the sealed message path, with a client played
//! by hand from the test.

use std::sync::Arc;

use vesper_core::body::{
    Body, NegotiateContext, NegotiateRequest, SessionSetupRequest, SECURITY_MODE_SIGNING_ENABLED,
    SECURITY_MODE_SIGNING_REQUIRED,
};
use vesper_core::{
    Action, AuthProvider, AuthStep, Command, ConnectionConfig, Engine, Error, Header,
    LogicalMessage, NtStatus,
};
use vesper_crypto::sealing::TransformHeader;
use vesper_crypto::{kdf, sealing, signing, Cipher, PreauthIntegrity, SigningAlgorithm};
use zeroize::Zeroizing;

const SESSION_KEY: [u8; 16] = [0x42; 16];

struct AcceptAll;

impl AuthProvider for AcceptAll {
    fn step(&mut self, _session_id: u64, _token: &[u8]) -> AuthStep {
        AuthStep::Success {
            session_key: Zeroizing::new(SESSION_KEY.to_vec()),
            token: Vec::new(),
        }
    }
}

fn negotiate_wire(dialects: Vec<u16>) -> Vec<u8> {
    let contexts = if dialects.contains(&0x0311) {
        vec![
            NegotiateContext::preauth_integrity(&[0x0F; 32]),
            NegotiateContext::encryption(&[0x0002, 0x0001]),
        ]
    } else {
        Vec::new()
    };
    let mut header = Header::new(Command::Negotiate);
    header.credits = 32;
    let body = Body::NegotiateRequest(NegotiateRequest {
        security_mode: SECURITY_MODE_SIGNING_ENABLED,
        capabilities: 0,
        client_guid: [0x77; 16],
        dialects,
        contexts,
    });
    LogicalMessage::new(header, body.encode()).encode()
}

fn session_setup_wire(security_mode: u8) -> Vec<u8> {
    let mut header = Header::new(Command::SessionSetup);
    header.message_id = 1;
    header.credits = 32;
    let body = Body::SessionSetupRequest(SessionSetupRequest {
        flags: 0,
        security_mode,
        capabilities: 0,
        previous_session_id: 0,
        security_buffer: b"token".to_vec(),
    });
    LogicalMessage::new(header, body.encode()).encode()
}

fn single_reply(actions: Vec<Action>) -> Vec<u8> {
    assert_eq!(actions.len(), 1, "expected exactly one action");
    match actions.into_iter().next() {
        Some(Action::Reply(bytes)) => bytes,
        other => panic!("expected a reply, got {other:?}"),
    }
}

/// Run negotiate plus session setup, returning (connection id, session
/// id, and the raw request/response bytes of the handshake in order).
fn handshake(engine: &Engine, dialects: Vec<u16>, security_mode: u8) -> (u64, u64, Vec<Vec<u8>>) {
    let conn = engine.open_connection();
    let mut provider = AcceptAll;
    let mut transcript = Vec::new();

    let request = negotiate_wire(dialects);
    let actions = engine.receive(conn, &request, &mut provider).unwrap();
    let response = single_reply(actions);
    assert_eq!(Header::parse(&response).unwrap().status, NtStatus::SUCCESS);
    transcript.push(request);
    transcript.push(response);

    let request = session_setup_wire(security_mode);
    let actions = engine.receive(conn, &request, &mut provider).unwrap();
    let response = single_reply(actions);
    let header = Header::parse(&response).unwrap();
    assert_eq!(header.status, NtStatus::SUCCESS);
    transcript.push(request);
    transcript.push(response);

    (conn, header.session_id, transcript)
}

#[test]
fn negotiation_selects_highest_offered_dialect() {
    let engine = Engine::new(ConnectionConfig::default());
    let conn = engine.open_connection();
    let mut provider = AcceptAll;

    let actions = engine
        .receive(conn, &negotiate_wire(vec![0x0202, 0x0210, 0x0311]), &mut provider)
        .unwrap();
    let reply = single_reply(actions);
    let header = Header::parse(&reply).unwrap();
    let Body::NegotiateResponse(resp) =
        Body::decode(Command::Negotiate, true, header.status, &reply[64..]).unwrap()
    else {
        panic!("expected a negotiate response");
    };
    assert_eq!(resp.dialect, 0x0311);
    // The response carries a pre-auth integrity context and the selected
    // cipher (GCM preferred over CCM).
    assert!(resp
        .contexts
        .iter()
        .any(|c| c.hash_algorithms().is_some()));
    assert_eq!(
        resp.contexts.iter().find_map(NegotiateContext::ciphers),
        Some(vec![0x0002])
    );
}

#[test]
fn signed_request_dispatches_and_tampered_request_is_fatal() {
    let engine = Engine::new(ConnectionConfig {
        require_signing: true,
        ..Default::default()
    });
    let (conn, session_id, _) = handshake(
        &engine,
        vec![0x0202, 0x0210],
        (SECURITY_MODE_SIGNING_ENABLED | SECURITY_MODE_SIGNING_REQUIRED) as u8,
    );
    let mut provider = AcceptAll;

    // SMB 2.1 signs with HMAC-SHA256 under the session key directly.
    let signing_key = kdf::normalize_session_key(&SESSION_KEY);
    let sign_request = |message_id: u64, body: Vec<u8>| {
        let mut header = Header::new(Command::Ioctl);
        header.message_id = message_id;
        header.session_id = session_id;
        header.flags = vesper_core::header::FLAG_SIGNED;
        let mut wire = LogicalMessage::new(header, body).encode();
        let signature =
            signing::sign(SigningAlgorithm::HmacSha256, &signing_key, &wire).unwrap();
        wire[48..64].copy_from_slice(&signature);
        wire
    };

    // A correctly signed message reaches the application layer.
    let wire = sign_request(2, vec![0x39, 0x00, 0x01]);
    let actions = engine.receive(conn, &wire, &mut provider).unwrap();
    assert!(matches!(actions[0], Action::Dispatch(_)));

    // The same message with one trailing byte altered after signing is
    // rejected before dispatch, fatally.
    let mut tampered = sign_request(3, vec![0x39, 0x00, 0x01]);
    let last = tampered.len() - 1;
    tampered[last] ^= 0xFF;
    let err = engine.receive(conn, &tampered, &mut provider).unwrap_err();
    assert!(matches!(err, Error::Integrity(_)));
    assert!(err.is_fatal());
}

#[test]
fn unsigned_request_on_signing_session_is_fatal() {
    let engine = Engine::new(ConnectionConfig {
        require_signing: true,
        ..Default::default()
    });
    let (conn, session_id, _) = handshake(
        &engine,
        vec![0x0210],
        (SECURITY_MODE_SIGNING_ENABLED | SECURITY_MODE_SIGNING_REQUIRED) as u8,
    );
    let mut provider = AcceptAll;

    let mut header = Header::new(Command::Read);
    header.message_id = 2;
    header.session_id = session_id;
    let wire = LogicalMessage::new(header, vec![0x31, 0x00]).encode();
    let err = engine.receive(conn, &wire, &mut provider).unwrap_err();
    assert!(matches!(err, Error::Integrity(_)));
}

#[test]
fn sealed_roundtrip_through_the_engine() {
    let engine = Engine::new(ConnectionConfig::default());
    let (conn, session_id, transcript) =
        handshake(&engine, vec![0x0202, 0x0311], SECURITY_MODE_SIGNING_ENABLED as u8);
    let mut provider = AcceptAll;

    // Replay the handshake transcript to derive the client's keys: the
    // pre-auth chain covers negotiate request/response and the setup
    // request (the final response is excluded by definition).
    let mut chain = PreauthIntegrity::new();
    chain.update(&transcript[0]);
    chain.update(&transcript[1]);
    chain.update(&transcript[2]);
    let base = kdf::normalize_session_key(&SESSION_KEY);
    let client_seal_key =
        kdf::derive_key(&base, kdf::LABEL_SMB311_C2S_CIPHER, chain.value()).unwrap();
    let client_open_key =
        kdf::derive_key(&base, kdf::LABEL_SMB311_S2C_CIPHER, chain.value()).unwrap();

    // Seal a request client-side and push the envelope through receive.
    let mut header = Header::new(Command::Ioctl);
    header.message_id = 2;
    header.session_id = session_id;
    let plain = LogicalMessage::new(header, vec![0x39, 0x00, 0xEE]).encode();
    let envelope = sealing::seal(
        Cipher::Aes128Gcm,
        &client_seal_key,
        session_id,
        sealing::nonce_from_counter(1),
        &plain,
    )
    .unwrap();

    let actions = engine.receive(conn, &envelope, &mut provider).unwrap();
    let request = match actions.into_iter().next() {
        Some(Action::Dispatch(request)) => request,
        other => panic!("expected dispatch, got {other:?}"),
    };
    assert_eq!(request.session_id, session_id);
    assert_eq!(request.body, vec![0x39, 0x00, 0xEE]);

    // The completion comes back sealed; the client opens it with the
    // server-to-client key.
    let reply = vesper_core::DispatchReply::answer(&request, NtStatus::SUCCESS, vec![0x11, 0x00]);
    let sealed = engine.complete(reply).unwrap();
    let (envelope, ciphertext) = TransformHeader::parse(&sealed).unwrap();
    assert_eq!(envelope.session_id, session_id);
    let opened =
        sealing::unseal(Cipher::Aes128Gcm, &client_open_key, &envelope, ciphertext).unwrap();
    let header = Header::parse(&opened).unwrap();
    assert_eq!(header.command, Command::Ioctl);
    assert_eq!(header.message_id, 2);
    assert_eq!(header.status, NtStatus::SUCCESS);
}

#[test]
fn tampered_envelope_is_fatal_and_never_dispatched() {
    let engine = Engine::new(ConnectionConfig::default());
    let (conn, session_id, transcript) =
        handshake(&engine, vec![0x0311], SECURITY_MODE_SIGNING_ENABLED as u8);
    let mut provider = AcceptAll;

    let mut chain = PreauthIntegrity::new();
    for message in &transcript[..3] {
        chain.update(message);
    }
    let base = kdf::normalize_session_key(&SESSION_KEY);
    let client_seal_key =
        kdf::derive_key(&base, kdf::LABEL_SMB311_C2S_CIPHER, chain.value()).unwrap();

    let mut header = Header::new(Command::Read);
    header.message_id = 2;
    header.session_id = session_id;
    let plain = LogicalMessage::new(header, vec![0x31, 0x00]).encode();
    let mut envelope = sealing::seal(
        Cipher::Aes128Gcm,
        &client_seal_key,
        session_id,
        sealing::nonce_from_counter(1),
        &plain,
    )
    .unwrap();
    let last = envelope.len() - 1;
    envelope[last] ^= 0x01;

    let err = engine.receive(conn, &envelope, &mut provider).unwrap_err();
    assert!(matches!(err, Error::Integrity(_)));
    assert!(err.is_fatal());
}

#[test]
fn concurrent_connections_are_independent() {
    // Two connections on one engine: killing one leaves the other fully
    // operational, and the shared session table stays coherent.
    let engine = Arc::new(Engine::new(ConnectionConfig::default()));
    let (conn_a, session_a, _) =
        handshake(&engine, vec![0x0210], SECURITY_MODE_SIGNING_ENABLED as u8);
    let (conn_b, session_b, _) =
        handshake(&engine, vec![0x0210], SECURITY_MODE_SIGNING_ENABLED as u8);
    assert_ne!(session_a, session_b);

    engine.close_connection(conn_a);

    let mut provider = AcceptAll;
    let mut header = Header::new(Command::Echo);
    header.message_id = 2;
    let wire = LogicalMessage::new(header, Body::EchoRequest.encode()).encode();
    let actions = engine.receive(conn_b, &wire, &mut provider).unwrap();
    let reply = single_reply(actions);
    assert_eq!(Header::parse(&reply).unwrap().status, NtStatus::SUCCESS);

    // The dead connection rejects everything.
    let mut header = Header::new(Command::Echo);
    header.message_id = 2;
    let wire = LogicalMessage::new(header, Body::EchoRequest.encode()).encode();
    assert!(matches!(
        engine.receive(conn_a, &wire, &mut provider),
        Err(Error::ConnectionClosed)
    ));
}
