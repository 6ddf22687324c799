//! XX handshake conformance tests.
//!
//! Drives both sides of the handshake in memory and checks message sizes,
//! payload layout and the transport keys it releases.

use bytes::Bytes;
use knit_core::handshake::{MSG1_LEN, MSG2_MIN_LEN, MSG3_MIN_LEN, PROTOCOL_NAME};
use knit_core::payload::HandshakePayload;
use knit_core::{Error, ErrorCategory, Handshake, HandshakeOutcome, Role};
use knit_crypto::Keypair;

/// Payload without early data: two length-prefixed fields.
const BASE_PAYLOAD_LEN: usize = 2 + 32 + 2 + 64;

struct Transcript {
    messages: Vec<Vec<u8>>,
    initiator: HandshakeOutcome,
    responder: HandshakeOutcome,
}

fn run(
    initiator_key: &Keypair,
    responder_key: &Keypair,
    initiator_early: Option<Bytes>,
    responder_early: Option<Bytes>,
) -> Transcript {
    let mut initiator = Handshake::new(Role::Initiator, initiator_key, initiator_early, None).unwrap();
    let mut responder = Handshake::new(Role::Responder, responder_key, responder_early, None).unwrap();

    let mut messages = Vec::new();
    while !(initiator.is_complete() && responder.is_complete()) {
        let (writer, reader) = if initiator.is_write_turn() {
            (&mut initiator, &mut responder)
        } else {
            (&mut responder, &mut initiator)
        };
        let message = writer.write_message().unwrap();
        reader.read_message(&message).unwrap();
        messages.push(message);
    }

    Transcript {
        messages,
        initiator: initiator.into_outcome().unwrap(),
        responder: responder.into_outcome().unwrap(),
    }
}

/// Test the protocol name is used verbatim as the initial hash.
#[test]
fn test_protocol_name() {
    assert_eq!(PROTOCOL_NAME, b"Noise_XX_25519_ChaChaPoly_SHA256");
    assert_eq!(PROTOCOL_NAME.len(), 32);
}

/// Test message sizes without early data.
#[test]
fn test_message_sizes() {
    let t = run(&Keypair::generate(), &Keypair::generate(), None, None);

    assert_eq!(t.messages.len(), 3);
    assert_eq!(t.messages[0].len(), MSG1_LEN);
    assert_eq!(t.messages[0].len(), 32);
    // e + (s + tag) + (payload + tag)
    assert_eq!(t.messages[1].len(), MSG2_MIN_LEN + BASE_PAYLOAD_LEN);
    assert_eq!(t.messages[1].len(), 32 + 48 + BASE_PAYLOAD_LEN + 16);
    // (s + tag) + (payload + tag)
    assert_eq!(t.messages[2].len(), MSG3_MIN_LEN + BASE_PAYLOAD_LEN);
}

/// Test early data grows the payload by one length-prefixed field.
#[test]
fn test_early_data_sizes() {
    let t = run(
        &Keypair::generate(),
        &Keypair::generate(),
        Some(Bytes::from_static(b"from initiator")),
        Some(Bytes::from_static(b"hi")),
    );

    assert_eq!(t.messages[1].len(), MSG2_MIN_LEN + BASE_PAYLOAD_LEN + 2 + 2);
    assert_eq!(t.messages[2].len(), MSG3_MIN_LEN + BASE_PAYLOAD_LEN + 2 + 14);
    assert_eq!(
        t.responder.remote_early_data.as_deref(),
        Some(&b"from initiator"[..])
    );
    assert_eq!(t.initiator.remote_early_data.as_deref(), Some(&b"hi"[..]));
}

/// Test both sides agree on identities, transcript and directional keys.
#[test]
fn test_outcome_symmetry() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let mut t = run(&alice, &bob, None, None);

    assert_eq!(t.initiator.remote_peer, bob.peer_id());
    assert_eq!(t.responder.remote_peer, alice.peer_id());
    assert_eq!(t.initiator.remote_public, bob.public());
    assert_eq!(t.initiator.handshake_hash, t.responder.handshake_hash);

    // Initiator send key is the responder receive key, and vice versa.
    let sealed = t.initiator.send.encrypt_with_ad(&[], b"i->r").unwrap();
    assert_eq!(&t.responder.recv.decrypt_with_ad(&[], &sealed).unwrap()[..], b"i->r");
    let sealed = t.responder.send.encrypt_with_ad(&[], b"r->i").unwrap();
    assert_eq!(&t.initiator.recv.decrypt_with_ad(&[], &sealed).unwrap()[..], b"r->i");

    // Directions do not share keys.
    let sealed = t.initiator.send.encrypt_with_ad(&[], b"wrong way").unwrap();
    assert!(matches!(
        t.initiator.recv.decrypt_with_ad(&[], &sealed),
        Err(Error::Decrypt)
    ));
}

/// Test every handshake yields a fresh transcript, even between the same identities.
#[test]
fn test_fresh_ephemerals() {
    let alice = Keypair::generate();
    let bob = Keypair::generate();
    let first = run(&alice, &bob, None, None);
    let second = run(&alice, &bob, None, None);

    assert_ne!(first.messages[0], second.messages[0]);
    assert_ne!(first.initiator.handshake_hash, second.initiator.handshake_hash);
}

/// Test a truncated message 2 is a format error.
#[test]
fn test_truncated_message_two() {
    let mut initiator = Handshake::new(Role::Initiator, &Keypair::generate(), None, None).unwrap();
    let mut responder = Handshake::new(Role::Responder, &Keypair::generate(), None, None).unwrap();

    let msg1 = initiator.write_message().unwrap();
    responder.read_message(&msg1).unwrap();
    let msg2 = responder.write_message().unwrap();

    let err = initiator.read_message(&msg2[..MSG2_MIN_LEN - 1]).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Handshake);
}

/// Test message 1 of the wrong length is refused.
#[test]
fn test_wrong_length_message_one() {
    let mut responder = Handshake::new(Role::Responder, &Keypair::generate(), None, None).unwrap();
    assert!(matches!(
        responder.read_message(&[0x42; 31]),
        Err(Error::HandshakeFormat(_))
    ));
}

/// Test the payload layout on its own.
#[test]
fn test_payload_layout() {
    let identity = Keypair::generate();
    let payload = HandshakePayload {
        identity_key: identity.public().to_bytes(),
        signature: identity.sign_static_key(&[0x07; 32]),
        early_data: None,
    };
    let bytes = payload.encode().unwrap();

    assert_eq!(bytes.len(), BASE_PAYLOAD_LEN);
    assert_eq!(&bytes[..2], &[0x00, 0x20]);
    assert_eq!(&bytes[2..34], &payload.identity_key);
    assert_eq!(&bytes[34..36], &[0x00, 0x40]);

    // Unknown trailing fields are ignored.
    let mut extended = bytes.clone();
    extended.extend_from_slice(&[0x00, 0x01, 0xAA, 0x00, 0x02, 0xBB, 0xCC]);
    let parsed = HandshakePayload::parse(&extended).unwrap();
    assert_eq!(parsed.identity_key, payload.identity_key);
    assert_eq!(parsed.early_data.as_deref(), Some(&[0xAA][..]));
}
