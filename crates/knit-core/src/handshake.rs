//! `Noise_XX_25519_ChaChaPoly_SHA256` handshake state machine.
//!
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```
//!
//! The initiator writes messages 1 and 3, the responder message 2. Messages 2
//! and 3 carry an encrypted [`HandshakePayload`] that binds the sender's fresh
//! Noise static key to its long-term Ed25519 identity. The machine is sans-IO:
//! callers move message bytes, framing and timeouts live in the I/O layer.

use crate::cipher::CipherState;
use crate::payload::HandshakePayload;
use crate::session::Role;
use crate::{Error, Result};
use bytes::Bytes;
use knit_crypto::aead::TAG_LEN;
use knit_crypto::kdf::{noise_hkdf, HASH_LEN};
use knit_crypto::kex::{X25519KeyPair, DH_LEN};
use knit_crypto::{Keypair, PeerId, PublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Noise protocol name. Exactly `HASH_LEN` bytes, so it is used as the
/// initial hash directly.
pub const PROTOCOL_NAME: &[u8; HASH_LEN] = b"Noise_XX_25519_ChaChaPoly_SHA256";

/// Length of an encrypted static key: key plus tag.
const ENCRYPTED_STATIC_LEN: usize = DH_LEN + TAG_LEN;

/// Message 1 is exactly one ephemeral key.
pub const MSG1_LEN: usize = DH_LEN;

/// Shortest possible message 2: `e`, encrypted `s`, encrypted payload tag.
pub const MSG2_MIN_LEN: usize = DH_LEN + ENCRYPTED_STATIC_LEN + TAG_LEN;

/// Shortest possible message 3: encrypted `s`, encrypted payload tag.
pub const MSG3_MIN_LEN: usize = ENCRYPTED_STATIC_LEN + TAG_LEN;

/// Chaining key, transcript hash and the current handshake cipher.
struct SymmetricState {
    ck: Zeroizing<[u8; HASH_LEN]>,
    h: [u8; HASH_LEN],
    cipher: CipherState,
}

impl SymmetricState {
    fn new() -> Self {
        let mut state = Self {
            ck: Zeroizing::new(*PROTOCOL_NAME),
            h: *PROTOCOL_NAME,
            cipher: CipherState::empty(),
        };
        // Empty prologue.
        state.mix_hash(&[]);
        state
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    fn mix_key(&mut self, ikm: &[u8]) -> Result<()> {
        let (ck, k) = noise_hkdf(&self.ck, ikm)?;
        self.ck = ck;
        self.cipher = CipherState::new(k);
        Ok(())
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = self.cipher.encrypt_with_ad(&self.h, plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let plaintext = self
            .cipher
            .decrypt_with_ad(&self.h, ciphertext)
            .map_err(|e| match e {
                Error::Decrypt => Error::HandshakeAuth("Handshake message failed to decrypt".into()),
                other => other,
            })?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Derive the transport cipher states: (initiator to responder, responder to initiator).
    fn split(&self) -> Result<(CipherState, CipherState)> {
        let (k1, k2) = noise_hkdf(&self.ck, &[])?;
        Ok((CipherState::new(k1), CipherState::new(k2)))
    }
}

/// Handshake states.
enum HandshakeState {
    /// Nothing sent or received yet.
    Init,
    /// Initiator: message 1 sent, awaiting message 2.
    Msg1Sent { e: X25519KeyPair },
    /// Responder: message 1 received, ready to write message 2.
    Msg1Received { re: [u8; DH_LEN] },
    /// Responder: message 2 sent, awaiting message 3.
    Msg2Sent { e: X25519KeyPair },
    /// Initiator: message 2 received, ready to write message 3.
    Msg2Received { re: [u8; DH_LEN] },
    /// Initiator: message 3 sent. Handshake complete.
    Msg3Sent { transport: Transport },
    /// Responder: message 3 received. Handshake complete.
    Msg3Received { transport: Transport },
    /// A step failed; the attempt cannot continue.
    Failed,
}

/// Material released by a completed handshake.
struct Transport {
    send: CipherState,
    recv: CipherState,
}

/// Authenticated result of a completed handshake.
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Cipher state for outbound traffic.
    pub send: CipherState,
    /// Cipher state for inbound traffic.
    pub recv: CipherState,
    /// Remote peer id, proven by signature.
    pub remote_peer: PeerId,
    /// Remote identity public key.
    pub remote_public: PublicKey,
    /// Early data the remote sent in its payload.
    pub remote_early_data: Option<Bytes>,
    /// Final transcript hash, identical on both sides (channel binding).
    pub handshake_hash: [u8; HASH_LEN],
}

/// Remote identity once its payload has been verified.
struct RemoteIdentity {
    public: PublicKey,
    peer_id: PeerId,
    early_data: Option<Bytes>,
}

/// XX handshake for one connection attempt.
pub struct Handshake {
    role: Role,
    state: HandshakeState,
    symmetric: SymmetricState,
    /// Noise static key, fresh per handshake.
    s: X25519KeyPair,
    /// Encoded local payload, signed at construction.
    local_payload: Vec<u8>,
    expected_peer: Option<PeerId>,
    remote: Option<RemoteIdentity>,
}

impl Handshake {
    /// Start a handshake.
    ///
    /// `early_data` travels inside the local payload; `expected_peer`, when
    /// given, must match the identity the remote proves.
    pub fn new(
        role: Role,
        identity: &Keypair,
        early_data: Option<Bytes>,
        expected_peer: Option<PeerId>,
    ) -> Result<Self> {
        let s = X25519KeyPair::generate();
        let payload = HandshakePayload {
            identity_key: identity.public().to_bytes(),
            signature: identity.sign_static_key(s.public_key()),
            early_data,
        };

        Ok(Self {
            role,
            state: HandshakeState::Init,
            symmetric: SymmetricState::new(),
            s,
            local_payload: payload.encode()?,
            expected_peer,
            remote: None,
        })
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether all three messages have been processed.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.state,
            HandshakeState::Msg3Sent { .. } | HandshakeState::Msg3Received { .. }
        )
    }

    /// Whether the next step is writing a message (as opposed to reading one).
    pub fn is_write_turn(&self) -> bool {
        matches!(
            (self.role, &self.state),
            (Role::Initiator, HandshakeState::Init)
                | (Role::Responder, HandshakeState::Msg1Received { .. })
                | (Role::Initiator, HandshakeState::Msg2Received { .. })
        )
    }

    /// Remote peer id, available once the remote payload is verified.
    pub fn remote_peer(&self) -> Option<PeerId> {
        self.remote.as_ref().map(|r| r.peer_id)
    }

    /// Produce the next outbound message.
    pub fn write_message(&mut self) -> Result<Vec<u8>> {
        match (self.role, std::mem::replace(&mut self.state, HandshakeState::Failed)) {
            (Role::Initiator, HandshakeState::Init) => self.write_msg1(),
            (Role::Responder, HandshakeState::Msg1Received { re }) => self.write_msg2(re),
            (Role::Initiator, HandshakeState::Msg2Received { re }) => self.write_msg3(re),
            _ => Err(Error::HandshakeProtocol(format!(
                "{:?} cannot write in the current state",
                self.role
            ))),
        }
    }

    /// Consume the next inbound message.
    pub fn read_message(&mut self, message: &[u8]) -> Result<()> {
        match (self.role, std::mem::replace(&mut self.state, HandshakeState::Failed)) {
            (Role::Responder, HandshakeState::Init) => self.read_msg1(message),
            (Role::Initiator, HandshakeState::Msg1Sent { e }) => self.read_msg2(e, message),
            (Role::Responder, HandshakeState::Msg2Sent { e }) => self.read_msg3(e, message),
            _ => Err(Error::HandshakeProtocol(format!(
                "{:?} cannot read in the current state",
                self.role
            ))),
        }
    }

    /// Release the transport keys and the verified remote identity.
    pub fn into_outcome(self) -> Result<HandshakeOutcome> {
        let transport = match self.state {
            HandshakeState::Msg3Sent { transport } | HandshakeState::Msg3Received { transport } => {
                transport
            }
            _ => {
                return Err(Error::HandshakeProtocol(
                    "Handshake is not complete".into(),
                ))
            }
        };
        let remote = self
            .remote
            .ok_or_else(|| Error::HandshakeProtocol("Remote identity not verified".into()))?;

        Ok(HandshakeOutcome {
            send: transport.send,
            recv: transport.recv,
            remote_peer: remote.peer_id,
            remote_public: remote.public,
            remote_early_data: remote.early_data,
            handshake_hash: self.symmetric.h,
        })
    }

    // === Message 1: -> e ===

    fn write_msg1(&mut self) -> Result<Vec<u8>> {
        let e = X25519KeyPair::generate();
        let mut out = e.public_key().to_vec();
        self.symmetric.mix_hash(e.public_key());
        out.extend(self.symmetric.encrypt_and_hash(&[])?);

        self.state = HandshakeState::Msg1Sent { e };
        Ok(out)
    }

    fn read_msg1(&mut self, message: &[u8]) -> Result<()> {
        let re: [u8; DH_LEN] = message.try_into().map_err(|_| {
            Error::HandshakeFormat(format!(
                "Message 1 must be {MSG1_LEN} bytes, got {}",
                message.len()
            ))
        })?;
        self.symmetric.mix_hash(&re);
        self.symmetric.decrypt_and_hash(&[])?;

        self.state = HandshakeState::Msg1Received { re };
        Ok(())
    }

    // === Message 2: <- e, ee, s, es ===

    fn write_msg2(&mut self, re: [u8; DH_LEN]) -> Result<Vec<u8>> {
        let e = X25519KeyPair::generate();
        let mut out = e.public_key().to_vec();
        self.symmetric.mix_hash(e.public_key());

        self.symmetric.mix_key(&*dh(&e, &re)?)?;
        out.extend(self.symmetric.encrypt_and_hash(self.s.public_key())?);
        self.symmetric.mix_key(&*dh(&self.s, &re)?)?;
        out.extend(self.symmetric.encrypt_and_hash(&self.local_payload)?);

        self.state = HandshakeState::Msg2Sent { e };
        Ok(out)
    }

    fn read_msg2(&mut self, e: X25519KeyPair, message: &[u8]) -> Result<()> {
        if message.len() < MSG2_MIN_LEN {
            return Err(Error::HandshakeFormat(format!(
                "Message 2 must be at least {MSG2_MIN_LEN} bytes, got {}",
                message.len()
            )));
        }
        let (re_bytes, rest) = message.split_at(DH_LEN);
        let (encrypted_static, encrypted_payload) = rest.split_at(ENCRYPTED_STATIC_LEN);

        let re = to_key(re_bytes)?;
        self.symmetric.mix_hash(&re);
        self.symmetric.mix_key(&*dh(&e, &re)?)?;

        let rs = to_key(&self.symmetric.decrypt_and_hash(encrypted_static)?)?;
        self.symmetric.mix_key(&*dh(&e, &rs)?)?;
        let payload = self.symmetric.decrypt_and_hash(encrypted_payload)?;
        self.verify_remote(&rs, &payload)?;

        self.state = HandshakeState::Msg2Received { re };
        Ok(())
    }

    // === Message 3: -> s, se ===

    fn write_msg3(&mut self, re: [u8; DH_LEN]) -> Result<Vec<u8>> {
        let mut out = self.symmetric.encrypt_and_hash(self.s.public_key())?;
        self.symmetric.mix_key(&*dh(&self.s, &re)?)?;
        out.extend(self.symmetric.encrypt_and_hash(&self.local_payload)?);

        let transport = self.split()?;
        self.state = HandshakeState::Msg3Sent { transport };
        Ok(out)
    }

    fn read_msg3(&mut self, e: X25519KeyPair, message: &[u8]) -> Result<()> {
        if message.len() < MSG3_MIN_LEN {
            return Err(Error::HandshakeFormat(format!(
                "Message 3 must be at least {MSG3_MIN_LEN} bytes, got {}",
                message.len()
            )));
        }
        let (encrypted_static, encrypted_payload) = message.split_at(ENCRYPTED_STATIC_LEN);

        let rs = to_key(&self.symmetric.decrypt_and_hash(encrypted_static)?)?;
        self.symmetric.mix_key(&*dh(&e, &rs)?)?;
        let payload = self.symmetric.decrypt_and_hash(encrypted_payload)?;
        self.verify_remote(&rs, &payload)?;

        let transport = self.split()?;
        self.state = HandshakeState::Msg3Received { transport };
        Ok(())
    }

    fn split(&self) -> Result<Transport> {
        let (c1, c2) = self.symmetric.split()?;
        Ok(match self.role {
            Role::Initiator => Transport { send: c1, recv: c2 },
            Role::Responder => Transport { send: c2, recv: c1 },
        })
    }

    /// Check that the remote identity signed the Noise static key `rs`.
    fn verify_remote(&mut self, rs: &[u8; DH_LEN], payload: &[u8]) -> Result<()> {
        let payload = HandshakePayload::parse(payload)?;
        let public = PublicKey::from_bytes(&payload.identity_key)
            .map_err(|e| Error::HandshakeFormat(e.to_string()))?;
        public
            .verify_static_key(rs, &payload.signature)
            .map_err(|_| Error::HandshakeAuth("Static key signature is invalid".into()))?;

        let peer_id = public.to_peer_id();
        if let Some(expected) = self.expected_peer {
            if expected != peer_id {
                return Err(Error::PeerIdentityMismatch {
                    expected,
                    actual: peer_id,
                });
            }
        }

        tracing::debug!(peer = %peer_id, role = ?self.role, "verified remote identity");
        self.remote = Some(RemoteIdentity {
            public,
            peer_id,
            early_data: payload.early_data,
        });
        Ok(())
    }
}

fn dh(local: &X25519KeyPair, remote: &[u8; DH_LEN]) -> Result<Zeroizing<[u8; DH_LEN]>> {
    local
        .exchange(remote)
        .map_err(|e| Error::HandshakeFormat(e.to_string()))
}

fn to_key(bytes: &[u8]) -> Result<[u8; DH_LEN]> {
    bytes.try_into().map_err(|_| {
        Error::HandshakeFormat(format!(
            "Key must be {DH_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}
