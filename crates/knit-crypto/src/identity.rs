//! Long-term peer identity.
//!
//! A peer is identified by an Ed25519 key pair. Its `PeerId` is the SHA-256
//! digest of the 32-byte public key, rendered as lowercase hex. The handshake
//! binds the per-connection Noise static key to this identity by signing
//! `"session-static-key:" || noise_static_public`.

use crate::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Length of a peer id digest in bytes.
pub const PEER_ID_LEN: usize = 32;

/// Domain separation prefix for the static key binding signature.
pub const STATIC_KEY_SIGNATURE_PREFIX: &[u8] = b"session-static-key:";

/// Ed25519 identity key pair. The secret half is zeroed on drop.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh identity from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Rebuild an identity from a 32-byte secret seed.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// The public half.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    /// Peer id of this identity.
    pub fn peer_id(&self) -> PeerId {
        self.public().to_peer_id()
    }

    /// Sign `msg`, returning the 64-byte signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(msg).to_bytes()
    }

    /// Sign the binding of a Noise static public key to this identity.
    pub fn sign_static_key(&self, noise_static: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.sign(&static_key_message(noise_static))
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key of a peer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parse a 32-byte encoded public key.
    ///
    /// # Errors
    /// `InvalidLength` for the wrong size, `InvalidPublicKey` when the bytes do
    /// not decode to a curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: &[u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidLength {
            expected: PUBLIC_KEY_LEN,
            actual: bytes.len(),
        })?;

        VerifyingKey::from_bytes(raw)
            .map(Self)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))
    }

    /// Encoded key bytes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.0.to_bytes()
    }

    /// Verify a signature over `msg`.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<()> {
        let sig = Signature::from_slice(signature).map_err(|_| Error::InvalidSignature)?;
        self.0
            .verify(msg, &sig)
            .map_err(|_| Error::InvalidSignature)
    }

    /// Verify the static key binding produced by [`Keypair::sign_static_key`].
    pub fn verify_static_key(&self, noise_static: &[u8], signature: &[u8]) -> Result<()> {
        self.verify(&static_key_message(noise_static), signature)
    }

    /// Derive the peer id.
    pub fn to_peer_id(&self) -> PeerId {
        PeerId(Sha256::digest(self.0.as_bytes()).into())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0.as_bytes()))
    }
}

/// Stable peer identifier: SHA-256 of the identity public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Wrap a raw digest.
    pub const fn from_digest(digest: [u8; PEER_ID_LEN]) -> Self {
        Self(digest)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidPeerId(e.to_string()))?;
        let digest: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| Error::InvalidPeerId(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self(digest))
    }
}

fn static_key_message(noise_static: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(STATIC_KEY_SIGNATURE_PREFIX.len() + noise_static.len());
    msg.extend_from_slice(STATIC_KEY_SIGNATURE_PREFIX);
    msg.extend_from_slice(noise_static);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_static_key() {
        let identity = Keypair::generate();
        let noise_static = [0x09u8; 32];

        let sig = identity.sign_static_key(&noise_static);
        identity
            .public()
            .verify_static_key(&noise_static, &sig)
            .unwrap();
    }

    #[test]
    fn test_static_key_signature_bound_to_key() {
        let identity = Keypair::generate();
        let sig = identity.sign_static_key(&[0x09u8; 32]);

        assert!(matches!(
            identity.public().verify_static_key(&[0x0au8; 32], &sig),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_static_key_signature_needs_prefix() {
        let identity = Keypair::generate();
        let noise_static = [0x09u8; 32];
        // A bare signature over the key is not a valid binding.
        let sig = identity.sign(&noise_static);

        assert!(identity
            .public()
            .verify_static_key(&noise_static, &sig)
            .is_err());
    }

    #[test]
    fn test_peer_id_is_sha256_of_public_key() {
        let identity = Keypair::from_secret_bytes(&[0x01; 32]);
        let expected: [u8; 32] = Sha256::digest(identity.public().to_bytes()).into();
        assert_eq!(identity.peer_id().as_bytes(), &expected);
    }

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = Keypair::generate().peer_id();
        let text = id.to_string();

        assert_eq!(text.len(), 64);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(text.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn test_peer_id_parse_rejects_bad_input() {
        assert!("zz".parse::<PeerId>().is_err());
        assert!("abcd".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_public_key_from_bytes_length() {
        assert!(matches!(
            PublicKey::from_bytes(&[0u8; 31]),
            Err(Error::InvalidLength {
                expected: 32,
                actual: 31
            })
        ));

        let pk = Keypair::generate().public();
        assert_eq!(PublicKey::from_bytes(&pk.to_bytes()).unwrap(), pk);
    }

    #[test]
    fn test_distinct_identities_distinct_peer_ids() {
        assert_ne!(Keypair::generate().peer_id(), Keypair::generate().peer_id());
    }
}
