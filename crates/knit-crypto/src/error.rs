//! Primitive-level failures.
//!
//! `knit-core` maps these onto protocol errors: a failed AEAD open becomes
//! `Decrypt` or `HandshakeAuth` depending on where it happened, and a bad
//! identity key becomes `HandshakeFormat`.

use thiserror::Error;

/// Result alias for this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors from key agreement, sealing, derivation and identity handling.
#[derive(Debug, Error)]
pub enum Error {
    // --- X25519 ---
    /// Diffie-Hellman produced an unusable shared secret.
    #[error("X25519 agreement rejected: {0}")]
    KeyExchange(String),

    // --- ChaCha20-Poly1305 ---
    /// Sealing a chunk failed.
    #[error("Seal failed: {0}")]
    Encryption(String),

    /// Opening a chunk failed: wrong key, wrong nonce or modified bytes.
    #[error("Open failed: {0}")]
    Decryption(String),

    // --- HKDF ---
    /// Requested output too long for HKDF-SHA256.
    #[error("HKDF output error: {0}")]
    KeyDerivation(String),

    /// Buffer length does not match what the primitive needs.
    #[error("Expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required length.
        expected: usize,
        /// Length supplied.
        actual: usize,
    },

    // --- Ed25519 identity ---
    /// Bytes are not a valid Ed25519 public key.
    #[error("Bad identity key: {0}")]
    InvalidPublicKey(String),

    /// Static key binding signature did not verify.
    #[error("Identity signature does not verify")]
    InvalidSignature,

    /// Text is not a hex-encoded 32-byte peer id.
    #[error("Bad peer id: {0}")]
    InvalidPeerId(String),
}
