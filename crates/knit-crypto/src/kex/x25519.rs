//! X25519 key exchange (RFC 7748).
//!
//! Both the per-handshake ephemeral keys and the Noise static keys of a knit
//! handshake are X25519 key pairs. Private scalars live in `Zeroizing` and are
//! wiped when the pair is dropped, which is what gives the handshake forward
//! secrecy once the ephemeral pair goes out of scope.
//!
//! # Example
//!
//! ```
//! use knit_crypto::kex::X25519KeyPair;
//!
//! # fn example() -> Result<(), knit_crypto::Error> {
//! let initiator = X25519KeyPair::generate();
//! let responder = X25519KeyPair::generate();
//!
//! let a = initiator.exchange(responder.public_key())?;
//! let b = responder.exchange(initiator.public_key())?;
//! assert_eq!(*a, *b);
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Length of an X25519 public key and of a DH output, in bytes.
pub const DH_LEN: usize = 32;

/// X25519 key pair for Diffie-Hellman key exchange.
pub struct X25519KeyPair {
    /// Private scalar, zeroed on drop.
    private_key: Zeroizing<StaticSecret>,
    /// Public key point.
    public_key: PublicKey,
}

impl X25519KeyPair {
    /// Generate a new random key pair from the OS RNG.
    pub fn generate() -> Self {
        let private_key = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public_key = PublicKey::from(&private_key);

        Self {
            private_key: Zeroizing::new(private_key),
            public_key,
        }
    }

    /// Public key bytes.
    pub fn public_key(&self) -> &[u8; DH_LEN] {
        self.public_key.as_bytes()
    }

    /// Compute the shared secret with a peer's public key.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyExchange` when the peer key is a low-order point (the
    /// shared secret comes out all zeros), which an honest peer never sends.
    pub fn exchange(&self, peer_public: &[u8; DH_LEN]) -> Result<Zeroizing<[u8; DH_LEN]>> {
        let peer_key = PublicKey::from(*peer_public);
        let shared = self.private_key.diffie_hellman(&peer_key);

        if shared.as_bytes() == &[0u8; DH_LEN] {
            return Err(Error::KeyExchange(
                "Invalid peer public key (low-order point)".into(),
            ));
        }

        Ok(Zeroizing::new(*shared.as_bytes()))
    }

    /// Build a key pair from a raw private scalar.
    ///
    /// Used with known test vectors; production code calls `generate()`.
    #[doc(hidden)]
    pub fn from_private(private: [u8; DH_LEN]) -> Self {
        let private_key = StaticSecret::from(private);
        let public_key = PublicKey::from(&private_key);

        Self {
            private_key: Zeroizing::new(private_key),
            public_key,
        }
    }
}
