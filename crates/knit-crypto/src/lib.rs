//! Cryptographic primitives for knit sessions.
//!
//! This crate provides the building blocks of the `Noise_XX_25519_ChaChaPoly_SHA256`
//! handshake and the peer identity layer:
//! - Key exchange (X25519)
//! - AEAD encryption (ChaCha20-Poly1305)
//! - Key derivation (HKDF-SHA256, including the Noise two-output form)
//! - Peer identity (Ed25519 key pairs and SHA-256 derived peer ids)
//!
//! Secret material is held in `Zeroizing` wrappers and never logged.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod kex;

pub use error::{Error, Result};
pub use identity::{Keypair, PeerId, PublicKey};
