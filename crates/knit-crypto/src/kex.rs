//! Key exchange implementations.
//!
//! Only X25519 (RFC 7748) is used: it provides every DH token of the XX pattern
//! (`ee`, `es`, `se`).

pub mod x25519;

pub use self::x25519::{X25519KeyPair, DH_LEN};
