//! Key derivation functions (HKDF-SHA256).
//!
//! The Noise `HKDF(chaining_key, input_key_material)` function with two outputs
//! is RFC 5869 HKDF with `salt = chaining_key`, empty `info`, expanded to 64
//! bytes and split in half. `noise_hkdf` builds on `hkdf_sha256` that way.

use crate::{Error, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Length of a SHA-256 output, and of every Noise chaining key and cipher key.
pub const HASH_LEN: usize = 32;

/// Type alias for the two 32-byte outputs of the Noise HKDF.
pub type KeyPair = (Zeroizing<[u8; HASH_LEN]>, Zeroizing<[u8; HASH_LEN]>);

/// Generic HKDF-SHA256 key derivation per RFC 5869.
///
/// # Arguments
/// * `ikm` - Input key material
/// * `salt` - Salt value (empty slice for no salt)
/// * `info` - Context and application-specific information
/// * `output_len` - Length of output key material
///
/// # Example
/// ```
/// use knit_crypto::kdf::hkdf_sha256;
///
/// let ikm = &[0x0b; 22];
/// let salt = &hex::decode("000102030405060708090a0b0c").unwrap();
/// let info = &hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();
///
/// let okm = hkdf_sha256(ikm, salt, info, 42).unwrap();
/// assert_eq!(okm.len(), 42);
/// ```
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);

    let mut okm = Zeroizing::new(vec![0u8; output_len]);
    hk.expand(info, &mut okm)
        .map_err(|_| Error::KeyDerivation("HKDF expansion failed".into()))?;

    Ok(okm)
}

/// Noise `HKDF(ck, ikm)` returning two 32-byte outputs.
///
/// Used by `MixKey` (new chaining key, new cipher key) and by `Split`
/// (initiator-to-responder key, responder-to-initiator key).
pub fn noise_hkdf(chaining_key: &[u8; HASH_LEN], ikm: &[u8]) -> Result<KeyPair> {
    let okm = hkdf_sha256(ikm, chaining_key, &[], 2 * HASH_LEN)?;

    let mut first = Zeroizing::new([0u8; HASH_LEN]);
    let mut second = Zeroizing::new([0u8; HASH_LEN]);
    first.copy_from_slice(&okm[..HASH_LEN]);
    second.copy_from_slice(&okm[HASH_LEN..]);

    Ok((first, second))
}
