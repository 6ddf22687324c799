//! ChaCha20-Poly1305 (RFC 8439) as used by Noise `ChaChaPoly` cipher states.
//!
//! Every sealed unit is ciphertext followed by a 16-byte Poly1305 tag.

use crate::{Error, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::Zeroizing;

/// Symmetric key length in bytes.
pub const KEY_LEN: usize = 32;

/// Authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Construct the 12-byte AEAD nonce for a 64-bit counter.
///
/// Noise's `ChaChaPoly` nonce layout:
/// - `nonce[0:4] = 0x00000000`
/// - `nonce[4:12] = counter` (little-endian)
///
/// # Example
/// ```
/// use knit_crypto::aead::construct_nonce;
///
/// let nonce = construct_nonce(0x4746454443424140);
/// assert_eq!(&nonce[0..4], &[0, 0, 0, 0]);
/// assert_eq!(&nonce[4..12], &[0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47]);
/// ```
pub fn construct_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt `plaintext` and return `ciphertext || tag`.
///
/// Callers keep `key` in a `Zeroizing` wrapper.
///
/// # Example
/// ```
/// use knit_crypto::aead::{seal, TAG_LEN};
///
/// let sealed = seal(&[0x42; 32], 0, b"hello", b"").unwrap();
/// assert_eq!(sealed.len(), 5 + TAG_LEN);
/// ```
pub fn seal(key: &[u8; KEY_LEN], counter: u64, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = construct_nonce(counter);

    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Encryption("ChaCha20-Poly1305 encryption failed".into()))
}

/// Verify and decrypt `ciphertext || tag`.
///
/// # Errors
/// Returns `Error::Decryption` if the tag does not verify. The caller must
/// treat that as tampering.
pub fn open(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext_and_tag: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if ciphertext_and_tag.len() < TAG_LEN {
        return Err(Error::InvalidLength {
            expected: TAG_LEN,
            actual: ciphertext_and_tag.len(),
        });
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = construct_nonce(counter);

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext_and_tag,
                aad,
            },
        )
        .map_err(|_| Error::Decryption("ChaCha20-Poly1305 authentication failed".into()))?;

    Ok(Zeroizing::new(plaintext))
}
