//! Noise cipher state: a ChaCha20-Poly1305 key and a 64-bit nonce counter.

use crate::{Error, Result};
use knit_crypto::aead::{self, KEY_LEN};
use zeroize::Zeroizing;

/// One direction of an encrypted channel.
///
/// Before a key is installed (early handshake messages) encryption is the
/// identity function. The nonce starts at 0 and advances by exactly one per
/// sealed or opened unit; `u64::MAX` is reserved and never used.
pub struct CipherState {
    key: Option<Zeroizing<[u8; KEY_LEN]>>,
    nonce: u64,
}

impl CipherState {
    /// Cipher state with no key.
    pub fn empty() -> Self {
        Self {
            key: None,
            nonce: 0,
        }
    }

    /// Cipher state with `key` and nonce 0.
    pub fn new(key: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self {
            key: Some(key),
            nonce: 0,
        }
    }

    /// Whether a key is installed.
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Next nonce to be used.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Seal `plaintext` with associated data `ad`.
    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_vec());
        };
        if self.nonce == u64::MAX {
            return Err(Error::NonceExhausted);
        }

        let sealed = aead::seal(key, self.nonce, plaintext, ad)?;
        self.nonce += 1;
        Ok(sealed)
    }

    /// Open `ciphertext` (ciphertext followed by tag) with associated data `ad`.
    ///
    /// # Errors
    /// `Error::Decrypt` when the tag does not verify. The nonce does not advance.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let Some(key) = &self.key else {
            return Ok(Zeroizing::new(ciphertext.to_vec()));
        };
        if self.nonce == u64::MAX {
            return Err(Error::NonceExhausted);
        }

        let plaintext = aead::open(key, self.nonce, ciphertext, ad).map_err(|e| match e {
            knit_crypto::Error::Decryption(_) | knit_crypto::Error::InvalidLength { .. } => {
                Error::Decrypt
            }
            other => Error::Crypto(other),
        })?;
        self.nonce += 1;
        Ok(plaintext)
    }

    #[cfg(test)]
    pub(crate) fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("has_key", &self.has_key())
            .field("nonce", &self.nonce)
            .finish()
    }
}
