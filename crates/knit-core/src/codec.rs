//! Length-prefixed framing for handshake messages and sealed transport chunks.
//!
//! Both use a 2-byte big-endian length prefix. After the handshake every unit
//! is `ciphertext || tag` of at most 65535 bytes, so one logical write is split
//! into chunks of at most [`MAX_PLAINTEXT_CHUNK`] bytes.

use crate::cipher::CipherState;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use knit_crypto::aead::TAG_LEN;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest sealed unit on the wire.
pub const MAX_SEALED_LEN: usize = u16::MAX as usize;

/// Largest plaintext sealed into one unit.
pub const MAX_PLAINTEXT_CHUNK: usize = MAX_SEALED_LEN - TAG_LEN;

/// Codec for `u16 BE len | message` framing.
pub fn length_prefixed() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .big_endian()
        .max_frame_length(MAX_SEALED_LEN)
        .new_codec()
}

/// Encrypting codec for the secure channel.
///
/// Holds one cipher state per direction. Decoding yields one plaintext chunk
/// per sealed unit; encoding splits and seals.
pub struct SecureCodec {
    inner: LengthDelimitedCodec,
    send: CipherState,
    recv: CipherState,
}

impl SecureCodec {
    /// Build the codec from the cipher states of a completed handshake.
    pub fn new(send: CipherState, recv: CipherState) -> Self {
        Self {
            inner: length_prefixed(),
            send,
            recv,
        }
    }

    /// Nonce of the next outbound unit.
    pub fn send_nonce(&self) -> u64 {
        self.send.nonce()
    }

    /// Nonce of the next inbound unit.
    pub fn recv_nonce(&self) -> u64 {
        self.recv.nonce()
    }
}

impl std::fmt::Debug for SecureCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureCodec")
            .field("send", &self.send)
            .field("recv", &self.recv)
            .finish()
    }
}

impl Decoder for SecureCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let Some(unit) = self.inner.decode(src)? else {
            return Ok(None);
        };
        if unit.len() < TAG_LEN {
            return Err(Error::InvalidFrame(format!(
                "Sealed unit of {} bytes is shorter than the tag",
                unit.len()
            )));
        }

        let plaintext = self.recv.decrypt_with_ad(&[], &unit)?;
        Ok(Some(Bytes::copy_from_slice(&plaintext)))
    }
}

impl Encoder<Bytes> for SecureCodec {
    type Error = Error;

    fn encode(&mut self, plaintext: Bytes, dst: &mut BytesMut) -> Result<()> {
        if plaintext.is_empty() {
            return Ok(());
        }
        for chunk in plaintext.chunks(MAX_PLAINTEXT_CHUNK) {
            let sealed = self.send.encrypt_with_ad(&[], chunk)?;
            self.inner.encode(Bytes::from(sealed), dst)?;
        }
        Ok(())
    }
}
