//! Handshake payload carried encrypted in XX messages 2 and 3.
//!
//! ```text
//! u16 len | identity_key   (32 bytes, Ed25519)
//! u16 len | identity_sig   (64 bytes)
//! u16 len | early_data     (optional)
//! ...                      (unknown trailing fields, ignored)
//! ```

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use knit_crypto::identity::{PUBLIC_KEY_LEN, SIGNATURE_LEN};

/// Decoded handshake payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Sender's Ed25519 identity public key.
    pub identity_key: [u8; PUBLIC_KEY_LEN],
    /// Signature over `"session-static-key:" || noise_static_public`.
    pub signature: [u8; SIGNATURE_LEN],
    /// Application data sent with the handshake.
    pub early_data: Option<Bytes>,
}

impl HandshakePayload {
    /// Parse a payload. Bytes after the early data field are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut rest = data;

        let key = take_field(&mut rest, "identity key")?.ok_or_else(|| missing("identity key"))?;
        let identity_key: [u8; PUBLIC_KEY_LEN] = key.try_into().map_err(|_| {
            Error::HandshakeFormat(format!(
                "Identity key must be {PUBLIC_KEY_LEN} bytes, got {}",
                key.len()
            ))
        })?;

        let sig = take_field(&mut rest, "signature")?.ok_or_else(|| missing("signature"))?;
        let signature: [u8; SIGNATURE_LEN] = sig.try_into().map_err(|_| {
            Error::HandshakeFormat(format!(
                "Signature must be {SIGNATURE_LEN} bytes, got {}",
                sig.len()
            ))
        })?;

        let early_data = take_field(&mut rest, "early data")?.map(Bytes::copy_from_slice);

        Ok(Self {
            identity_key,
            signature,
            early_data,
        })
    }

    /// Serialize payload to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let early_len = self.early_data.as_ref().map_or(0, |d| 2 + d.len());
        let mut buf = BytesMut::with_capacity(4 + PUBLIC_KEY_LEN + SIGNATURE_LEN + early_len);

        put_field(&mut buf, &self.identity_key)?;
        put_field(&mut buf, &self.signature)?;
        if let Some(data) = &self.early_data {
            put_field(&mut buf, data)?;
        }

        Ok(buf.to_vec())
    }
}

fn missing(field: &str) -> Error {
    Error::HandshakeFormat(format!("Payload is missing the {field}"))
}

/// Split one length-prefixed field off the front of `rest`.
///
/// `Ok(None)` when `rest` is empty; an error when the field is truncated.
fn take_field<'a>(rest: &mut &'a [u8], field: &str) -> Result<Option<&'a [u8]>> {
    if rest.is_empty() {
        return Ok(None);
    }
    if rest.len() < 2 {
        return Err(Error::HandshakeFormat(format!(
            "Truncated {field} length"
        )));
    }
    let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    if rest.len() < 2 + len {
        return Err(Error::HandshakeFormat(format!(
            "Truncated {field}: need {len} bytes, have {}",
            rest.len() - 2
        )));
    }

    let value = &rest[2..2 + len];
    *rest = &rest[2 + len..];
    Ok(Some(value))
}

fn put_field(buf: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        Error::HandshakeFormat(format!("Field of {} bytes does not fit", value.len()))
    })?;
    buf.put_u16(len);
    buf.extend_from_slice(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(early_data: Option<&'static [u8]>) -> HandshakePayload {
        HandshakePayload {
            identity_key: [0x11; 32],
            signature: [0x22; 64],
            early_data: early_data.map(Bytes::from_static),
        }
    }

    #[test]
    fn test_layout_without_early_data() {
        let bytes = sample(None).encode().unwrap();
        assert_eq!(bytes.len(), 2 + 32 + 2 + 64);
        assert_eq!(&bytes[..2], &[0x00, 0x20]);
        assert_eq!(&bytes[34..36], &[0x00, 0x40]);
        assert_eq!(HandshakePayload::parse(&bytes).unwrap(), sample(None));
    }

    #[test]
    fn test_early_data_roundtrip() {
        let payload = sample(Some(b"hello"));
        let parsed = HandshakePayload::parse(&payload.encode().unwrap()).unwrap();
        assert_eq!(parsed.early_data.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_trailing_fields_ignored() {
        let mut bytes = sample(Some(b"x")).encode().unwrap();
        bytes.extend_from_slice(&[0x00, 0x03, 1, 2, 3, 0xFF]);
        assert_eq!(HandshakePayload::parse(&bytes).unwrap(), sample(Some(b"x")));
    }

    #[test]
    fn test_truncated_early_data_rejected() {
        let mut bytes = sample(None).encode().unwrap();
        bytes.extend_from_slice(&[0x00, 0x05, b'a']);
        assert!(matches!(
            HandshakePayload::parse(&bytes),
            Err(Error::HandshakeFormat(_))
        ));
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let mut bytes = vec![0x00, 0x1F];
        bytes.extend_from_slice(&[0u8; 31]);
        bytes.extend_from_slice(&[0x00, 0x40]);
        bytes.extend_from_slice(&[0u8; 64]);
        assert!(matches!(
            HandshakePayload::parse(&bytes),
            Err(Error::HandshakeFormat(_))
        ));
    }

    #[test]
    fn test_missing_signature_rejected() {
        let bytes = sample(None).encode().unwrap();
        assert!(HandshakePayload::parse(&bytes[..34]).is_err());
        assert!(HandshakePayload::parse(&[]).is_err());
    }
}
