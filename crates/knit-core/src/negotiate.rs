//! Protocol negotiation messages.
//!
//! ```text
//! +-----+---------+----------------+
//! | tag | len u16 | utf8 id[len]   |
//! +-----+---------+----------------+
//! ```
//!
//! Propose and Accept carry a protocol id of 1..=255 bytes; Reject and
//! Exhausted carry none. The reader consumes the 3-byte header first and then
//! exactly `len` bytes, so negotiation never reads past its last message.

use crate::{Error, Result};
use bytes::{BufMut, BytesMut};

/// Message header length in bytes.
pub const HEADER_LEN: usize = 3;

/// Longest protocol id in bytes.
pub const MAX_PROTOCOL_LEN: usize = 255;

/// Most proposals a listener will answer before giving up.
pub const MAX_PROPOSALS: usize = 64;

/// Default secure channel protocol id.
pub const SECURE_PROTOCOL: &str = "secure-1.0";

/// Default multiplexer protocol id.
pub const MUX_PROTOCOL: &str = "mux-1.0";

/// Tag for Propose messages (0x01).
pub const TAG_PROPOSE: u8 = 0x01;
/// Tag for Accept messages (0x02).
pub const TAG_ACCEPT: u8 = 0x02;
/// Tag for Reject messages (0x03).
pub const TAG_REJECT: u8 = 0x03;
/// Tag for Exhausted messages (0x04).
pub const TAG_EXHAUSTED: u8 = 0x04;

/// Negotiation messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Dialer offers a protocol.
    Propose(String),
    /// Listener selects the offered protocol.
    Accept(String),
    /// Listener declines the offered protocol.
    Reject,
    /// Dialer has no more candidates.
    Exhausted,
}

/// Check that `id` is a valid protocol identifier.
pub fn validate_protocol_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_PROTOCOL_LEN {
        return Err(Error::InvalidNegotiation(format!(
            "Protocol id must be 1..={MAX_PROTOCOL_LEN} bytes, got {}",
            id.len()
        )));
    }
    Ok(())
}

/// Parse a message header into `(tag, body_len)`.
///
/// Rejects unknown tags and lengths that no valid message can have.
pub fn parse_header(header: [u8; HEADER_LEN]) -> Result<(u8, usize)> {
    let tag = header[0];
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;

    match tag {
        TAG_PROPOSE | TAG_ACCEPT => {
            if len == 0 || len > MAX_PROTOCOL_LEN {
                return Err(Error::InvalidNegotiation(format!(
                    "Protocol id length {len} out of range"
                )));
            }
        }
        TAG_REJECT | TAG_EXHAUSTED => {
            if len != 0 {
                return Err(Error::InvalidNegotiation(format!(
                    "Tag 0x{tag:02X} with {len} body bytes"
                )));
            }
        }
        _ => {
            return Err(Error::InvalidNegotiation(format!(
                "Unknown tag 0x{tag:02X}"
            )))
        }
    }

    Ok((tag, len))
}

impl Message {
    /// Build a message from a tag accepted by [`parse_header`] and its body.
    pub fn from_parts(tag: u8, body: &[u8]) -> Result<Self> {
        let id = || {
            std::str::from_utf8(body)
                .map(str::to_owned)
                .map_err(|_| Error::InvalidNegotiation("Protocol id is not UTF-8".into()))
        };

        match tag {
            TAG_PROPOSE => Ok(Message::Propose(id()?)),
            TAG_ACCEPT => Ok(Message::Accept(id()?)),
            TAG_REJECT => Ok(Message::Reject),
            TAG_EXHAUSTED => Ok(Message::Exhausted),
            _ => Err(Error::InvalidNegotiation(format!(
                "Unknown tag 0x{tag:02X}"
            ))),
        }
    }

    /// Parse exactly one complete message.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::InsufficientData(HEADER_LEN));
        }
        let (tag, len) = parse_header([data[0], data[1], data[2]])?;
        let body = &data[HEADER_LEN..];
        if body.len() != len {
            return Err(Error::InvalidNegotiation(format!(
                "Expected {len} body bytes, got {}",
                body.len()
            )));
        }
        Self::from_parts(tag, body)
    }

    /// Append the encoded message to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let (tag, id) = match self {
            Message::Propose(id) => (TAG_PROPOSE, id.as_str()),
            Message::Accept(id) => (TAG_ACCEPT, id.as_str()),
            Message::Reject => (TAG_REJECT, ""),
            Message::Exhausted => (TAG_EXHAUSTED, ""),
        };
        if matches!(tag, TAG_PROPOSE | TAG_ACCEPT) {
            validate_protocol_id(id)?;
        }

        dst.reserve(HEADER_LEN + id.len());
        dst.put_u8(tag);
        dst.put_u16(id.len() as u16);
        dst.extend_from_slice(id.as_bytes());
        Ok(())
    }

    /// Serialize message to bytes.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.to_vec())
    }
}
