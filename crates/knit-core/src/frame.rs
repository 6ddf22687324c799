//! Multiplexer frame parsing and serialization.
//!
//! Every frame starts with a 12-byte header. All multi-byte integers are
//! big-endian.
//!
//! ```text
//! +---------+------+-------+-----------+--------+
//! | version | type | flags | stream_id | length |
//! |   u8    |  u8  |  u16  |    u32    |  u32   |
//! +---------+------+-------+-----------+--------+
//! ```
//!
//! Only Data frames carry a body of `length` bytes. WindowUpdate, Ping and
//! GoAway carry their value (delta, opaque, code) in the `length` field.

use crate::{Error, GoAwayCode, Result};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame header length in bytes.
pub const HEADER_LEN: usize = 12;

/// The only supported protocol version.
pub const VERSION: u8 = 0x00;

/// Type identifier for Data frames (0x00).
pub const TYPE_DATA: u8 = 0x00;
/// Type identifier for WindowUpdate frames (0x01).
pub const TYPE_WINDOW_UPDATE: u8 = 0x01;
/// Type identifier for Ping frames (0x02).
pub const TYPE_PING: u8 = 0x02;
/// Type identifier for GoAway frames (0x03).
pub const TYPE_GO_AWAY: u8 = 0x03;

bitflags! {
    /// Frame flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u16 {
        /// Opens a stream, or marks a ping request.
        const SYN = 0x0001;
        /// Acknowledges a stream open, or marks a ping response.
        const ACK = 0x0002;
        /// Half-closes the sender's direction.
        const FIN = 0x0004;
        /// Aborts the stream immediately.
        const RST = 0x0008;
    }
}

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Stream payload.
    Data,
    /// Flow control credit, also used for bodiless SYN/ACK/FIN/RST.
    WindowUpdate,
    /// Liveness probe.
    Ping,
    /// Session shutdown notice.
    GoAway,
}

impl FrameType {
    /// Convert to wire format.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Data => TYPE_DATA,
            Self::WindowUpdate => TYPE_WINDOW_UPDATE,
            Self::Ping => TYPE_PING,
            Self::GoAway => TYPE_GO_AWAY,
        }
    }

    /// Convert from wire format.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            TYPE_DATA => Some(Self::Data),
            TYPE_WINDOW_UPDATE => Some(Self::WindowUpdate),
            TYPE_PING => Some(Self::Ping),
            TYPE_GO_AWAY => Some(Self::GoAway),
            _ => None,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame kind.
    pub frame_type: FrameType,
    /// Flag bits.
    pub flags: Flags,
    /// Stream identifier; 0 for session frames.
    pub stream_id: u32,
    /// Body length for Data, value for the other kinds.
    pub length: u32,
}

impl Header {
    /// Parse and validate a header from the first `HEADER_LEN` bytes of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        check_len(data, HEADER_LEN)?;

        let version = data[0];
        if version != VERSION {
            return Err(Error::InvalidFrame(format!(
                "Unsupported version 0x{version:02X}"
            )));
        }

        let frame_type = FrameType::from_u8(data[1]).ok_or_else(|| {
            Error::InvalidFrame(format!("Unknown frame type 0x{:02X}", data[1]))
        })?;

        let raw_flags = read_u16_be(&data[2..4]);
        let flags = Flags::from_bits(raw_flags)
            .ok_or_else(|| Error::InvalidFrame(format!("Unknown flags 0x{raw_flags:04X}")))?;

        let stream_id = read_u32_be(&data[4..8]);
        let length = read_u32_be(&data[8..12]);

        match frame_type {
            FrameType::Ping | FrameType::GoAway if stream_id != 0 => {
                return Err(Error::InvalidFrame(format!(
                    "{frame_type:?} on stream {stream_id}"
                )));
            }
            FrameType::Data | FrameType::WindowUpdate if stream_id == 0 => {
                return Err(Error::InvalidFrame(format!("{frame_type:?} on stream 0")));
            }
            _ => {}
        }

        Ok(Self {
            frame_type,
            flags,
            stream_id,
            length,
        })
    }

    /// Append the encoded header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u8(VERSION);
        dst.put_u8(self.frame_type.to_u8());
        dst.put_u16(self.flags.bits());
        dst.put_u32(self.stream_id);
        dst.put_u32(self.length);
    }
}

/// Multiplexer frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Stream payload bytes.
    Data {
        /// Stream identifier (non-zero).
        stream_id: u32,
        /// Flag bits.
        flags: Flags,
        /// Payload.
        payload: Bytes,
    },

    /// Window credit for a stream.
    WindowUpdate {
        /// Stream identifier (non-zero).
        stream_id: u32,
        /// Flag bits.
        flags: Flags,
        /// Additional bytes the sender may transmit.
        delta: u32,
    },

    /// Session liveness probe (SYN) or response (ACK).
    Ping {
        /// SYN for requests, ACK for responses.
        flags: Flags,
        /// Echoed value.
        opaque: u32,
    },

    /// Session shutdown notice.
    GoAway {
        /// Reason code.
        code: GoAwayCode,
    },
}

impl Frame {
    /// Build a frame from a validated header and its body.
    ///
    /// `payload` must be empty for every kind except Data.
    pub fn from_parts(header: Header, payload: Bytes) -> Result<Self> {
        if header.frame_type != FrameType::Data && !payload.is_empty() {
            return Err(Error::InvalidFrame(format!(
                "{:?} frame with a body",
                header.frame_type
            )));
        }

        match header.frame_type {
            FrameType::Data => {
                if payload.len() != header.length as usize {
                    return Err(Error::InvalidFrame(format!(
                        "Data length {} does not match body of {} bytes",
                        header.length,
                        payload.len()
                    )));
                }
                Ok(Frame::Data {
                    stream_id: header.stream_id,
                    flags: header.flags,
                    payload,
                })
            }
            FrameType::WindowUpdate => Ok(Frame::WindowUpdate {
                stream_id: header.stream_id,
                flags: header.flags,
                delta: header.length,
            }),
            FrameType::Ping => Ok(Frame::Ping {
                flags: header.flags,
                opaque: header.length,
            }),
            FrameType::GoAway => {
                let code = GoAwayCode::from_u32(header.length).ok_or_else(|| {
                    Error::InvalidFrame(format!("Unknown GoAway code {}", header.length))
                })?;
                Ok(Frame::GoAway { code })
            }
        }
    }

    /// Header describing this frame.
    pub fn header(&self) -> Result<Header> {
        let header = match self {
            Frame::Data {
                stream_id,
                flags,
                payload,
            } => Header {
                frame_type: FrameType::Data,
                flags: *flags,
                stream_id: *stream_id,
                length: u32::try_from(payload.len()).map_err(|_| {
                    Error::InvalidFrame(format!("Data body of {} bytes", payload.len()))
                })?,
            },
            Frame::WindowUpdate {
                stream_id,
                flags,
                delta,
            } => Header {
                frame_type: FrameType::WindowUpdate,
                flags: *flags,
                stream_id: *stream_id,
                length: *delta,
            },
            Frame::Ping { flags, opaque } => Header {
                frame_type: FrameType::Ping,
                flags: *flags,
                stream_id: 0,
                length: *opaque,
            },
            Frame::GoAway { code } => Header {
                frame_type: FrameType::GoAway,
                flags: Flags::empty(),
                stream_id: 0,
                length: code.to_u32(),
            },
        };
        Ok(header)
    }

    /// Stream this frame belongs to; 0 for session frames.
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. } | Frame::WindowUpdate { stream_id, .. } => *stream_id,
            Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// Flag bits.
    pub fn flags(&self) -> Flags {
        match self {
            Frame::Data { flags, .. }
            | Frame::WindowUpdate { flags, .. }
            | Frame::Ping { flags, .. } => *flags,
            Frame::GoAway { .. } => Flags::empty(),
        }
    }

    /// Parse exactly one complete frame.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = Header::parse(data)?;

        let body_len = match header.frame_type {
            FrameType::Data => header.length as usize,
            _ => 0,
        };
        check_len(data, HEADER_LEN + body_len)?;
        if data.len() > HEADER_LEN + body_len {
            return Err(Error::InvalidFrame(format!(
                "{} trailing bytes",
                data.len() - HEADER_LEN - body_len
            )));
        }

        let payload = Bytes::copy_from_slice(&data[HEADER_LEN..]);
        Self::from_parts(header, payload)
    }

    /// Append the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let header = self.header()?;
        header.encode(dst);
        if let Frame::Data { payload, .. } = self {
            dst.extend_from_slice(payload);
        }
        Ok(())
    }

    /// Serialize frame to bytes.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.to_vec())
    }
}

/// Streaming frame codec.
///
/// Data bodies longer than `max_data_len` (the receive window) are rejected as
/// soon as the header arrives, before any body bytes are buffered.
#[derive(Debug)]
pub struct FrameCodec {
    max_data_len: u32,
    pending: Option<Header>,
}

impl FrameCodec {
    /// Create a codec accepting Data bodies of up to `max_data_len` bytes.
    pub fn new(max_data_len: u32) -> Self {
        Self {
            max_data_len,
            pending: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }
                let header = Header::parse(&src[..HEADER_LEN])?;
                if header.frame_type == FrameType::Data && header.length > self.max_data_len {
                    return Err(Error::InvalidFrame(format!(
                        "Data frame of {} bytes exceeds window of {}",
                        header.length, self.max_data_len
                    )));
                }
                src.advance(HEADER_LEN);
                header
            }
        };

        let body_len = match header.frame_type {
            FrameType::Data => header.length as usize,
            _ => 0,
        };
        if src.len() < body_len {
            self.pending = Some(header);
            src.reserve(body_len - src.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(body_len).freeze();
        Frame::from_parts(header, payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.encode(dst)
    }
}

fn check_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        Err(Error::InsufficientData(needed))
    } else {
        Ok(())
    }
}

fn read_u16_be(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

fn read_u32_be(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(frame: Frame) {
        let bytes = frame.serialize().expect("serialize failed");
        let parsed = Frame::parse(&bytes).expect("parse failed");
        assert_eq!(frame, parsed);
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::WindowUpdate {
            stream_id: 0x0102_0304,
            flags: Flags::SYN | Flags::ACK,
            delta: 0x0A0B_0C0D,
        };
        let bytes = frame.serialize().unwrap();
        assert_eq!(
            bytes,
            [0x00, 0x01, 0x00, 0x03, 0x01, 0x02, 0x03, 0x04, 0x0A, 0x0B, 0x0C, 0x0D]
        );
    }

    #[test]
    fn test_data_roundtrip_lengths() {
        for len in [0usize, 1, 65_535] {
            roundtrip(Frame::Data {
                stream_id: 3,
                flags: Flags::empty(),
                payload: Bytes::from(vec![0xAB; len]),
            });
        }
    }

    #[test]
    fn test_control_roundtrip_extremes() {
        for value in [0u32, 1, u32::MAX] {
            roundtrip(Frame::WindowUpdate {
                stream_id: u32::MAX,
                flags: Flags::FIN,
                delta: value,
            });
            roundtrip(Frame::Ping {
                flags: Flags::SYN,
                opaque: value,
            });
        }
        roundtrip(Frame::GoAway {
            code: GoAwayCode::InternalError,
        });
    }

    #[test]
    fn test_control_frames_have_no_body() {
        let bytes = Frame::Ping {
            flags: Flags::ACK,
            opaque: 99,
        }
        .serialize()
        .unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
    }

    #[test]
    fn test_reject_unknown_version() {
        let mut bytes = Frame::GoAway {
            code: GoAwayCode::Normal,
        }
        .serialize()
        .unwrap();
        bytes[0] = 1;
        assert!(matches!(Frame::parse(&bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_reject_unknown_type() {
        let mut bytes = Frame::GoAway {
            code: GoAwayCode::Normal,
        }
        .serialize()
        .unwrap();
        bytes[1] = 4;
        assert!(matches!(Frame::parse(&bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_reject_unknown_flags() {
        let mut bytes = Frame::WindowUpdate {
            stream_id: 1,
            flags: Flags::empty(),
            delta: 0,
        }
        .serialize()
        .unwrap();
        bytes[3] = 0x10;
        assert!(matches!(Frame::parse(&bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_reject_session_frame_on_stream() {
        let mut bytes = Frame::Ping {
            flags: Flags::SYN,
            opaque: 1,
        }
        .serialize()
        .unwrap();
        bytes[7] = 5;
        assert!(matches!(Frame::parse(&bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_reject_stream_frame_on_stream_zero() {
        let mut bytes = Frame::Data {
            stream_id: 1,
            flags: Flags::empty(),
            payload: Bytes::from_static(b"x"),
        }
        .serialize()
        .unwrap();
        bytes[7] = 0;
        assert!(matches!(Frame::parse(&bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_reject_unknown_go_away_code() {
        let mut bytes = Frame::GoAway {
            code: GoAwayCode::Normal,
        }
        .serialize()
        .unwrap();
        bytes[11] = 9;
        assert!(matches!(Frame::parse(&bytes), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_truncated_data_is_insufficient() {
        let bytes = Frame::Data {
            stream_id: 1,
            flags: Flags::empty(),
            payload: Bytes::from_static(b"hello"),
        }
        .serialize()
        .unwrap();
        assert!(matches!(
            Frame::parse(&bytes[..bytes.len() - 1]),
            Err(Error::InsufficientData(17))
        ));
        assert!(matches!(
            Frame::parse(&bytes[..5]),
            Err(Error::InsufficientData(HEADER_LEN))
        ));
    }

    #[test]
    fn test_codec_handles_partial_input() {
        let frame = Frame::Data {
            stream_id: 7,
            flags: Flags::FIN,
            payload: Bytes::from_static(b"partial delivery"),
        };
        let bytes = frame.serialize().unwrap();
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();

        for chunk in bytes.chunks(5) {
            assert_eq!(codec.decode(&mut buf).unwrap(), None);
            buf.extend_from_slice(chunk);
        }
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_decodes_back_to_back_frames() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        let first = Frame::Ping {
            flags: Flags::SYN,
            opaque: 1,
        };
        let second = Frame::Data {
            stream_id: 2,
            flags: Flags::empty(),
            payload: Bytes::from_static(b"ab"),
        };
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_codec_rejects_oversized_data_header() {
        let mut codec = FrameCodec::new(100);
        let mut buf = BytesMut::new();
        Header {
            frame_type: FrameType::Data,
            flags: Flags::empty(),
            stream_id: 1,
            length: 101,
        }
        .encode(&mut buf);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::InvalidFrame(_))
        ));
    }

    fn arb_flags() -> impl Strategy<Value = Flags> {
        (0u16..16).prop_map(Flags::from_bits_truncate)
    }

    fn arb_frame() -> impl Strategy<Value = Frame> {
        prop_oneof![
            (1u32.., arb_flags(), proptest::collection::vec(any::<u8>(), 0..512)).prop_map(
                |(stream_id, flags, payload)| Frame::Data {
                    stream_id,
                    flags,
                    payload: Bytes::from(payload),
                }
            ),
            (1u32.., arb_flags(), any::<u32>()).prop_map(|(stream_id, flags, delta)| {
                Frame::WindowUpdate {
                    stream_id,
                    flags,
                    delta,
                }
            }),
            (arb_flags(), any::<u32>()).prop_map(|(flags, opaque)| Frame::Ping { flags, opaque }),
            (0u32..3).prop_map(|code| Frame::GoAway {
                code: GoAwayCode::from_u32(code).unwrap(),
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_codec_roundtrip(frame in arb_frame()) {
            let mut codec = FrameCodec::new(u32::MAX);
            let mut buf = BytesMut::new();
            codec.encode(frame.clone(), &mut buf).unwrap();
            prop_assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_parse_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Frame::parse(&data);
        }
    }
}
