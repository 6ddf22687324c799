//! Session roles, multiplexer configuration and stream id bookkeeping.

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default per-stream window (256 KiB).
pub const DEFAULT_INITIAL_WINDOW: u32 = 256 * 1024;

/// Default concurrent stream limit.
pub const DEFAULT_MAX_STREAMS: usize = 256;

/// Session role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialer. Writes handshake messages 1 and 3 and opens odd stream ids.
    Initiator,
    /// Listener. Writes handshake message 2 and opens even stream ids.
    Responder,
}

impl Role {
    /// The other side's role.
    pub fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    /// First stream id this role allocates.
    pub fn first_stream_id(self) -> u32 {
        match self {
            Self::Initiator => 1,
            Self::Responder => 2,
        }
    }

    /// Whether `stream_id` has this role's parity.
    pub fn owns(self, stream_id: u32) -> bool {
        stream_id != 0 && (stream_id % 2 == 1) == (self == Self::Initiator)
    }
}

/// Multiplexer configuration.
///
/// Both peers must use the same `initial_window`; nothing on the wire
/// announces it.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial send and receive window of every stream, in bytes.
    pub initial_window: u32,
    /// Consumed bytes that trigger a WindowUpdate. Must be in `1..=initial_window`.
    pub window_update_threshold: u32,
    /// Maximum concurrently open streams, counting both directions.
    pub max_streams: usize,
    /// Close the session after this long with no open streams and no inbound frames.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::with_initial_window(DEFAULT_INITIAL_WINDOW)
    }
}

impl SessionConfig {
    /// Default configuration with `initial_window` and a half-window threshold.
    pub fn with_initial_window(initial_window: u32) -> Self {
        Self {
            initial_window,
            window_update_threshold: (initial_window / 2).max(1),
            max_streams: DEFAULT_MAX_STREAMS,
            idle_timeout: None,
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.initial_window == 0 {
            return Err(Error::InvalidConfig("Initial window must be non-zero".into()));
        }
        if self.window_update_threshold == 0 || self.window_update_threshold > self.initial_window
        {
            return Err(Error::InvalidConfig(format!(
                "Window update threshold {} outside 1..={}",
                self.window_update_threshold, self.initial_window
            )));
        }
        if self.max_streams == 0 {
            return Err(Error::InvalidConfig("max_streams must be non-zero".into()));
        }
        Ok(())
    }
}

/// How an inbound stream frame relates to the stream table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundStream {
    /// Valid SYN for a new peer-initiated stream.
    Open,
    /// Frame for a stream currently in the table.
    Existing,
    /// Frame for a stream that existed but has been removed locally.
    Stale,
}

/// Local id allocation and validation of peer-chosen ids.
#[derive(Debug)]
pub struct StreamIds {
    role: Role,
    next_local: Option<u32>,
    highest_remote: u32,
    /// Peer-parity ids jumped over by a SYN, as `first -> last` (inclusive).
    skipped_remote: BTreeMap<u32, u32>,
}

impl StreamIds {
    /// Bookkeeping for a session with the given local role.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            next_local: Some(role.first_stream_id()),
            highest_remote: 0,
            skipped_remote: BTreeMap::new(),
        }
    }

    /// Allocate the next local stream id.
    ///
    /// # Errors
    /// `TooManyStreams` when the id space of this role is used up.
    pub fn allocate(&mut self) -> Result<u32> {
        let id = self.next_local.ok_or(Error::TooManyStreams)?;
        self.next_local = id.checked_add(2);
        Ok(id)
    }

    /// Classify a stream frame from the peer.
    ///
    /// `syn` is whether the frame carries SYN; `in_table` is whether the id is
    /// currently open locally. A SYN is recorded as seen even when the caller
    /// goes on to refuse it.
    pub fn classify(&mut self, stream_id: u32, syn: bool, in_table: bool) -> Result<InboundStream> {
        if self.role.owns(stream_id) {
            if syn {
                return Err(Error::InvalidFrame(format!(
                    "SYN for stream {stream_id} with the wrong parity"
                )));
            }
            if in_table {
                return Ok(InboundStream::Existing);
            }
            if self.allocated(stream_id) {
                return Ok(InboundStream::Stale);
            }
            return Err(Error::InvalidFrame(format!(
                "Frame for stream {stream_id} that was never opened"
            )));
        }

        if syn {
            if stream_id <= self.highest_remote {
                return Err(Error::DuplicateStreamId(stream_id));
            }
            let expected = match self.highest_remote {
                0 => self.role.peer().first_stream_id(),
                highest => highest + 2,
            };
            if stream_id > expected {
                self.skipped_remote.insert(expected, stream_id - 2);
            }
            self.highest_remote = stream_id;
            return Ok(InboundStream::Open);
        }
        if in_table {
            return Ok(InboundStream::Existing);
        }
        if stream_id <= self.highest_remote && !self.skipped(stream_id) {
            return Ok(InboundStream::Stale);
        }
        Err(Error::InvalidFrame(format!(
            "Frame for stream {stream_id} before its SYN"
        )))
    }

    fn skipped(&self, stream_id: u32) -> bool {
        self.skipped_remote
            .range(..=stream_id)
            .next_back()
            .is_some_and(|(_, &last)| stream_id <= last)
    }

    fn allocated(&self, stream_id: u32) -> bool {
        match self.next_local {
            Some(next) => stream_id < next,
            None => true,
        }
    }
}
