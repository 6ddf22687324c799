//! Per-stream lifecycle and flow control.
//!
//! Sans-IO: the session feeds inbound frames in and asks what to send out.
//! Receive-side credit is returned in batches: consumed bytes accumulate until
//! they reach the configured threshold, then one WindowUpdate carries them all.

use crate::{Error, Result};
use bytes::{Buf, Bytes};
use std::collections::VecDeque;

/// Stream lifecycle.
///
/// A stream enters the table `Open`: locally when SYN is queued, remotely
/// when the peer's SYN is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Both directions open.
    Open,
    /// Local side sent FIN.
    HalfClosedLocal,
    /// Remote side sent FIN.
    HalfClosedRemote,
    /// Both sides sent FIN.
    Closed,
    /// RST sent or received. Buffered data was discarded.
    Reset,
}

/// State of one multiplexed stream.
#[derive(Debug)]
pub struct StreamState {
    id: u32,
    lifecycle: Lifecycle,
    /// Bytes we may still send (peer credit).
    send_window: u32,
    /// Bytes the peer may still send (our credit).
    recv_window: u32,
    /// Received, not yet read.
    recv_buf: VecDeque<Bytes>,
    buffered: usize,
    /// Read but not yet returned to the peer as credit.
    unacked: u32,
    update_threshold: u32,
}

impl StreamState {
    /// Create an open stream.
    pub fn new(id: u32, initial_window: u32, update_threshold: u32) -> Self {
        Self {
            id,
            lifecycle: Lifecycle::Open,
            send_window: initial_window,
            recv_window: initial_window,
            recv_buf: VecDeque::new(),
            buffered: 0,
            unacked: 0,
            update_threshold,
        }
    }

    /// Get stream ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Remaining peer credit.
    pub fn send_window(&self) -> u32 {
        self.send_window
    }

    /// Remaining credit granted to the peer.
    pub fn recv_window(&self) -> u32 {
        self.recv_window
    }

    /// Bytes waiting to be read.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Whether the stream can be dropped from the session table.
    pub fn is_finished(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Closed | Lifecycle::Reset)
    }

    /// Whether the peer can still send data.
    fn remote_open(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Open | Lifecycle::HalfClosedLocal)
    }

    /// Whether we can still send data.
    fn local_open(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Open | Lifecycle::HalfClosedRemote)
    }

    // === Inbound ===

    /// Buffer a received Data payload.
    ///
    /// # Errors
    /// `FlowControlViolation` when the payload exceeds the remaining receive
    /// window; `InvalidFrame` for data after the peer's FIN.
    pub fn on_data(&mut self, payload: Bytes) -> Result<()> {
        if self.lifecycle == Lifecycle::Reset {
            return Ok(());
        }
        if !self.remote_open() {
            return Err(Error::InvalidFrame(format!(
                "Data on stream {} after FIN",
                self.id
            )));
        }

        let len = u32::try_from(payload.len())
            .map_err(|_| Error::FlowControlViolation { stream_id: self.id })?;
        if len > self.recv_window {
            return Err(Error::FlowControlViolation { stream_id: self.id });
        }
        self.recv_window -= len;

        if !payload.is_empty() {
            self.buffered += payload.len();
            self.recv_buf.push_back(payload);
        }
        Ok(())
    }

    /// Add peer credit.
    ///
    /// # Errors
    /// `FlowControlViolation` when the credit would overflow the window.
    pub fn on_window_update(&mut self, delta: u32) -> Result<()> {
        self.send_window = self
            .send_window
            .checked_add(delta)
            .ok_or(Error::FlowControlViolation { stream_id: self.id })?;
        Ok(())
    }

    /// Peer sent FIN.
    pub fn on_fin(&mut self) {
        self.lifecycle = match self.lifecycle {
            Lifecycle::Open => Lifecycle::HalfClosedRemote,
            Lifecycle::HalfClosedLocal => Lifecycle::Closed,
            other => other,
        };
    }

    /// RST sent or received. Discards buffered data.
    pub fn on_reset(&mut self) {
        self.lifecycle = Lifecycle::Reset;
        self.recv_buf.clear();
        self.buffered = 0;
        self.unacked = 0;
    }

    // === Reading ===

    /// Take up to `max` buffered bytes.
    ///
    /// `None` means nothing is buffered right now; check [`is_eof`](Self::is_eof)
    /// to tell end-of-data from "wait for more".
    pub fn read(&mut self, max: usize) -> Option<Bytes> {
        if max == 0 {
            return None;
        }
        let front = self.recv_buf.front_mut()?;
        let chunk = if front.len() <= max {
            self.recv_buf.pop_front()?
        } else {
            let head = front.slice(..max);
            front.advance(max);
            head
        };

        self.buffered -= chunk.len();
        // Chunk length is bounded by the window, which is a u32.
        self.unacked = self.unacked.saturating_add(chunk.len() as u32);
        Some(chunk)
    }

    /// Peer finished sending and everything has been read.
    pub fn is_eof(&self) -> bool {
        self.buffered == 0 && !self.remote_open() && self.lifecycle != Lifecycle::Reset
    }

    /// Credit to return to the peer, once enough has been consumed.
    ///
    /// Returns the WindowUpdate delta and restores the receive window by it.
    /// Nothing is returned once the peer can no longer send.
    pub fn take_window_update(&mut self) -> Option<u32> {
        if !self.remote_open() || self.unacked < self.update_threshold {
            return None;
        }
        let delta = std::mem::take(&mut self.unacked);
        self.recv_window = self.recv_window.saturating_add(delta);
        Some(delta)
    }

    // === Writing ===

    /// Reserve up to `want` bytes of send credit.
    ///
    /// Returns the number of bytes that may be sent now; 0 means wait for a
    /// WindowUpdate.
    ///
    /// # Errors
    /// `StreamReset` after RST; `WriteAfterClose` after the local FIN.
    pub fn reserve_send(&mut self, want: usize) -> Result<usize> {
        self.check_writable()?;
        let n = want.min(self.send_window as usize);
        self.send_window -= n as u32;
        Ok(n)
    }

    /// Fail if data can no longer be sent.
    pub fn check_writable(&self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Reset => Err(Error::StreamReset),
            _ if !self.local_open() => Err(Error::WriteAfterClose),
            _ => Ok(()),
        }
    }

    /// Local side sends FIN.
    pub fn close_local(&mut self) -> Result<()> {
        self.lifecycle = match self.lifecycle {
            Lifecycle::Open => Lifecycle::HalfClosedLocal,
            Lifecycle::HalfClosedRemote => Lifecycle::Closed,
            Lifecycle::Reset => return Err(Error::StreamReset),
            Lifecycle::HalfClosedLocal | Lifecycle::Closed => return Err(Error::WriteAfterClose),
        };
        Ok(())
    }
}
