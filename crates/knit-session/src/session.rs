//! Stream multiplexer over one byte channel.
//!
//! Two tasks run per session. The reader decodes frames and updates the
//! stream table; the writer drains an ordered queue of outbound frames.
//! Everything else (stream handles, `open_stream`, `close`) mutates the table
//! under a short-lived lock and enqueues frames, so frames leave in the order
//! the state changes were made.

use crate::stream::Stream;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use knit_core::session::{InboundStream, StreamIds};
use knit_core::{
    CloseReason, Error, Flags, Frame, FrameCodec, GoAwayCode, Result, Role, SessionConfig,
    StreamState,
};
use knit_crypto::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Queue entries for the writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    /// Flush, shut the write half down and stop.
    Shutdown,
}

struct StreamEntry {
    state: StreamState,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamEntry {
    fn new(state: StreamState) -> Self {
        Self {
            state,
            read_waker: None,
            write_waker: None,
        }
    }

    fn wake_all(&mut self, wakers: &mut Vec<Waker>) {
        wakers.extend(self.read_waker.take());
        wakers.extend(self.write_waker.take());
    }
}

struct State {
    streams: HashMap<u32, StreamEntry>,
    ids: StreamIds,
    close_reason: Option<CloseReason>,
    /// GoAway sent or received: no new streams in either direction.
    going_away: bool,
    pings: HashMap<u32, oneshot::Sender<()>>,
    next_ping: u32,
    last_activity: Instant,
}

impl State {
    fn active_streams(&self) -> usize {
        self.streams
            .values()
            .filter(|entry| !entry.state.is_finished())
            .count()
    }

    fn check_open(&self) -> Result<()> {
        match &self.close_reason {
            Some(reason) => Err(Error::SessionClosed(reason.clone())),
            None => Ok(()),
        }
    }
}

/// State shared by the session handle, its tasks and every stream handle.
pub(crate) struct Shared {
    state: Mutex<State>,
    outbound: mpsc::UnboundedSender<Outbound>,
    config: SessionConfig,
    role: Role,
    remote_peer: Option<PeerId>,
    cancel: CancellationToken,
    /// Signalled whenever a stream finishes or leaves the table.
    drained: Notify,
}

impl Shared {
    fn send(&self, frame: Frame) {
        // The writer only goes away after shutdown, when frames are moot.
        let _ = self.outbound.send(Outbound::Frame(frame));
    }

    fn send_stream_flags(&self, stream_id: u32, flags: Flags) {
        self.send(Frame::WindowUpdate {
            stream_id,
            flags,
            delta: 0,
        });
    }

    fn closed_error(&self) -> Error {
        let state = self.state.lock();
        match &state.close_reason {
            Some(reason) => Error::SessionClosed(reason.clone()),
            None => Error::GoneAway,
        }
    }

    /// Record why the session ended and wake everything waiting on it.
    ///
    /// Only the first call has any effect. `go_away` is sent before the
    /// writer is told to stop.
    fn shutdown(&self, reason: CloseReason, go_away: Option<GoAwayCode>) {
        let mut wakers = Vec::new();
        {
            let mut state = self.state.lock();
            if state.close_reason.is_some() {
                return;
            }
            match &reason {
                CloseReason::Fatal(err) => {
                    tracing::warn!(role = ?self.role, error = %err, "session failed")
                }
                other => tracing::debug!(role = ?self.role, reason = %other, "session closed"),
            }
            state.close_reason = Some(reason);
            state.going_away = true;
            state.pings.clear();
            for entry in state.streams.values_mut() {
                entry.wake_all(&mut wakers);
            }
            if let Some(code) = go_away {
                self.send(Frame::GoAway { code });
            }
            let _ = self.outbound.send(Outbound::Shutdown);
        }

        for waker in wakers {
            waker.wake();
        }
        self.cancel.cancel();
        self.drained.notify_waiters();
    }

    fn fail(&self, err: Error) {
        let code = err.go_away_code();
        self.shutdown(CloseReason::Fatal(Arc::new(err)), Some(code));
    }

    // === Stream operations, called from stream handles ===

    pub(crate) fn poll_read(
        &self,
        stream_id: u32,
        cx: &mut Context<'_>,
        max: usize,
    ) -> Poll<Result<Option<Bytes>>> {
        let mut state = self.state.lock();
        if let Some(reason) = state.close_reason.as_ref().filter(|r| r.is_error()) {
            return Poll::Ready(Err(Error::SessionClosed(reason.clone())));
        }
        let reason = state.close_reason.clone();
        let Some(entry) = state.streams.get_mut(&stream_id) else {
            return Poll::Ready(Err(Error::StreamReset));
        };

        if let Some(chunk) = entry.state.read(max) {
            if let Some(delta) = entry.state.take_window_update() {
                if reason.is_none() {
                    self.send(Frame::WindowUpdate {
                        stream_id,
                        flags: Flags::empty(),
                        delta,
                    });
                }
            }
            return Poll::Ready(Ok(Some(chunk)));
        }
        if entry.state.is_eof() {
            return Poll::Ready(Ok(None));
        }
        if entry.state.lifecycle() == knit_core::Lifecycle::Reset {
            return Poll::Ready(Err(Error::StreamReset));
        }
        if let Some(reason) = reason {
            return Poll::Ready(Err(Error::SessionClosed(reason)));
        }

        entry.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    pub(crate) fn poll_write(
        &self,
        stream_id: u32,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize>> {
        let mut state = self.state.lock();
        state.check_open()?;
        let entry = state.streams.get_mut(&stream_id).ok_or(Error::StreamReset)?;

        let n = entry.state.reserve_send(buf.len())?;
        if n == 0 && !buf.is_empty() {
            entry.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        if n > 0 {
            self.send(Frame::Data {
                stream_id,
                flags: Flags::empty(),
                payload: Bytes::copy_from_slice(&buf[..n]),
            });
        }
        Poll::Ready(Ok(n))
    }

    pub(crate) fn close_write(&self, stream_id: u32) -> Result<()> {
        let finished = {
            let mut state = self.state.lock();
            state.check_open()?;
            let entry = state.streams.get_mut(&stream_id).ok_or(Error::StreamReset)?;
            entry.state.close_local()?;
            self.send_stream_flags(stream_id, Flags::FIN);
            tracing::trace!(stream_id, "sent FIN");
            entry.state.is_finished()
        };
        if finished {
            self.drained.notify_waiters();
        }
        Ok(())
    }

    pub(crate) fn reset(&self, stream_id: u32) -> Result<()> {
        let mut wakers = Vec::new();
        {
            let mut state = self.state.lock();
            state.check_open()?;
            let entry = state.streams.get_mut(&stream_id).ok_or(Error::StreamReset)?;
            if entry.state.is_finished() {
                return Ok(());
            }
            entry.state.on_reset();
            entry.wake_all(&mut wakers);
            self.send_stream_flags(stream_id, Flags::RST);
            tracing::debug!(stream_id, "stream reset locally");
        }
        for waker in wakers {
            waker.wake();
        }
        self.drained.notify_waiters();
        Ok(())
    }

    /// Drop a stream from the table once its handle is gone.
    ///
    /// A stream not yet closed in both directions is reset, so a peer still
    /// writing to it stops waiting for credit. Later frames for it are
    /// discarded.
    pub(crate) fn release(&self, stream_id: u32) {
        {
            let mut state = self.state.lock();
            let Some(entry) = state.streams.remove(&stream_id) else {
                return;
            };
            if state.close_reason.is_none() && !entry.state.is_finished() {
                self.send_stream_flags(stream_id, Flags::RST);
                tracing::debug!(stream_id, "stream dropped before closing, sent RST");
            }
            if state.streams.is_empty() {
                state.last_activity = Instant::now();
            }
        }
        self.drained.notify_waiters();
    }

    // === Inbound frames, called from the reader task ===

    /// Apply one inbound frame. Returns the handle of a newly accepted stream.
    fn on_frame(self: &Arc<Self>, frame: Frame) -> Result<Option<Stream>> {
        match frame {
            Frame::Ping { flags, opaque } => {
                let mut state = self.state.lock();
                state.last_activity = Instant::now();
                if flags.contains(Flags::SYN) {
                    self.send(Frame::Ping {
                        flags: Flags::ACK,
                        opaque,
                    });
                } else if let Some(tx) = state.pings.remove(&opaque) {
                    let _ = tx.send(());
                }
                Ok(None)
            }
            Frame::GoAway { code } => {
                // Non-normal codes end the session in the reader loop.
                let mut state = self.state.lock();
                state.going_away = true;
                tracing::debug!(%code, "peer is going away");
                Ok(None)
            }
            Frame::Data {
                stream_id,
                flags,
                payload,
            } => self.on_stream_frame(stream_id, flags, Some(payload), 0),
            Frame::WindowUpdate {
                stream_id,
                flags,
                delta,
            } => self.on_stream_frame(stream_id, flags, None, delta),
        }
    }

    fn on_stream_frame(
        self: &Arc<Self>,
        stream_id: u32,
        flags: Flags,
        payload: Option<Bytes>,
        delta: u32,
    ) -> Result<Option<Stream>> {
        let mut wakers = Vec::new();
        let mut accepted = false;
        let finished;
        {
            let mut state = self.state.lock();
            state.last_activity = Instant::now();

            let in_table = state.streams.contains_key(&stream_id);
            match state
                .ids
                .classify(stream_id, flags.contains(Flags::SYN), in_table)?
            {
                InboundStream::Stale => {
                    tracing::trace!(stream_id, "discarding frame for removed stream");
                    return Ok(None);
                }
                InboundStream::Open => {
                    if state.going_away || state.active_streams() >= self.config.max_streams {
                        tracing::debug!(stream_id, "refusing inbound stream");
                        self.send_stream_flags(stream_id, Flags::RST);
                        return Ok(None);
                    }
                    state.streams.insert(
                        stream_id,
                        StreamEntry::new(StreamState::new(
                            stream_id,
                            self.config.initial_window,
                            self.config.window_update_threshold,
                        )),
                    );
                    self.send_stream_flags(stream_id, Flags::ACK);
                    tracing::debug!(stream_id, "accepted inbound stream");
                    accepted = true;
                }
                InboundStream::Existing => {}
            }

            let Some(entry) = state.streams.get_mut(&stream_id) else {
                return Ok(None);
            };

            if flags.contains(Flags::RST) {
                if !entry.state.is_finished() {
                    tracing::debug!(stream_id, "stream reset by peer");
                }
                entry.state.on_reset();
                entry.wake_all(&mut wakers);
            } else {
                if delta > 0 {
                    entry.state.on_window_update(delta)?;
                    wakers.extend(entry.write_waker.take());
                }
                if let Some(payload) = payload {
                    entry.state.on_data(payload)?;
                    wakers.extend(entry.read_waker.take());
                }
                if flags.contains(Flags::FIN) {
                    entry.state.on_fin();
                    wakers.extend(entry.read_waker.take());
                }
            }
            finished = entry.state.is_finished();
        }

        for waker in wakers {
            waker.wake();
        }
        if finished {
            self.drained.notify_waiters();
        }
        Ok(accepted.then(|| Stream::new(stream_id, Arc::clone(self))))
    }
}

/// A multiplexed session.
///
/// Dropping the session aborts it: a best-effort GoAway is queued and every
/// stream operation fails with `SessionClosed`.
pub struct Session {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start a session over an already-secured channel.
    ///
    /// Spawns the reader and writer tasks, so this must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when `config` is inconsistent.
    pub fn new<T>(io: T, role: Role, config: SessionConfig) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_remote_peer(io, role, config, None)
    }

    pub(crate) fn with_remote_peer<T>(
        io: T,
        role: Role,
        config: SessionConfig,
        remote_peer: Option<PeerId>,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let (read_half, write_half) = tokio::io::split(io);
        let frames_in = FramedRead::new(read_half, FrameCodec::new(config.initial_window));
        let frames_out = FramedWrite::new(write_half, FrameCodec::new(config.initial_window));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let idle_timeout = config.idle_timeout;

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                streams: HashMap::new(),
                ids: StreamIds::new(role),
                close_reason: None,
                going_away: false,
                pings: HashMap::new(),
                next_ping: rand::random(),
                last_activity: Instant::now(),
            }),
            outbound: outbound_tx,
            config,
            role,
            remote_peer,
            cancel: CancellationToken::new(),
            drained: Notify::new(),
        });

        let writer = tokio::spawn(writer_loop(Arc::clone(&shared), frames_out, outbound_rx));
        tokio::spawn(reader_loop(Arc::clone(&shared), frames_in, accept_tx));
        if let Some(timeout) = idle_timeout {
            tokio::spawn(idle_watchdog(Arc::clone(&shared), timeout));
        }
        tracing::debug!(?role, "session started");

        Ok(Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Local role.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Identity the remote proved, when the session was built by an upgrade.
    pub fn remote_peer(&self) -> Option<PeerId> {
        self.shared.remote_peer
    }

    /// Why the session ended, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.state.lock().close_reason.clone()
    }

    /// Whether the session has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().close_reason.is_some()
    }

    /// Open an outbound stream.
    ///
    /// The SYN is queued immediately and the stream is usable at once; the
    /// peer's acknowledgement is not awaited.
    ///
    /// # Errors
    ///
    /// `TooManyStreams` at the local concurrency limit (nothing is sent),
    /// `GoneAway` after GoAway in either direction, `SessionClosed` once the
    /// session has ended.
    pub fn open_stream(&self) -> Result<Stream> {
        let stream_id = {
            let mut state = self.shared.state.lock();
            state.check_open()?;
            if state.going_away {
                return Err(Error::GoneAway);
            }
            if state.active_streams() >= self.shared.config.max_streams {
                return Err(Error::TooManyStreams);
            }

            let stream_id = state.ids.allocate()?;
            state.streams.insert(
                stream_id,
                StreamEntry::new(StreamState::new(
                    stream_id,
                    self.shared.config.initial_window,
                    self.shared.config.window_update_threshold,
                )),
            );
            self.shared.send_stream_flags(stream_id, Flags::SYN);
            stream_id
        };

        tracing::debug!(stream_id, "opened stream");
        Ok(Stream::new(stream_id, Arc::clone(&self.shared)))
    }

    /// Wait for the next peer-initiated stream.
    ///
    /// Cancel-safe: no stream is lost when the future is dropped.
    ///
    /// # Errors
    ///
    /// `GoneAway` once the peer has sent GoAway, `SessionClosed` once the
    /// session has ended.
    pub async fn accept_stream(&self) -> Result<Stream> {
        let mut accept_rx = self.accept_rx.lock().await;
        match accept_rx.recv().await {
            Some(stream) => Ok(stream),
            None => Err(self.shared.closed_error()),
        }
    }

    /// Measure a round trip to the peer.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the session ends before the response arrives.
    pub async fn ping(&self) -> Result<Duration> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            state.check_open()?;
            let opaque = state.next_ping;
            state.next_ping = opaque.wrapping_add(1);
            state.pings.insert(opaque, tx);
            self.shared.send(Frame::Ping {
                flags: Flags::SYN,
                opaque,
            });
        }

        let started = Instant::now();
        rx.await.map_err(|_| self.shared.closed_error())?;
        Ok(started.elapsed())
    }

    /// Close gracefully.
    ///
    /// Sends GoAway with `code`, waits for every open stream to finish, then
    /// flushes and shuts the channel down. Closing an ended session is a
    /// no-op.
    pub async fn close(&self, code: GoAwayCode) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.close_reason.is_some() {
                return Ok(());
            }
            if !state.going_away {
                state.going_away = true;
                self.shared.send(Frame::GoAway { code });
            }
        }
        tracing::debug!(%code, "closing session");

        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let state = self.shared.state.lock();
                if state.close_reason.is_some() || state.active_streams() == 0 {
                    break;
                }
            }
            drained.await;
        }

        self.shared.shutdown(CloseReason::Local(code), None);
        self.join_writer().await;
        Ok(())
    }

    /// Terminate at once, sending GoAway with `code` on a best-effort basis.
    pub fn abort(&self, code: GoAwayCode) {
        self.shared.shutdown(CloseReason::Local(code), Some(code));
    }

    /// Wait until the writer has flushed and released the channel.
    async fn join_writer(&self) {
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.shared.role)
            .field("remote_peer", &self.shared.remote_peer)
            .field("close_reason", &self.close_reason())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared
            .shutdown(CloseReason::Local(GoAwayCode::Normal), Some(GoAwayCode::Normal));
    }
}

async fn reader_loop<T>(
    shared: Arc<Shared>,
    mut frames: FramedRead<ReadHalf<T>, FrameCodec>,
    accept_tx: mpsc::UnboundedSender<Stream>,
) where
    T: AsyncRead + AsyncWrite,
{
    let mut accept_tx = Some(accept_tx);

    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            next = frames.next() => next,
        };

        match next {
            None => {
                shared.shutdown(CloseReason::Eof, None);
                return;
            }
            Some(Err(err)) => {
                shared.fail(err);
                return;
            }
            Some(Ok(Frame::GoAway { code })) if code != GoAwayCode::Normal => {
                shared.shutdown(CloseReason::Remote(code), None);
                return;
            }
            Some(Ok(frame)) => {
                let go_away = matches!(frame, Frame::GoAway { .. });
                match shared.on_frame(frame) {
                    Ok(Some(stream)) => {
                        if let Some(tx) = &accept_tx {
                            // A closed receiver hands the stream back; dropping it resets it.
                            let _ = tx.send(stream);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        shared.fail(err);
                        return;
                    }
                }
                if go_away {
                    accept_tx = None;
                }
            }
        }
    }
}

async fn writer_loop<T>(
    shared: Arc<Shared>,
    mut frames: FramedWrite<WriteHalf<T>, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) where
    T: AsyncRead + AsyncWrite,
{
    loop {
        let Some(first) = outbound.recv().await else {
            return;
        };

        // Batch whatever is already queued into one flush.
        let mut next = Some(first);
        let mut stop = false;
        while let Some(item) = next.take() {
            match item {
                Outbound::Frame(frame) => {
                    if let Err(err) = frames.feed(frame).await {
                        shared.fail(err);
                        return;
                    }
                }
                Outbound::Shutdown => {
                    stop = true;
                    break;
                }
            }
            next = outbound.try_recv().ok();
        }

        if let Err(err) = frames.flush().await {
            shared.fail(err);
            return;
        }
        if stop {
            let _ = frames.close().await;
            return;
        }
    }
}

async fn idle_watchdog(shared: Arc<Shared>, timeout: Duration) {
    let mut deadline = Instant::now() + timeout;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let idle = {
            let state = shared.state.lock();
            if state.active_streams() > 0 {
                deadline = Instant::now() + timeout;
                false
            } else {
                deadline = state.last_activity + timeout;
                state.last_activity.elapsed() >= timeout
            }
        };

        if idle {
            tracing::debug!(?timeout, "session idle");
            shared.shutdown(CloseReason::IdleTimeout, Some(GoAwayCode::Normal));
            return;
        }
    }
}
