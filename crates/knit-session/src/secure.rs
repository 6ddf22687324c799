//! Noise handshake driver and the encrypted byte stream it yields.

use bytes::{Buf, Bytes};
use futures_util::{ready, SinkExt, StreamExt};
use knit_core::codec::{self, SecureCodec, MAX_PLAINTEXT_CHUNK};
use knit_core::{Error, Handshake, Result, Role};
use knit_crypto::kdf::HASH_LEN;
use knit_crypto::{Keypair, PeerId, PublicKey};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::{Framed, FramedParts};

/// Default bound on each handshake read.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake options.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Bytes carried in the local handshake payload.
    pub early_data: Option<Bytes>,
    /// Identity the remote must prove, if known.
    pub expected_peer: Option<PeerId>,
    /// Bound on each handshake read.
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            early_data: None,
            expected_peer: None,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Authenticated, encrypted byte stream over `T`.
///
/// Writes are sealed in chunks of at most [`MAX_PLAINTEXT_CHUNK`] bytes; reads
/// return plaintext in arrival order. A chunk that fails authentication
/// surfaces as an I/O error wrapping [`Error::Decrypt`], and every later read
/// fails the same way.
pub struct SecureStream<T> {
    framed: Framed<T, SecureCodec>,
    /// Decrypted bytes not yet handed to the reader.
    pending: Bytes,
    remote_peer: PeerId,
    remote_public: PublicKey,
    remote_early_data: Option<Bytes>,
    handshake_hash: [u8; HASH_LEN],
    failed: bool,
}

impl<T> SecureStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the XX handshake over `io`.
    ///
    /// Any bytes the peer sent after its last handshake message are kept and
    /// decrypted as transport data.
    ///
    /// # Errors
    ///
    /// Handshake errors from [`Handshake`], `Timeout` when a read exceeds
    /// `config.timeout`, and `Io` when the channel fails or closes early.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(tcp: tokio::net::TcpStream) -> knit_core::Result<()> {
    /// use knit_core::Role;
    /// use knit_crypto::Keypair;
    /// use knit_session::secure::{HandshakeConfig, SecureStream};
    ///
    /// let identity = Keypair::generate();
    /// let secure = SecureStream::handshake(tcp, Role::Initiator, &identity, &HandshakeConfig::default()).await?;
    /// println!("connected to {}", secure.remote_peer());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn handshake(
        io: T,
        role: Role,
        identity: &Keypair,
        config: &HandshakeConfig,
    ) -> Result<Self> {
        let mut handshake = Handshake::new(
            role,
            identity,
            config.early_data.clone(),
            config.expected_peer,
        )?;
        let mut framed = Framed::new(io, codec::length_prefixed());

        while !handshake.is_complete() {
            if handshake.is_write_turn() {
                let message = handshake.write_message()?;
                framed.send(Bytes::from(message)).await?;
            } else {
                let message = tokio::time::timeout(config.timeout, framed.next())
                    .await
                    .map_err(|_| Error::Timeout)?
                    .ok_or_else(|| Error::Io(io::ErrorKind::UnexpectedEof.into()))??;
                handshake.read_message(&message)?;
            }
        }

        let outcome = handshake.into_outcome()?;
        tracing::debug!(?role, peer = %outcome.remote_peer, "secure channel established");

        let old = framed.into_parts();
        let mut parts = FramedParts::new::<Bytes>(old.io, SecureCodec::new(outcome.send, outcome.recv));
        parts.read_buf = old.read_buf;
        parts.write_buf = old.write_buf;

        Ok(Self {
            framed: Framed::from_parts(parts),
            pending: Bytes::new(),
            remote_peer: outcome.remote_peer,
            remote_public: outcome.remote_public,
            remote_early_data: outcome.remote_early_data,
            handshake_hash: outcome.handshake_hash,
            failed: false,
        })
    }
}

impl<T> SecureStream<T> {
    /// Peer id the remote proved during the handshake.
    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    /// Remote identity key.
    pub fn remote_public(&self) -> &PublicKey {
        &self.remote_public
    }

    /// Early data from the remote handshake payload.
    pub fn remote_early_data(&self) -> Option<&Bytes> {
        self.remote_early_data.as_ref()
    }

    /// Transcript hash, identical on both ends.
    pub fn handshake_hash(&self) -> &[u8; HASH_LEN] {
        &self.handshake_hash
    }

    /// Underlying channel.
    pub fn get_ref(&self) -> &T {
        self.framed.get_ref()
    }
}

impl<T> std::fmt::Debug for SecureStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream")
            .field("remote_peer", &self.remote_peer)
            .field("codec", self.framed.codec())
            .finish_non_exhaustive()
    }
}

impl<T> AsyncRead for SecureStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        while this.pending.is_empty() {
            if this.failed {
                return Poll::Ready(Err(Error::Decrypt.into()));
            }
            match ready!(this.framed.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => this.pending = chunk,
                Some(Err(err)) => {
                    if matches!(err, Error::Decrypt) {
                        this.failed = true;
                    }
                    return Poll::Ready(Err(err.into()));
                }
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending[..n]);
        this.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<T> AsyncWrite for SecureStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(this.framed.poll_ready_unpin(cx))?;
        let n = buf.len().min(MAX_PLAINTEXT_CHUNK);
        this.framed.start_send_unpin(Bytes::copy_from_slice(&buf[..n]))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .framed
            .poll_flush_unpin(cx)
            .map_err(io::Error::from)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .framed
            .poll_close_unpin(cx)
            .map_err(io::Error::from)
    }
}
