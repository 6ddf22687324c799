//! Raw connection to multiplexed session in one call.

use crate::cancel::with_timeout;
use crate::negotiate;
use crate::secure::{HandshakeConfig, SecureStream, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::session::Session;
use bytes::Bytes;
use knit_core::negotiate::{MUX_PROTOCOL, SECURE_PROTOCOL};
use knit_core::{Result, Role, SessionConfig};
use knit_crypto::{Keypair, PeerId};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Upgrade options.
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// Security protocol ids in preference order.
    pub security_protocols: Vec<String>,
    /// Multiplexer protocol ids in preference order.
    pub mux_protocols: Vec<String>,
    /// Bound on each negotiation exchange and each handshake read.
    pub handshake_timeout: Duration,
    /// Bytes carried in the local handshake payload.
    pub early_data: Option<Bytes>,
    /// Multiplexer settings.
    pub session: SessionConfig,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            security_protocols: vec![SECURE_PROTOCOL.to_owned()],
            mux_protocols: vec![MUX_PROTOCOL.to_owned()],
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            early_data: None,
            session: SessionConfig::default(),
        }
    }
}

/// Negotiate security, run the handshake, negotiate the multiplexer and start
/// a session.
///
/// `expected_peer`, when given, must match the identity the remote proves.
///
/// # Errors
///
/// Negotiation, handshake and configuration errors from each stage;
/// `Timeout` when a stage exceeds `config.handshake_timeout`.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> knit_core::Result<()> {
/// use knit_core::Role;
/// use knit_crypto::Keypair;
/// use knit_session::{upgrade, UpgradeConfig};
///
/// let tcp = tokio::net::TcpStream::connect("127.0.0.1:4001").await?;
/// let identity = Keypair::generate();
/// let session = upgrade(tcp, Role::Initiator, &identity, &UpgradeConfig::default(), None).await?;
///
/// let mut stream = session.open_stream()?;
/// stream.write(b"hello").await?;
/// # Ok(())
/// # }
/// ```
pub async fn upgrade<T>(
    mut io: T,
    role: Role,
    identity: &Keypair,
    config: &UpgradeConfig,
    expected_peer: Option<PeerId>,
) -> Result<Session>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    config.session.validate()?;

    let security = with_timeout(
        config.handshake_timeout,
        negotiate::select(&mut io, role, config.security_protocols.as_slice()),
    )
    .await?;
    tracing::debug!(protocol = %security, "security protocol selected");

    let handshake = HandshakeConfig {
        early_data: config.early_data.clone(),
        expected_peer,
        timeout: config.handshake_timeout,
    };
    let mut secure = SecureStream::handshake(io, role, identity, &handshake).await?;

    let mux = with_timeout(
        config.handshake_timeout,
        negotiate::select(&mut secure, role, config.mux_protocols.as_slice()),
    )
    .await?;
    tracing::debug!(protocol = %mux, peer = %secure.remote_peer(), "multiplexer selected");

    let remote_peer = secure.remote_peer();
    Session::with_remote_peer(secure, role, config.session.clone(), Some(remote_peer))
}
