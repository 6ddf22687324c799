//! Async session layer for knit.
//!
//! Drives the sans-IO engine in `knit-core` over any Tokio byte channel:
//! - [`negotiate`]: protocol selection on a raw channel, a secure channel or a stream
//! - [`secure`]: Noise XX handshake and the encrypted [`SecureStream`]
//! - [`Session`] and [`Stream`]: flow-controlled stream multiplexing
//! - [`upgrade`]: all of the above in order, from a fresh connection
//!
//! # Example
//!
//! ```no_run
//! # async fn example(tcp: tokio::net::TcpStream) -> knit_core::Result<()> {
//! use knit_core::{GoAwayCode, Role};
//! use knit_crypto::Keypair;
//! use knit_session::{negotiate, upgrade, UpgradeConfig};
//!
//! let identity = Keypair::generate();
//! let session = upgrade(tcp, Role::Responder, &identity, &UpgradeConfig::default(), None).await?;
//!
//! let mut stream = session.accept_stream().await?;
//! negotiate::listener_select(&mut stream, &["echo/1.0"]).await?;
//! while let Some(chunk) = stream.read(4096).await? {
//!     stream.write(&chunk).await?;
//! }
//! stream.close_write()?;
//! session.close(GoAwayCode::Normal).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cancel;
pub mod negotiate;
pub mod secure;
mod session;
mod stream;
mod upgrade;

pub use knit_core::{CloseReason, Error, GoAwayCode, Result, Role, SessionConfig};
pub use secure::{HandshakeConfig, SecureStream};
pub use session::Session;
pub use stream::Stream;
pub use upgrade::{upgrade, UpgradeConfig};
