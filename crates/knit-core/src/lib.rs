//! Sans-IO protocol engine for knit sessions.
//!
//! This crate holds every wire format and state machine of the protocol stack,
//! with no I/O of its own:
//! - Protocol negotiation messages
//! - `Noise_XX_25519_ChaChaPoly_SHA256` handshake and its identity payload
//! - Secure channel framing (sealed, length-prefixed chunks)
//! - Multiplexer frames, stream lifecycle and flow control
//!
//! The async driver lives in `knit-session`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cipher;
pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod negotiate;
pub mod payload;
pub mod session;
pub mod stream;

pub use error::{CloseReason, Error, ErrorCategory, GoAwayCode, Result};
pub use frame::{Flags, Frame, FrameCodec};
pub use handshake::{Handshake, HandshakeOutcome};
pub use session::{Role, SessionConfig};
pub use stream::{Lifecycle, StreamState};
