//! Protocol negotiation over any byte channel.
//!
//! Runs on the raw connection (security protocol), on a [`SecureStream`]
//! (multiplexer protocol) and on a [`Stream`] (application protocol). Reads
//! are exact, so bytes that follow the final message stay in the channel for
//! whatever protocol was selected.
//!
//! [`SecureStream`]: crate::SecureStream
//! [`Stream`]: crate::Stream

use knit_core::negotiate::{self, Message, HEADER_LEN, MAX_PROPOSALS};
use knit_core::{Error, Result, Role};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Propose `protocols` in order until the listener accepts one.
///
/// # Errors
///
/// `NoCommonProtocol` when every candidate is rejected (the listener is told
/// with an Exhausted message); `InvalidNegotiation` when the listener answers
/// out of turn or accepts an id that was not proposed.
pub async fn dialer_select<T, S>(io: &mut T, protocols: &[S]) -> Result<String>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: AsRef<str>,
{
    for protocol in protocols {
        negotiate::validate_protocol_id(protocol.as_ref())?;
    }

    for protocol in protocols {
        let protocol = protocol.as_ref();
        write_message(io, &Message::Propose(protocol.to_owned())).await?;

        match read_message(io).await? {
            Message::Accept(id) if id == protocol => {
                tracing::debug!(protocol, "dialer selected protocol");
                return Ok(id);
            }
            Message::Accept(id) => {
                return Err(Error::InvalidNegotiation(format!(
                    "Listener accepted {id:?} while {protocol:?} was proposed"
                )))
            }
            Message::Reject => {
                tracing::trace!(protocol, "protocol rejected");
            }
            other => {
                return Err(Error::InvalidNegotiation(format!(
                    "Unexpected {other:?} from listener"
                )))
            }
        }
    }

    write_message(io, &Message::Exhausted).await?;
    Err(Error::NoCommonProtocol)
}

/// Answer proposals until one matches `protocols`.
///
/// # Errors
///
/// `NoCommonProtocol` when the dialer gives up; `InvalidNegotiation` for
/// malformed messages or more than `MAX_PROPOSALS` proposals.
pub async fn listener_select<T, S>(io: &mut T, protocols: &[S]) -> Result<String>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: AsRef<str>,
{
    let mut proposals = 0usize;

    loop {
        match read_message(io).await? {
            Message::Propose(id) => {
                proposals += 1;
                if proposals > MAX_PROPOSALS {
                    return Err(Error::InvalidNegotiation(format!(
                        "More than {MAX_PROPOSALS} proposals"
                    )));
                }

                if protocols.iter().any(|p| p.as_ref() == id) {
                    write_message(io, &Message::Accept(id.clone())).await?;
                    tracing::debug!(protocol = %id, "listener selected protocol");
                    return Ok(id);
                }
                write_message(io, &Message::Reject).await?;
            }
            Message::Exhausted => return Err(Error::NoCommonProtocol),
            other => {
                return Err(Error::InvalidNegotiation(format!(
                    "Unexpected {other:?} from dialer"
                )))
            }
        }
    }
}

/// Dial or listen depending on `role`.
pub async fn select<T, S>(io: &mut T, role: Role, protocols: &[S]) -> Result<String>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: AsRef<str>,
{
    match role {
        Role::Initiator => dialer_select(io, protocols).await,
        Role::Responder => listener_select(io, protocols).await,
    }
}

async fn read_message<T: AsyncRead + Unpin>(io: &mut T) -> Result<Message> {
    let mut header = [0u8; HEADER_LEN];
    io.read_exact(&mut header).await?;
    let (tag, len) = negotiate::parse_header(header)?;

    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;
    Message::from_parts(tag, &body)
}

async fn write_message<T: AsyncWrite + Unpin>(io: &mut T, message: &Message) -> Result<()> {
    let bytes = message.serialize()?;
    io.write_all(&bytes).await?;
    io.flush().await?;
    Ok(())
}
