//! Cancellation and deadline adapters.
//!
//! Every suspending operation in this crate is cancel-safe: dropping its future
//! is a valid cancellation. These helpers turn an external token or a deadline
//! into that drop and report it as `Cancelled` or `Timeout`.

use knit_core::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `fut` until it completes or `token` is cancelled.
///
/// # Example
///
/// ```no_run
/// # async fn example(session: &knit_session::Session) -> knit_core::Result<()> {
/// use knit_session::cancel::cancellable;
/// use tokio_util::sync::CancellationToken;
///
/// let token = CancellationToken::new();
/// let stream = cancellable(&token, session.accept_stream()).await?;
/// # Ok(())
/// # }
/// ```
pub async fn cancellable<F, T>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Run `fut` with a deadline.
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| Error::Timeout)?
}
