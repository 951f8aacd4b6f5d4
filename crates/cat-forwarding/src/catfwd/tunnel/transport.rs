use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("tunnel: session closed")]
    SessionClosed,
    #[error("tunnel: io: {0}")]
    Io(#[from] std::io::Error),
}

/// One multiplexed connection to the relay.
///
/// Logical streams are opened by the relay (one per remote peer) and handed
/// out by [`TransportSession::accept_stream`].
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Waits for the next logical stream. Returns
    /// [`TransportError::SessionClosed`] once the session is gone; an
    /// [`TransportError::Io`] reports a session failure and is followed by
    /// `SessionClosed` when that failure was fatal.
    async fn accept_stream(&self) -> Result<BoxedStream, TransportError>;
    /// Resolves once the underlying relay connection has ended.
    async fn closed(&self);
    async fn close(&self);
    fn remote_addr(&self) -> Option<SocketAddr>;
}

pub mod tcp;
