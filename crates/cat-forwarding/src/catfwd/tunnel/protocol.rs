//! Plaintext handshake spoken on the raw relay connection before the
//! multiplexed session starts.
//!
//! ```text
//! client -> relay   <version>\npawshake_request\n
//! relay  -> client  <version>\npawshake_successful\nport_<port>\n
//!                   <version>\nmax_conn_limit_exceeded
//! ```
//!
//! Every message carries the version tag, so a relay built for a different
//! client never gets its reply half-parsed.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a reply; anything longer is garbage.
pub const MAX_REPLY_BYTES: usize = 1024;

const VERSION_PREFIX: &str = "cat_forwarding_v";
const REQUEST_TAIL: &str = "pawshake_request\n";
const SUCCESS_TAIL: &str = "pawshake_successful\nport_";
const CAPACITY_TAIL: &str = "max_conn_limit_exceeded";
const MAX_PORT_DIGITS: usize = 5;
/// How long to look for stray bytes after the capacity sentinel.
const SENTINEL_END_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("max connection limit exceeded")]
    CapacityExceeded,
    #[error("pawshake failed ({0}); client/server version mismatch? please update the cat-forwarding client")]
    Failed(&'static str),
}

/// Versioned handshake strings for one client build.
#[derive(Debug, Clone)]
pub struct Handshake {
    request: String,
    success_prefix: String,
    capacity_exceeded: String,
}

impl Handshake {
    pub fn new(version: &str) -> Self {
        let tag = format!("{VERSION_PREFIX}{}", version.trim());
        Self {
            request: format!("{tag}\n{REQUEST_TAIL}"),
            success_prefix: format!("{tag}\n{SUCCESS_TAIL}"),
            capacity_exceeded: format!("{tag}\n{CAPACITY_TAIL}"),
        }
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn success_prefix(&self) -> &str {
        &self.success_prefix
    }

    pub fn capacity_exceeded(&self) -> &str {
        &self.capacity_exceeded
    }

    /// Classifies the reply bytes received so far. `CapacityExceeded` means
    /// the bytes equal the sentinel; the caller still has to see it end.
    pub fn parse_reply(&self, buf: &[u8]) -> Reply {
        if buf.len() > MAX_REPLY_BYTES {
            return Reply::Invalid;
        }

        let capacity = self.capacity_exceeded().as_bytes();
        if buf == capacity {
            return Reply::CapacityExceeded;
        }

        let success = self.success_prefix().as_bytes();
        if buf.len() <= success.len() {
            if success.starts_with(buf) || capacity.starts_with(buf) {
                return Reply::NeedMore;
            }
            return Reply::Invalid;
        }

        let Some(rest) = buf.strip_prefix(success) else {
            return Reply::Invalid;
        };

        let (digits, terminated) = match rest.split_last() {
            Some((b'\n', digits)) => (digits, true),
            _ => (rest, false),
        };
        if digits.len() > MAX_PORT_DIGITS || !digits.iter().all(u8::is_ascii_digit) {
            return Reply::Invalid;
        }
        if !terminated {
            return Reply::NeedMore;
        }

        // Digits are ASCII and at most five of them, so this cannot overflow u32.
        let port = digits
            .iter()
            .fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0'));
        match u16::try_from(port) {
            Ok(p) if p != 0 && !digits.is_empty() => Reply::Assigned(p),
            _ => Reply::Invalid,
        }
    }

    /// Sends the request and reads one reply, all within `timeout`.
    ///
    /// The reply is consumed one byte at a time so that nothing the relay sends
    /// after it (the multiplexed session) is swallowed here.
    pub async fn perform<S>(&self, conn: &mut S, timeout: Duration) -> Result<u16, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(timeout, self.exchange(conn)).await {
            Ok(res) => res,
            Err(_) => Err(HandshakeError::Failed("timed out")),
        }
    }

    async fn exchange<S>(&self, conn: &mut S) -> Result<u16, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        conn.write_all(self.request().as_bytes())
            .await
            .map_err(|_| HandshakeError::Failed("write request"))?;
        conn.flush()
            .await
            .map_err(|_| HandshakeError::Failed("write request"))?;

        let mut buf = Vec::with_capacity(self.success_prefix.len() + 8);
        loop {
            let b = match conn.read_u8().await {
                Ok(b) => b,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(HandshakeError::Failed("connection closed mid-reply"));
                }
                Err(_) => return Err(HandshakeError::Failed("read reply")),
            };
            buf.push(b);

            match self.parse_reply(&buf) {
                Reply::NeedMore => continue,
                Reply::Assigned(port) => return Ok(port),
                Reply::CapacityExceeded => return Err(confirm_sentinel_end(conn).await),
                Reply::Invalid => return Err(HandshakeError::Failed("unexpected reply")),
            }
        }
    }
}

/// The capacity sentinel has no terminator, so it only counts if nothing
/// follows it: EOF, a read error or silence all confirm it.
async fn confirm_sentinel_end<S>(conn: &mut S) -> HandshakeError
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(SENTINEL_END_WAIT, conn.read_u8()).await {
        Ok(Ok(_)) => HandshakeError::Failed("unexpected reply"),
        Ok(Err(_)) | Err(_) => HandshakeError::CapacityExceeded,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    NeedMore,
    Assigned(u16),
    CapacityExceeded,
    Invalid,
}
