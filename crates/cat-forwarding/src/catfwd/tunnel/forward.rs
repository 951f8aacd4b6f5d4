use std::{io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    task::JoinSet,
};

use crate::catfwd::shutdown::Shutdown;

pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// How a copy loop should treat an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A hiccup; the same operation may be retried.
    Recoverable,
    /// The stream is unusable; the direction ends.
    Terminal,
}

pub fn classify(err: &io::Error) -> ErrorClass {
    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            ErrorClass::Recoverable
        }
        _ => ErrorClass::Terminal,
    }
}

/// Bounded retry of recoverable errors, so a stuck socket cannot spin a core.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(200),
        }
    }
}

struct Retry<'a> {
    policy: &'a RetryPolicy,
    attempts: u32,
    backoff: Duration,
}

impl<'a> Retry<'a> {
    fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            backoff: policy.initial_backoff,
        }
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.backoff = self.policy.initial_backoff;
    }

    /// Sleeps before the next attempt. `false` means the budget is spent.
    async fn wait(&mut self) -> bool {
        if self.attempts >= self.policy.max_retries {
            return false;
        }
        self.attempts += 1;
        tokio::time::sleep(self.backoff).await;
        self.backoff = (self.backoff * 2).min(self.policy.max_backoff);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    RemoteToLocal,
    LocalToRemote,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::RemoteToLocal => write!(f, "remote->local"),
            Direction::LocalToRemote => write!(f, "local->remote"),
        }
    }
}

/// Why one direction stopped. Read/write are relative to that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEnd {
    /// The source reached end-of-stream.
    Eof,
    /// The sink accepted zero bytes.
    WriteClosed,
    ReadFailed(io::ErrorKind),
    WriteFailed(io::ErrorKind),
}

impl CopyEnd {
    pub fn error_kind(&self) -> Option<io::ErrorKind> {
        match self {
            CopyEnd::ReadFailed(kind) | CopyEnd::WriteFailed(kind) => Some(*kind),
            CopyEnd::Eof | CopyEnd::WriteClosed => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CopyOutcome {
    pub direction: Direction,
    pub end: CopyEnd,
    pub bytes: u64,
}

/// Copies `reader` into `writer` chunk by chunk until the stream ends.
pub async fn copy_loop<R, W>(
    direction: Direction,
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    retry: &RetryPolicy,
) -> CopyOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut bytes = 0u64;
    let mut retries = Retry::new(retry);

    let done = |end: CopyEnd, bytes: u64| CopyOutcome {
        direction,
        end,
        bytes,
    };

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return done(CopyEnd::Eof, bytes),
            Ok(n) => {
                retries.reset();
                n
            }
            Err(err) => {
                if classify(&err) == ErrorClass::Recoverable && retries.wait().await {
                    continue;
                }
                return done(CopyEnd::ReadFailed(err.kind()), bytes);
            }
        };

        let mut pos = 0;
        while pos < n {
            match writer.write(&buf[pos..n]).await {
                Ok(0) => return done(CopyEnd::WriteClosed, bytes),
                Ok(k) => {
                    retries.reset();
                    pos += k;
                    bytes += k as u64;
                }
                Err(err) => {
                    if classify(&err) == ErrorClass::Recoverable && retries.wait().await {
                        continue;
                    }
                    return done(CopyEnd::WriteFailed(err.kind()), bytes);
                }
            }
        }

        if let Err(err) = writer.flush().await {
            if classify(&err) == ErrorClass::Terminal {
                return done(CopyEnd::WriteFailed(err.kind()), bytes);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Address of the local service, e.g. `localhost:8080`.
    pub local_addr: String,
    pub buffer_size: usize,
    pub retry: RetryPolicy,
}

#[derive(Debug)]
pub enum PairEnd {
    /// The local service could not be reached; the stream was dropped.
    DialFailed,
    /// A direction ended and tore the pair down. A clean local EOF only
    /// half-closes the remote side and is never reported here.
    Stream(CopyOutcome),
    Shutdown,
}

struct ActivePairGuard;

impl ActivePairGuard {
    fn new() -> Self {
        metrics::counter!("catfwd_pairs_total").increment(1);
        metrics::gauge!("catfwd_active_pairs").increment(1.0);
        Self
    }
}

impl Drop for ActivePairGuard {
    fn drop(&mut self) {
        metrics::gauge!("catfwd_active_pairs").decrement(1.0);
    }
}

/// Services one logical stream: dials the local service and shuttles bytes
/// both ways until either side ends or `shutdown` fires.
pub async fn forward_stream<S>(
    stream: S,
    opts: Arc<ForwardOptions>,
    shutdown: Shutdown,
    id: u64,
) -> PairEnd
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    if shutdown.is_triggered() {
        tracing::debug!(stream = id, "forward: shutdown raised; stream dropped");
        return PairEnd::Shutdown;
    }

    let local = match TcpStream::connect(&opts.local_addr).await {
        Ok(c) => c,
        Err(err) => {
            tracing::debug!(stream = id, local = %opts.local_addr, err = %err, "forward: local dial failed");
            drop(stream);
            return PairEnd::DialFailed;
        }
    };
    let _ = local.set_nodelay(true);

    let end = run_pair(stream, local, &opts, &shutdown).await;
    match &end {
        PairEnd::Stream(o) => {
            tracing::debug!(
                stream = id,
                direction = %o.direction,
                end = ?o.end,
                err = ?o.end.error_kind(),
                bytes = o.bytes,
                "forward: pair closed"
            );
        }
        PairEnd::Shutdown => tracing::debug!(stream = id, "forward: pair closed by shutdown"),
        PairEnd::DialFailed => {}
    }
    end
}

/// Runs both copy directions over already-connected endpoints.
///
/// Both endpoints are consumed; every half is dropped exactly once before this
/// returns, whichever way the pair ends.
pub async fn run_pair<R, L>(remote: R, local: L, opts: &ForwardOptions, shutdown: &Shutdown) -> PairEnd
where
    R: AsyncRead + AsyncWrite + Send + 'static,
    L: AsyncRead + AsyncWrite + Send + 'static,
{
    let _active = ActivePairGuard::new();

    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);
    let (mut local_rd, mut local_wr) = tokio::io::split(local);

    // Capacity 2: neither task can block while reporting.
    let (done_tx, mut done_rx) = mpsc::channel::<CopyOutcome>(2);
    let mut tasks = JoinSet::new();

    {
        let done = done_tx.clone();
        let buffer_size = opts.buffer_size;
        let retry = opts.retry.clone();
        tasks.spawn(async move {
            let out = copy_loop(
                Direction::RemoteToLocal,
                &mut remote_rd,
                &mut local_wr,
                buffer_size,
                &retry,
            )
            .await;
            metrics::counter!("catfwd_bytes_remote_to_local_total").increment(out.bytes);
            let _ = done.send(out).await;
        });
    }
    {
        let done = done_tx;
        let buffer_size = opts.buffer_size;
        let retry = opts.retry.clone();
        tasks.spawn(async move {
            let out = copy_loop(
                Direction::LocalToRemote,
                &mut local_rd,
                &mut remote_wr,
                buffer_size,
                &retry,
            )
            .await;
            metrics::counter!("catfwd_bytes_local_to_remote_total").increment(out.bytes);
            if out.end == CopyEnd::Eof {
                // Local half-close: pass it on and leave remote->local running.
                if let Err(err) = remote_wr.shutdown().await {
                    tracing::trace!(err = %err, "forward: remote half-close failed");
                }
                return;
            }
            let _ = done.send(out).await;
        });
    }

    let end = tokio::select! {
        biased;
        _ = shutdown.wait() => PairEnd::Shutdown,
        out = done_rx.recv() => match out {
            Some(out) => PairEnd::Stream(out),
            // Both senders gone without a report: the tasks panicked.
            None => PairEnd::Shutdown,
        },
    };

    // Cancels the sibling and waits until both tasks (and their halves) are gone.
    tasks.shutdown().await;
    end
}
