use std::{io, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{net::TcpStream, sync::watch, task::JoinSet};

use crate::catfwd::{
    net,
    shutdown::Shutdown,
    tunnel::{
        forward::{self, ForwardOptions, PairEnd, RetryPolicy},
        protocol::{Handshake, HandshakeError},
        transport::{TransportError, TransportSession, tcp::YamuxSession},
    },
};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);
const PAIR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to the server {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to the server {addr}: timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Forwarding,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Handshaking => write!(f, "handshaking"),
            SessionState::Forwarding => write!(f, "forwarding"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    RelayDisconnected,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub version: String,
    pub local_host: String,
    pub local_port: u16,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub buffer_size: usize,
}

/// A relay connection that passed the handshake.
#[derive(Debug)]
pub struct Established {
    pub conn: TcpStream,
    pub assigned_port: u16,
}

/// One tunnel session: connect, handshake, then forward until the relay goes
/// away or `shutdown` fires. Never reconnects.
pub struct Client {
    opts: ClientOptions,
    handshake: Handshake,
    shutdown: Shutdown,
    state: watch::Sender<SessionState>,
}

impl Client {
    pub fn new(opts: ClientOptions, shutdown: Shutdown) -> Self {
        let handshake = Handshake::new(&opts.version);
        let (state, _rx) = watch::channel(SessionState::Connecting);
        Self {
            opts,
            handshake,
            shutdown,
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!(server=%self.opts.server_addr, from=%prev, to=%next, "tunnel: session state");
        }
    }

    /// Dials the relay and negotiates the public port.
    pub async fn establish(&self) -> Result<Established, SessionError> {
        self.set_state(SessionState::Connecting);
        let addr = self.opts.server_addr.clone();

        let mut conn = match tokio::time::timeout(self.opts.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(c)) => c,
            Ok(Err(source)) => {
                self.set_state(SessionState::Closed);
                return Err(SessionError::Connect { addr, source });
            }
            Err(_) => {
                self.set_state(SessionState::Closed);
                return Err(SessionError::ConnectTimeout {
                    addr,
                    timeout: self.opts.connect_timeout,
                });
            }
        };
        let _ = conn.set_nodelay(true);

        self.set_state(SessionState::Handshaking);
        match self.handshake.perform(&mut conn, self.opts.handshake_timeout).await {
            Ok(assigned_port) => {
                tracing::debug!(server=%addr, assigned_port, "tunnel: handshake ok");
                Ok(Established {
                    conn,
                    assigned_port,
                })
            }
            Err(err) => {
                tracing::debug!(server=%addr, err=%err, "tunnel: handshake failed");
                self.set_state(SessionState::Closed);
                Err(err.into())
            }
        }
    }

    /// Multiplexes the established connection and forwards streams until the
    /// session ends.
    pub async fn forward(&self, established: Established) -> CloseReason {
        let sess: Arc<dyn TransportSession> = Arc::new(YamuxSession::client(established.conn));
        self.forward_session(sess).await
    }

    pub async fn forward_session(&self, sess: Arc<dyn TransportSession>) -> CloseReason {
        self.set_state(SessionState::Forwarding);
        if let Some(remote) = sess.remote_addr() {
            tracing::debug!(relay=%remote, local_port = self.opts.local_port, "tunnel: accepting streams");
        }

        let fwd = Arc::new(ForwardOptions {
            local_addr: net::local_service_addr(&self.opts.local_host, self.opts.local_port),
            buffer_size: self.opts.buffer_size,
            retry: RetryPolicy::default(),
        });
        let acceptor = tokio::spawn(accept_loop(sess.clone(), fwd, self.shutdown.clone()));

        let reason = tokio::select! {
            _ = sess.closed() => CloseReason::RelayDisconnected,
            _ = self.shutdown.wait() => CloseReason::Shutdown,
        };
        match reason {
            CloseReason::RelayDisconnected => {
                tracing::info!(server=%self.opts.server_addr, "tunnel: relay disconnected")
            }
            CloseReason::Shutdown => tracing::info!("tunnel: shutting down"),
        }

        self.shutdown.trigger();
        sess.close().await;
        if let Err(err) = acceptor.await {
            tracing::warn!(err=%err, "tunnel: acceptor task failed");
        }

        self.set_state(SessionState::Closed);
        reason
    }
}

/// Accepts logical streams and hands each one to its own forwarding pair.
///
/// Returns when `shutdown` fires or the session reports it is closed (which
/// also raises `shutdown`). Other accept errors are retried.
pub async fn accept_loop(sess: Arc<dyn TransportSession>, fwd: Arc<ForwardOptions>, shutdown: Shutdown) {
    let mut pairs: JoinSet<PairEnd> = JoinSet::new();
    let mut next_id = 0u64;
    let mut backoff = ACCEPT_BACKOFF_MIN;

    loop {
        while pairs.try_join_next().is_some() {}

        let st = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            st = sess.accept_stream() => st,
        };

        match st {
            Ok(st) => {
                backoff = ACCEPT_BACKOFF_MIN;
                next_id += 1;
                tracing::debug!(stream = next_id, active = pairs.len(), "tunnel: stream accepted");
                pairs.spawn(forward::forward_stream(st, fwd.clone(), shutdown.clone(), next_id));
            }
            Err(TransportError::SessionClosed) => {
                shutdown.trigger();
                break;
            }
            Err(err) => {
                tracing::debug!(err=%err, backoff=%humantime::format_duration(backoff), "tunnel: accept failed; retrying");
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
            }
        }
    }

    // Pairs observe the same signal; only enforce the cap if one hangs.
    let drain = async { while pairs.join_next().await.is_some() {} };
    if tokio::time::timeout(PAIR_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(remaining = pairs.len(), "tunnel: pairs did not stop in time; aborting");
        pairs.abort_all();
        while pairs.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        net::SocketAddr,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use futures_util::StreamExt;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::catfwd::tunnel::transport::BoxedStream;

    const V: &str = "0.0.0-test";

    fn options(server_addr: SocketAddr, local_port: u16) -> ClientOptions {
        ClientOptions {
            server_addr: server_addr.to_string(),
            version: V.into(),
            local_host: "127.0.0.1".into(),
            local_port,
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            buffer_size: forward::DEFAULT_BUFFER_SIZE,
        }
    }

    async fn spawn_echo() -> u16 {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((c, _)) = ln.accept().await else { return };
                tokio::spawn(async move {
                    let (mut rd, mut wr) = c.into_split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        port
    }

    /// Relay stub that answers the handshake with `reply` and hands back the socket.
    async fn spawn_relay(reply: String) -> (SocketAddr, tokio::task::JoinHandle<TcpStream>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let request = Handshake::new(V).request().to_string();
        let task = tokio::spawn(async move {
            let (mut c, _) = ln.accept().await.unwrap();
            let mut got = vec![0u8; request.len()];
            c.read_exact(&mut got).await.unwrap();
            assert_eq!(got, request.as_bytes());
            c.write_all(reply.as_bytes()).await.unwrap();
            c
        });
        (addr, task)
    }

    struct ScriptedSession {
        script: Mutex<VecDeque<Result<BoxedStream, TransportError>>>,
        accepts: AtomicUsize,
        ended: Shutdown,
    }

    impl ScriptedSession {
        fn new(script: Vec<Result<BoxedStream, TransportError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                accepts: AtomicUsize::new(0),
                ended: Shutdown::new(),
            }
        }
    }

    #[async_trait]
    impl TransportSession for ScriptedSession {
        async fn accept_stream(&self) -> Result<BoxedStream, TransportError> {
            self.accepts.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(r) => r,
                None => {
                    self.ended.wait().await;
                    Err(TransportError::SessionClosed)
                }
            }
        }

        async fn closed(&self) {
            self.ended.wait().await
        }

        async fn close(&self) {
            self.ended.trigger();
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    #[tokio::test]
    async fn end_to_end_echo_through_relay() {
        let echo_port = spawn_echo().await;
        let success = format!("{}40000\n", Handshake::new(V).success_prefix());
        let (relay_addr, relay_task) = spawn_relay(success).await;

        let client = Arc::new(Client::new(options(relay_addr, echo_port), Shutdown::new()));
        let est = client.establish().await.expect("establish");
        assert_eq!(est.assigned_port, 40000);
        assert_eq!(client.state(), SessionState::Handshaking);

        let forwarding = tokio::spawn({
            let client = client.clone();
            async move { client.forward(est).await }
        });

        // Relay side: multiplex the same socket and open a stream for a peer.
        let relay_conn = relay_task.await.unwrap();
        let mut session = tokio_yamux::Session::new_server(relay_conn, tokio_yamux::Config::default());
        let mut control = session.control();
        let driver = tokio::spawn(async move { while let Some(Ok(_)) = session.next().await {} });

        let mut peer = control.open_stream().await.expect("open stream");
        peer.write_all(b"hello world").await.unwrap();
        let mut got = [0u8; 11];
        tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut got))
            .await
            .expect("echo in time")
            .unwrap();
        assert_eq!(&got, b"hello world");

        // Relay goes away: the client unwinds on its own.
        driver.abort();
        drop(peer);
        drop(control);
        let reason = tokio::time::timeout(Duration::from_secs(5), forwarding)
            .await
            .expect("client should notice the disconnect")
            .unwrap();
        assert_eq!(reason, CloseReason::RelayDisconnected);
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn capacity_rejection_is_reported() {
        let (relay_addr, _relay) = spawn_relay(Handshake::new(V).capacity_exceeded().to_string()).await;
        let client = Client::new(options(relay_addr, 1), Shutdown::new());

        let err = client.establish().await.unwrap_err();
        assert!(matches!(err, SessionError::Handshake(HandshakeError::CapacityExceeded)));
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn version_mismatch_fails_handshake() {
        let reply = format!("{}40000\n", Handshake::new("9.9.9").success_prefix());
        let (relay_addr, _relay) = spawn_relay(reply).await;
        let client = Client::new(options(relay_addr, 1), Shutdown::new());

        let err = client.establish().await.unwrap_err();
        assert!(matches!(err, SessionError::Handshake(HandshakeError::Failed(_))));
    }

    #[tokio::test]
    async fn unreachable_relay_is_a_connect_error() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);

        let client = Client::new(options(addr, 1), Shutdown::new());
        let err = client.establish().await.unwrap_err();
        assert!(matches!(err, SessionError::Connect { .. }));
        assert!(err.to_string().contains("failed to connect to the server"));
    }

    #[tokio::test]
    async fn accept_errors_do_not_stop_the_loop() {
        let echo_port = spawn_echo().await;
        let (mut peer, remote) = tokio::io::duplex(1024);
        let sess = Arc::new(ScriptedSession::new(vec![
            Err(TransportError::Io(io::ErrorKind::ConnectionReset.into())),
            Err(TransportError::Io(io::ErrorKind::Other.into())),
            Ok(Box::new(remote) as BoxedStream),
        ]));
        let fwd = Arc::new(ForwardOptions {
            local_addr: format!("127.0.0.1:{echo_port}"),
            buffer_size: 1024,
            retry: RetryPolicy::default(),
        });
        let shutdown = Shutdown::new();

        let acceptor = tokio::spawn(accept_loop(sess.clone(), fwd, shutdown.clone()));

        // The stream accepted after two failures is serviced.
        peer.write_all(b"still here").await.unwrap();
        let mut got = [0u8; 10];
        peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"still here");

        // Session closed: shutdown is raised and the loop drains the pair.
        sess.close().await;
        tokio::time::timeout(Duration::from_secs(2), acceptor)
            .await
            .expect("acceptor should stop")
            .unwrap();
        assert!(shutdown.is_triggered());
        assert_eq!(sess.accepts.load(Ordering::SeqCst), 4);
        assert_eq!(peer.read(&mut got).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn raised_shutdown_prevents_further_accepts() {
        let (_peer, remote) = tokio::io::duplex(64);
        let sess = Arc::new(ScriptedSession::new(vec![Ok(Box::new(remote) as BoxedStream)]));
        let fwd = Arc::new(ForwardOptions {
            local_addr: "127.0.0.1:1".into(),
            buffer_size: 1024,
            retry: RetryPolicy::default(),
        });
        let shutdown = Shutdown::new();
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), accept_loop(sess.clone(), fwd, shutdown))
            .await
            .expect("acceptor should exit at once");
        assert_eq!(sess.accepts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn session_end_unwinds_forwarding() {
        let sess = Arc::new(ScriptedSession::new(vec![]));
        let shutdown = Shutdown::new();
        let client = Arc::new(Client::new(
            options("127.0.0.1:7000".parse().unwrap(), 1),
            shutdown.clone(),
        ));

        let forwarding = tokio::spawn({
            let client = client.clone();
            let sess = sess.clone();
            async move { client.forward_session(sess).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.state(), SessionState::Forwarding);
        sess.ended.trigger();

        let reason = tokio::time::timeout(Duration::from_secs(2), forwarding)
            .await
            .expect("forwarding should end")
            .unwrap();
        assert_eq!(reason, CloseReason::RelayDisconnected);
        assert!(shutdown.is_triggered());
    }
}
