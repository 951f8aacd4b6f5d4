use std::{io, net::SocketAddr};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
};

use crate::catfwd::tunnel::transport::{BoxedStream, TransportError, TransportSession};

/// yamux over an already-established TCP connection to the relay.
pub struct YamuxSession {
    control: tokio::sync::Mutex<tokio_yamux::Control>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<io::Result<tokio_yamux::StreamHandle>>>,
    ended: watch::Receiver<bool>,
    remote: Option<SocketAddr>,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    pub fn client(c: TcpStream) -> Self {
        let remote = c.peer_addr().ok();
        let session = tokio_yamux::Session::new_client(c, tokio_yamux::Config::default());
        Self::from_session(session, remote)
    }

    fn from_session(mut session: tokio_yamux::Session<TcpStream>, remote: Option<SocketAddr>) -> Self {
        let control = session.control();

        let (tx, rx) = mpsc::channel::<io::Result<tokio_yamux::StreamHandle>>(64);
        let (ended_tx, ended_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                let fatal = next.is_err();
                if let Err(err) = &next {
                    tracing::debug!(err=%err, "tunnel: session error");
                }
                // The acceptor sees the error, then `SessionClosed`.
                if tx.send(next).await.is_err() || fatal {
                    break;
                }
            }
            let _ = ended_tx.send(true);
        });

        Self {
            control: tokio::sync::Mutex::new(control),
            incoming: tokio::sync::Mutex::new(rx),
            ended: ended_rx,
            remote,
            task,
        }
    }
}

#[async_trait]
impl TransportSession for YamuxSession {
    async fn accept_stream(&self) -> Result<BoxedStream, TransportError> {
        let mut rx = self.incoming.lock().await;
        match rx.recv().await {
            Some(Ok(st)) => Ok(Box::new(st)),
            Some(Err(err)) => Err(TransportError::Io(err)),
            None => Err(TransportError::SessionClosed),
        }
    }

    async fn closed(&self) {
        let mut ended = self.ended.clone();
        // A dropped sender also means the driver task is gone.
        let _ = ended.wait_for(|v| *v).await;
    }

    async fn close(&self) {
        self.task.abort();
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

impl Drop for YamuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}
