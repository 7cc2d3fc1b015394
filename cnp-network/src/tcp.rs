//! TCP transport.
//!
//! One listener task accepts inbound streams and spawns a reader per
//! connection. Outbound traffic goes through one writer task per
//! destination, fed by a bounded queue; the writer connects on first use and
//! keeps the stream for later frames. A failed connect or write ends the
//! writer and reports the destination as unreachable. The next send to that
//! destination starts a fresh writer.

use crate::connection::ConnectionBuffer;
use crate::frame::encode_frame;
use crate::transport::{Transport, TransportEvent};
use bytes::Bytes;
use cnp_core::{NodeId, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Frames buffered per destination before new ones are dropped.
    pub peer_queue_depth: usize,
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(2),
            peer_queue_depth: 1024,
            event_capacity: 4096,
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

struct Inner {
    config: TransportConfig,
    local_addr: SocketAddr,
    writers: Mutex<HashMap<NodeId, mpsc::Sender<Bytes>>>,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
    acceptor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TcpTransport {
    /// Bind the listener and start accepting. Inbound frames and send
    /// failures are delivered on the returned receiver.
    pub async fn bind(
        addr: SocketAddr,
        config: TransportConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);

        let acceptor = tokio::spawn(accept_loop(listener, events_tx.clone()));
        info!(
            target: "canopy::transport",
            addr = %local_addr,
            "Transport listening"
        );

        let inner = Arc::new(Inner {
            config,
            local_addr,
            writers: Mutex::new(HashMap::new()),
            events: events_tx,
        });

        Ok((
            Self {
                inner,
                acceptor: Arc::new(Mutex::new(Some(acceptor))),
            },
            events_rx,
        ))
    }

    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Stop accepting and close every outbound writer.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.inner
            .writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(
            target: "canopy::transport",
            addr = %self.inner.local_addr,
            "Transport stopped"
        );
    }

    fn spawn_writer(&self, peer: NodeId) -> mpsc::Sender<Bytes> {
        let (tx, rx) = mpsc::channel(self.inner.config.peer_queue_depth);
        tokio::spawn(write_loop(Arc::clone(&self.inner), peer, rx));
        tx
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: &NodeId, payload: Bytes) {
        let mut writers = self
            .inner
            .writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let result = match writers.get(to) {
            Some(tx) => tx.try_send(payload),
            None => Err(TrySendError::Closed(payload)),
        };

        match result {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => {
                cnp_metrics::increment_send_failures();
                warn!(
                    target: "canopy::transport",
                    peer = %to,
                    "Peer queue full, dropping frame"
                );
            },
            Err(TrySendError::Closed(payload)) => {
                let tx = self.spawn_writer(*to);
                // A fresh queue always has room for one frame.
                let _ = tx.try_send(payload);
                writers.insert(*to, tx);
            },
        }
    }

    fn forget(&self, peer: &NodeId) {
        self.inner
            .writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::Sender<TransportEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(target: "canopy::transport", error = %e, "set_nodelay failed");
                }
                tokio::spawn(read_loop(stream, remote, events.clone()));
            },
            Err(e) => {
                warn!(target: "canopy::transport", error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            },
        }
    }
}

async fn read_loop(mut stream: TcpStream, remote: SocketAddr, events: mpsc::Sender<TransportEvent>) {
    cnp_metrics::increment_connections();
    debug!(target: "canopy::transport", remote = %remote, "Inbound connection");

    let mut buffer = ConnectionBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    'read: loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(target: "canopy::transport", remote = %remote, error = %e, "Read failed");
                break;
            },
        };
        buffer.extend(&chunk[..n]);

        loop {
            match buffer.next_frame() {
                Ok(Some(payload)) => {
                    cnp_metrics::increment_frames_received();
                    if events.send(TransportEvent::Frame(payload)).await.is_err() {
                        break 'read;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        target: "canopy::transport",
                        remote = %remote,
                        error = %e,
                        "Dropping connection after framing error"
                    );
                    break 'read;
                },
            }
        }
        buffer.compact();
    }

    cnp_metrics::decrement_connections();
}

async fn connect(config: &TransportConfig, addr: SocketAddr) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        },
        Ok(Err(e)) => Err(e),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "Connection timeout",
        )),
    }
}

async fn write_loop(inner: Arc<Inner>, peer: NodeId, mut rx: mpsc::Receiver<Bytes>) {
    let mut stream = match connect(&inner.config, peer.addr()).await {
        Ok(stream) => {
            debug!(target: "canopy::transport", peer = %peer, "Connected to peer");
            stream
        },
        Err(e) => {
            warn!(
                target: "canopy::transport",
                peer = %peer,
                error = %e,
                "Failed to connect to peer"
            );
            report_unreachable(&inner, peer).await;
            return;
        },
    };

    while let Some(payload) = rx.recv().await {
        let frame = match encode_frame(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "canopy::transport", peer = %peer, error = %e, "Frame rejected");
                continue;
            },
        };

        match tokio::time::timeout(inner.config.write_timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => cnp_metrics::increment_frames_sent(),
            Ok(Err(e)) => {
                warn!(target: "canopy::transport", peer = %peer, error = %e, "Write failed");
                report_unreachable(&inner, peer).await;
                return;
            },
            Err(_) => {
                warn!(target: "canopy::transport", peer = %peer, "Write timeout");
                report_unreachable(&inner, peer).await;
                return;
            },
        }
    }
}

async fn report_unreachable(inner: &Inner, peer: NodeId) {
    cnp_metrics::increment_send_failures();
    let _ = inner.events.send(TransportEvent::Unreachable(peer)).await;
}
