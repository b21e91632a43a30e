use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use super::close_signal::{CloseSignal, CloseState};
use super::worker::Worker;

pub type WsSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
pub type WsStream = BoxStream<'static, Result<Message, tungstenite::Error>>;

/// Unique connection identifier, allocated by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a connection left its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    ClientClosed,
    ReadError,
    ReadTimeout,
    FrameTooLarge,
    PingFailed,
    WriteFailed,
    Stale,
    Removed,
    Shutdown,
}

impl EvictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictReason::ClientClosed => "client_closed",
            EvictReason::ReadError => "read_error",
            EvictReason::ReadTimeout => "read_timeout",
            EvictReason::FrameTooLarge => "frame_too_large",
            EvictReason::PingFailed => "ping_failed",
            EvictReason::WriteFailed => "write_failed",
            EvictReason::Stale => "stale",
            EvictReason::Removed => "removed",
            EvictReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live client owned by exactly one worker.
///
/// The write half of the transport sits behind a mutex shared by the
/// worker's fan-out pass and the connection's own ping loop. The read half
/// is moved into the read loop when the connection is started.
pub struct Connection {
    id: ConnectionId,
    worker_id: usize,
    sink: Mutex<WsSink>,
    close: CloseSignal,
    epoch: Instant,
    /// Milliseconds since `epoch` at the last pong.
    last_seen_ms: AtomicU64,
    write_timeout: Duration,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        worker_id: usize,
        sink: WsSink,
        close: CloseSignal,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            worker_id,
            sink: Mutex::new(sink),
            close,
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
            write_timeout,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn state(&self) -> CloseState {
        self.close.state()
    }

    pub fn is_open(&self) -> bool {
        self.close.is_open()
    }

    pub(crate) fn close_signal(&self) -> &CloseSignal {
        &self.close
    }

    /// Record a liveness acknowledgement.
    pub fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_seen_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    pub fn last_seen(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_seen_ms.load(Ordering::Acquire))
    }

    /// Time since the last liveness acknowledgement (or since admission).
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_seen())
    }

    /// Write one frame with the write deadline applied. The deadline also
    /// covers waiting for the sink, so a wedged ping cannot stall a fan-out
    /// pass indefinitely.
    pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if !self.close.is_open() {
            return Err(TransportError::Closed);
        }

        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(message.clone()).await
        };

        match timeout(self.write_timeout, write).await {
            Ok(result) => result.map_err(|e| {
                error!("Failed writing to client {}: {}", self.id, e);
                TransportError::from(e)
            }),
            Err(_) => {
                error!("Write to client {} timed out after {:?}", self.id, self.write_timeout);
                Err(TransportError::WriteTimeout(self.write_timeout))
            }
        }
    }

    pub async fn ping(&self) -> Result<(), TransportError> {
        self.send(&Message::Ping(Vec::new())).await
    }

    async fn close_transport(&self) {
        let close = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };

        match timeout(self.write_timeout, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let err = TransportError::from(e);
                if !err.is_expected_close() {
                    warn!("Error closing transport for client {}: {}", self.id, err);
                }
            }
            Err(_) => warn!("Closing transport for client {} timed out", self.id),
        }
        self.close.mark_closed();
    }

    /// Spawn the read loop and the write/ping loop.
    pub(crate) fn start(
        self: &Arc<Self>,
        worker: Arc<Worker>,
        stream: WsStream,
        ticks: watch::Receiver<u64>,
    ) {
        tokio::spawn(read_loop(self.clone(), worker.clone(), stream));
        tokio::spawn(write_loop(self.clone(), worker, ticks));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("worker_id", &self.worker_id)
            .field("state", &self.close.state())
            .finish()
    }
}

/// Reads until the transport fails or the close signal fires. Clients only
/// send liveness acknowledgements; data frames are tolerated up to the
/// frame cap and otherwise ignored.
async fn read_loop(conn: Arc<Connection>, worker: Arc<Worker>, mut stream: WsStream) {
    let pong_wait = worker.config().pong_wait();
    let max_frame = worker.config().max_frame_bytes;
    let mut deadline = Instant::now() + pong_wait;

    let reason = loop {
        let next = tokio::select! {
            _ = conn.close.cancelled() => break None,
            next = timeout_at(deadline, stream.next()) => next,
        };

        match next {
            Err(_) => {
                warn!("Client {} missed its pong deadline of {:?}", conn.id, pong_wait);
                break Some(EvictReason::ReadTimeout);
            }
            Ok(None) => break Some(EvictReason::ClientClosed),
            Ok(Some(Ok(Message::Pong(_)))) => {
                deadline = Instant::now() + pong_wait;
                conn.touch();
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                debug!("Client {} sent close frame: {:?}", conn.id, frame);
                break Some(EvictReason::ClientClosed);
            }
            Ok(Some(Ok(message))) => {
                let size = message.len();
                if size > max_frame {
                    error!(
                        "Client {} sent a {} byte frame, limit is {}",
                        conn.id, size, max_frame
                    );
                    break Some(EvictReason::FrameTooLarge);
                }
                debug!("Ignoring {} byte frame from client {}", size, conn.id);
            }
            Ok(Some(Err(e))) => {
                let err = TransportError::from(e);
                if err.is_expected_close() {
                    debug!("Client {} went away: {}", conn.id, err);
                } else {
                    error!("read error on client {}: {}", conn.id, err);
                }
                break Some(EvictReason::ReadError);
            }
        }
    };

    if let Some(reason) = reason {
        worker.evict(&conn, reason).await;
    }
}

/// Pings on every worker tick. Owns transport teardown: whichever path
/// ends the connection, this loop is the one that closes the sink.
async fn write_loop(conn: Arc<Connection>, worker: Arc<Worker>, mut ticks: watch::Receiver<u64>) {
    loop {
        tokio::select! {
            _ = conn.close.cancelled() => {
                debug!("Writer closing for client {}", conn.id);
                break;
            }
            changed = ticks.changed() => {
                if changed.is_err() {
                    debug!("Ping schedule for client {} ended", conn.id);
                    break;
                }
                if let Err(e) = conn.ping().await {
                    error!("Failed to send ping to client {}: {}", conn.id, e);
                    worker.evict(&conn, EvictReason::PingFailed).await;
                    break;
                }
                debug!("Sent ping to client {}", conn.id);
            }
        }
    }

    // No-op unless the worker shut down underneath us.
    worker.evict(&conn, EvictReason::Shutdown).await;
    conn.close_transport().await;
    info!("Closed writer for client {}", conn.id);
}
