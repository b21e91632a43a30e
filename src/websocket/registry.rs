use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

use crate::config::PoolConfig;
use crate::error::AdmissionError;
use super::close_signal::CloseSignal;
use super::connection::{Connection, ConnectionId, EvictReason};
use super::pool::{PoolStats, WorkerPool};
use super::worker::{Enqueue, Frame, Worker};

/// Entry point for the rest of the backend: admits connections, evicts
/// them and broadcasts to all of them.
///
/// Cheap to clone; every clone talks to the same pool.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    pool: WorkerPool,
    connections: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

/// A claimed slot on a worker. Dropping it without attaching a transport
/// gives the slot back.
#[must_use = "an unattached slot is released when dropped"]
pub struct Slot {
    worker: Arc<Worker>,
    armed: bool,
}

impl Slot {
    pub fn worker_id(&self) -> usize {
        self.worker.id()
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.armed {
            debug!("Releasing unused slot on worker {}", self.worker.id());
            self.worker.release();
        }
    }
}

/// Outcome of one broadcast, for logging and tests. The broadcast itself
/// never fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub enqueued: usize,
    pub dropped: usize,
}

impl Registry {
    /// Build the pool. Workers are not running until `start` is called.
    pub fn new(config: PoolConfig) -> Self {
        let connections = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::new(config, connections.clone());
        Self {
            inner: Arc::new(RegistryInner {
                pool,
                connections,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.inner.pool.start()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Global number of admitted connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Pick the least-loaded worker and claim a slot on it without touching
    /// the transport, so a refused caller can still close it cleanly.
    pub fn reserve(&self) -> Result<Slot, AdmissionError> {
        let pool = &self.inner.pool;
        if pool.is_shut_down() {
            return Err(AdmissionError::ShuttingDown);
        }

        match pool.reserve_least_loaded() {
            Some(worker) => Ok(Slot {
                worker,
                armed: true,
            }),
            None => {
                error!("failed to choose worker for client");
                Err(AdmissionError::CapacityExhausted {
                    workers: pool.workers().len(),
                    per_worker: pool.config().max_connections_per_worker,
                })
            }
        }
    }

    /// Bind a transport to a reserved slot and start its loops.
    ///
    /// The slot stays armed until the connection is mapped and running, so
    /// dropping this future while it waits on the map lock gives the slot
    /// back instead of leaking it.
    pub async fn attach<S>(&self, slot: Slot, ws: WebSocketStream<S>) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let worker = slot.worker.clone();

        let id = ConnectionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (sink, stream) = ws.split();
        let conn = Arc::new(Connection::new(
            id,
            worker.id(),
            Box::pin(sink),
            CloseSignal::new(worker.connection_token()),
            worker.config().write_timeout(),
        ));

        worker.connections().insert(conn.clone()).await;
        debug!("client {} assigned to worker {}", id, worker.id());

        conn.start(worker.clone(), stream.boxed(), worker.subscribe_pings());
        slot.disarm();
        conn
    }

    /// Admit a connection onto the least-loaded worker. On refusal the
    /// transport is dropped; use `reserve` + `attach` to keep it.
    pub async fn add<S>(&self, ws: WebSocketStream<S>) -> Result<Arc<Connection>, AdmissionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let slot = self.reserve()?;
        Ok(self.attach(slot, ws).await)
    }

    /// Evict a connection. Safe to call any number of times, from any
    /// task; only the first call has an effect.
    pub async fn remove(&self, conn: &Arc<Connection>) -> bool {
        match self.inner.pool.worker(conn.worker_id()) {
            Some(worker) => worker.evict(conn, EvictReason::Removed).await,
            None => false,
        }
    }

    /// Offer a payload to every worker queue without blocking. Workers
    /// whose queue is full miss this message.
    pub fn broadcast(&self, payload: impl Into<Vec<u8>>) -> BroadcastReport {
        let pool = &self.inner.pool;
        pool.metrics().record_message();

        let frame: Frame = Arc::new(Message::Binary(payload.into()));
        let mut report = BroadcastReport::default();
        for worker in pool.workers() {
            match worker.enqueue(frame.clone()) {
                Enqueue::Accepted => report.enqueued += 1,
                Enqueue::Dropped => report.dropped += 1,
            }
        }
        report
    }

    /// Signal all workers to stop. Returns immediately; connections tear
    /// themselves down as their loops notice.
    pub fn close(&self) {
        info!(
            "Closing registry with {} active connections",
            self.connection_count()
        );
        self.inner.pool.shutdown();
    }
}
