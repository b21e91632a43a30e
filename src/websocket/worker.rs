//! A worker owns one shard of the connection population: its own map, its
//! own bounded message queue and one background task that drains the queue,
//! drives the ping schedule and sweeps stale connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use super::connection::{Connection, ConnectionId, EvictReason};
use super::pool::PoolMetrics;

/// A broadcast frame, encoded once and shared by every worker queue.
pub type Frame = Arc<Message>;

/// Connections of one worker. All access goes through these methods so the
/// lock is never held across a network write.
#[derive(Debug, Default)]
pub struct ConnectionMap {
    pub(super) inner: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, conn: Arc<Connection>) {
        self.inner.write().await.insert(conn.id(), conn);
    }

    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.write().await.remove(&id)
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Connections whose close signal has not fired, copied out under the
    /// read lock.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner
            .read()
            .await
            .values()
            .filter(|conn| conn.is_open())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct WorkerMetrics {
    active_connections: AtomicUsize,
    accepted_messages: AtomicU64,
    dropped_messages: AtomicU64,
}

impl WorkerMetrics {
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn accepted_messages(&self) -> u64 {
        self.accepted_messages.load(Ordering::Relaxed)
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Claim one connection slot unless the worker is already at `max`.
    fn try_reserve(&self, max: usize) -> bool {
        self.active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    fn release(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WorkerStats {
    pub id: usize,
    pub active_connections: usize,
    pub accepted_messages: u64,
    pub dropped_messages: u64,
    pub queued_messages: usize,
}

/// Result of offering a frame to a worker queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    Dropped,
}

pub struct Worker {
    id: usize,
    config: Arc<PoolConfig>,
    connections: ConnectionMap,
    metrics: WorkerMetrics,
    pool_metrics: Arc<PoolMetrics>,
    registry_connections: Arc<AtomicUsize>,
    messages: mpsc::Sender<Frame>,
    receiver: StdMutex<Option<mpsc::Receiver<Frame>>>,
    ping_ticks: watch::Sender<u64>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        id: usize,
        config: Arc<PoolConfig>,
        pool_metrics: Arc<PoolMetrics>,
        registry_connections: Arc<AtomicUsize>,
        shutdown: CancellationToken,
    ) -> Self {
        let (messages, receiver) = mpsc::channel(config.queue_capacity);
        let (ping_ticks, _) = watch::channel(0);
        Self {
            id,
            config,
            connections: ConnectionMap::new(),
            metrics: WorkerMetrics::default(),
            pool_metrics,
            registry_connections,
            messages,
            receiver: StdMutex::new(Some(receiver)),
            ping_ticks,
            shutdown,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub fn connections(&self) -> &ConnectionMap {
        &self.connections
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            active_connections: self.metrics.active_connections(),
            accepted_messages: self.metrics.accepted_messages(),
            dropped_messages: self.metrics.dropped_messages(),
            queued_messages: self.config.queue_capacity - self.messages.capacity(),
        }
    }

    /// Claim a connection slot. On success the worker, pool and registry
    /// gauges have all been incremented.
    pub(crate) fn try_reserve(&self) -> bool {
        if !self.metrics.try_reserve(self.config.max_connections_per_worker) {
            return false;
        }
        self.pool_metrics.connection_opened();
        self.registry_connections.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Undo one `try_reserve`.
    pub(crate) fn release(&self) {
        self.metrics.release();
        self.pool_metrics.connection_closed();
        self.registry_connections.fetch_sub(1, Ordering::AcqRel);
    }

    /// Token for a new connection's loops; cancelled on worker shutdown.
    pub(crate) fn connection_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub(crate) fn subscribe_pings(&self) -> watch::Receiver<u64> {
        self.ping_ticks.subscribe()
    }

    /// Non-blocking offer. A full or closed queue counts a drop for this
    /// worker and the pool; the frame is not retried.
    pub fn enqueue(&self, frame: Frame) -> Enqueue {
        match self.messages.try_send(frame) {
            Ok(()) => {
                self.metrics.accepted_messages.fetch_add(1, Ordering::Relaxed);
                Enqueue::Accepted
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.record_drop();
                error!("Worker {} queue full, dropping message", self.id);
                Enqueue::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.record_drop();
                warn!("Worker {} is stopped, dropping message", self.id);
                Enqueue::Dropped
            }
        }
    }

    fn record_drop(&self) {
        self.metrics.dropped_messages.fetch_add(1, Ordering::Relaxed);
        self.pool_metrics.record_dropped();
    }

    /// The single teardown path. Returns false if another path already
    /// removed the connection.
    pub async fn evict(&self, conn: &Arc<Connection>, reason: EvictReason) -> bool {
        if !conn.close_signal().fire() {
            return false;
        }

        self.connections.remove(conn.id()).await;
        self.release();

        match reason {
            EvictReason::Stale => info!(
                "Cleaned up inactive client {} on worker {} (idle {:?})",
                conn.id(),
                self.id,
                conn.idle_for()
            ),
            _ => info!(
                "Removed client {} from worker {} ({})",
                conn.id(),
                self.id,
                reason
            ),
        }
        true
    }

    /// Evict every connection idle for longer than the configured threshold.
    pub async fn sweep_stale(&self) -> usize {
        let threshold = self.config.stale_after();
        let stale: Vec<_> = self
            .connections
            .snapshot()
            .await
            .into_iter()
            .filter(|conn| conn.idle_for() > threshold)
            .collect();

        let mut removed = 0;
        for conn in &stale {
            if self.evict(conn, EvictReason::Stale).await {
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Worker {} cleaned up {} inactive clients", self.id, removed);
        }
        removed
    }

    /// Deliver a batch to every live connection, in queue order. The map
    /// lock is only held while taking the snapshot. A client whose write
    /// fails is evicted and skipped for the rest of the batch, so one wedged
    /// client costs at most one write timeout per pass. Returns the number
    /// of clients evicted this way.
    pub async fn send_batch(&self, batch: &[Frame]) -> usize {
        let mut clients = self.connections.snapshot().await;
        debug!(
            "Worker {} sending batch of {} messages to {} clients",
            self.id,
            batch.len(),
            clients.len()
        );

        let mut failures = 0;
        for frame in batch {
            let mut failed = Vec::new();
            for client in &clients {
                if let Err(e) = client.send(frame).await {
                    debug!("failed to send a message to client {}: {}", client.id(), e);
                    failed.push(client.clone());
                }
            }
            if failed.is_empty() {
                continue;
            }

            for client in &failed {
                self.evict(client, EvictReason::WriteFailed).await;
            }
            failures += failed.len();
            clients.retain(|client| client.is_open());
        }
        failures
    }

    /// Start the background task. Returns `None` if it was already started.
    pub fn spawn(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        Some(tokio::spawn(self.clone().run(receiver)))
    }

    async fn run(self: Arc<Self>, receiver: mpsc::Receiver<Frame>) {
        info!("Worker {} started", self.id);
        // A slow fan-out pass must not hold back the ping schedule.
        tokio::join!(self.drain(receiver), self.keep_alive());
        info!("Worker {} stopped", self.id);
    }

    async fn drain(&self, mut receiver: mpsc::Receiver<Frame>) {
        let batch_size = self.config.batch_size;
        let mut batch = Vec::with_capacity(batch_size);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = receiver.recv_many(&mut batch, batch_size) => {
                    if received == 0 {
                        break;
                    }
                    self.send_batch(&batch).await;
                    batch.clear();
                }
            }
        }

        receiver.close();
    }

    /// Publishes ping ticks and runs the stale sweep.
    async fn keep_alive(&self) {
        let ping_every = self.config.ping_interval();
        let sweep_every = self.config.sweep_interval();
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        let mut sweep = interval_at(Instant::now() + sweep_every, sweep_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ping.tick() => {
                    self.ping_ticks.send_modify(|tick| *tick = tick.wrapping_add(1));
                }
                _ = sweep.tick() => {
                    self.sweep_stale().await;
                }
            }
        }
    }
}
