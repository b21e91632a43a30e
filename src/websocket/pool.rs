use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::PoolConfig;
use super::worker::{Worker, WorkerStats};

/// Pool-wide gauges, shared with every worker.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    active_connections: AtomicUsize,
    total_messages: AtomicU64,
    dropped_messages: AtomicU64,
}

impl PoolMetrics {
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub(crate) fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn record_message(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub active_connections: usize,
    pub capacity: usize,
    pub total_messages: u64,
    pub dropped_messages: u64,
    pub workers: Vec<WorkerStats>,
}

/// Fixed set of workers, sized once at startup.
pub struct WorkerPool {
    config: Arc<PoolConfig>,
    workers: Vec<Arc<Worker>>,
    metrics: Arc<PoolMetrics>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// `registry_connections` is the owning registry's global counter; the
    /// workers keep it in step with their own gauges.
    pub fn new(config: PoolConfig, registry_connections: Arc<AtomicUsize>) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(PoolMetrics::default());
        let shutdown = CancellationToken::new();

        let workers = (0..config.workers)
            .map(|id| {
                Arc::new(Worker::new(
                    id,
                    config.clone(),
                    metrics.clone(),
                    registry_connections.clone(),
                    shutdown.child_token(),
                ))
            })
            .collect();

        Self {
            config,
            workers,
            metrics,
            shutdown,
        }
    }

    /// Spawn every worker's background task that is not running yet.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let handles: Vec<_> = self.workers.iter().filter_map(|w| w.spawn()).collect();
        info!("Started {} of {} workers", handles.len(), self.workers.len());
        handles
    }

    /// Signal every worker. Does not wait for them.
    pub fn shutdown(&self) {
        info!("Shutting down {} workers", self.workers.len());
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn worker(&self, id: usize) -> Option<&Arc<Worker>> {
        self.workers.get(id)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity()
    }

    /// Least-loaded worker with a free slot; ties go to the lowest id.
    /// The slot is claimed atomically, so a concurrent pick that loses the
    /// race rescans instead of overfilling the worker.
    pub(crate) fn reserve_least_loaded(&self) -> Option<Arc<Worker>> {
        let max = self.config.max_connections_per_worker;
        loop {
            let mut selected: Option<&Arc<Worker>> = None;
            let mut min_clients = max;
            for worker in &self.workers {
                let active = worker.metrics().active_connections();
                if active < min_clients {
                    min_clients = active;
                    selected = Some(worker);
                }
            }

            let worker = selected?;
            if worker.try_reserve() {
                return Some(worker.clone());
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active_connections: self.metrics.active_connections(),
            capacity: self.capacity(),
            total_messages: self.metrics.total_messages(),
            dropped_messages: self.metrics.dropped_messages(),
            workers: self.workers.iter().map(|w| w.stats()).collect(),
        }
    }
}
