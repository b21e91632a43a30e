//! WebSocket fan-out core
//!
//! Connections are sharded across a fixed pool of workers. Each worker
//! drains its own bounded broadcast queue, drives pings for its
//! connections and evicts the ones that stop answering.

mod close_signal;
mod connection;
mod pool;
mod registry;
mod server;
mod worker;

pub use close_signal::CloseState;
pub use connection::{Connection, ConnectionId, EvictReason};
pub use pool::{PoolMetrics, PoolStats, WorkerPool};
pub use registry::{BroadcastReport, Registry, Slot};
pub use server::WebSocketServer;
pub use worker::{ConnectionMap, Enqueue, Frame, Worker, WorkerMetrics, WorkerStats};
