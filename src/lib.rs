pub mod config;
pub mod error;
pub mod handlers;
pub mod websocket;

use std::sync::Arc;

pub use error::{AdmissionError, AppError, TransportError};
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::{PoolConfig, Settings};
pub use websocket::{Registry, WebSocketServer};

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub registry: Registry,
}

impl AppState {
    /// Build the registry and start its workers. Must be called from
    /// within a tokio runtime.
    pub fn start(config: Settings) -> Self {
        let state = Self::new(config);
        state.registry.start();
        state
    }

    /// Build the registry without starting any worker.
    pub fn new(config: Settings) -> Self {
        let registry = Registry::new(config.pool.clone());
        Self {
            config: Arc::new(config),
            registry,
        }
    }

    pub fn shutdown(&self) {
        self.registry.close();
    }
}
