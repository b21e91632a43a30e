use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tracing::{debug, error, info, warn};

use crate::error::{AppError, TransportError};
use super::{Connection, Registry};

/// Accepts raw sockets, performs the websocket handshake and hands the
/// result to the registry. Token validation happens in front of this
/// listener.
pub struct WebSocketServer {
    registry: Registry,
    ws_config: WebSocketConfig,
}

impl WebSocketServer {
    pub fn new(registry: Registry, ws_config: WebSocketConfig) -> Self {
        Self {
            registry,
            ws_config,
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("WebSocket listener ready on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, &addr.to_string()).await {
                    debug!("Connection from {} not admitted: {}", addr, e);
                }
            });
        }
    }

    /// Handshake and admit one socket. A refused client is sent a close
    /// frame with code 1013 before the admission error is returned.
    pub async fn handle_connection<S>(
        &self,
        raw_stream: S,
        peer: &str,
    ) -> crate::Result<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut ws_stream =
            match tokio_tungstenite::accept_async_with_config(raw_stream, Some(self.ws_config)).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("Error during WebSocket handshake with {}: {}", peer, e);
                    return Err(TransportError::from(e).into());
                }
            };

        match self.registry.reserve() {
            Ok(slot) => {
                let conn = self.registry.attach(slot, ws_stream).await;
                info!("New WebSocket connection {} from {}", conn.id(), peer);
                Ok(conn)
            }
            Err(e) => {
                warn!("Refusing connection from {}: {}", peer, e);
                let frame = CloseFrame {
                    code: CloseCode::Again,
                    reason: e.to_string().into(),
                };
                if let Err(close_err) = ws_stream.close(Some(frame)).await {
                    error!("Error closing refused connection from {}: {}", peer, close_err);
                }
                Err(AppError::from(e))
            }
        }
    }
}
