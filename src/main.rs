use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use canvas_fanout::{handlers, AppError, AppState, Settings, WebSocketServer};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> canvas_fanout::Result<()> {
    // Load environment variables
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = Settings::new()?;
    info!(
        "Configuration loaded: {} workers x {} connections",
        config.pool.workers, config.pool.max_connections_per_worker
    );

    let state = AppState::start(config.clone());

    let ws_listener = TcpListener::bind((config.server.host.as_str(), config.server.ws_port)).await?;
    let ws_server = Arc::new(WebSocketServer::new(
        state.registry.clone(),
        config.pool.websocket_config(),
    ));
    let ws_task = tokio::spawn(async move {
        if let Err(e) = ws_server.run(ws_listener).await {
            error!("WebSocket listener failed: {}", e);
        }
    });

    info!("Starting admin server at {}:{}", config.server.host, config.server.port);

    let data = web::Data::new(state.clone());
    let result = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .configure(handlers::configure)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .workers(config.server.workers as usize)
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()));

    // HttpServer returns once it has handled SIGINT/SIGTERM
    info!("Admin server stopped, closing registry");
    ws_task.abort();
    state.shutdown();

    result
}
