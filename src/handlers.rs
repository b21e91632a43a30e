//! HTTP admin surface: health, pool statistics and the broadcast ingestion
//! hook used by the producers of canvas updates.

use actix_web::{web, HttpResponse};
use tracing::{debug, info};

use crate::{AppError, AppState, Result};

/// Health check endpoint handler
/// Returns a JSON response with server status, timestamp and live connections
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "connections": state.registry.connection_count(),
    }))
}

pub async fn stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.registry.stats())
}

/// Fan the raw request body out to every connected client.
pub async fn broadcast(
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    if body.is_empty() {
        return Err(AppError::ValidationError("broadcast payload is empty".to_string()));
    }

    let report = state.registry.broadcast(body.to_vec());
    if report.dropped > 0 {
        info!(
            "Broadcast of {} bytes dropped by {} workers",
            body.len(),
            report.dropped
        );
    } else {
        debug!("Broadcast of {} bytes queued on {} workers", body.len(), report.enqueued);
    }

    Ok(HttpResponse::Accepted().json(report))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/stats", web::get().to(stats))
        .route("/broadcast", web::post().to(broadcast));
}
